//! State errors

use sneed::{db::error as db, env::error as env, rwtxn::error as rwtxn};
use thiserror::Error;
use transitive::Transitive;

use crate::{
    math::cpmm::CpmmError,
    state::competition::{Status, Verdict},
    types::{Address, CompetitionId},
};

#[derive(Debug, Error, Transitive)]
#[transitive(from(db::Clear, db::Error))]
#[transitive(from(db::Delete, db::Error))]
#[transitive(from(db::Error, sneed::Error))]
#[transitive(from(db::IterInit, db::Error))]
#[transitive(from(db::IterItem, db::Error))]
#[transitive(from(db::Put, db::Error))]
#[transitive(from(db::TryGet, db::Error))]
#[transitive(from(env::CreateDb, env::Error))]
#[transitive(from(env::Error, sneed::Error))]
#[transitive(from(env::ReadTxn, env::Error))]
#[transitive(from(env::WriteTxn, env::Error))]
#[transitive(from(rwtxn::Commit, rwtxn::Error))]
#[transitive(from(rwtxn::Error, sneed::Error))]
pub enum Error {
    #[error("competition {id} not found")]
    NotFound { id: CompetitionId },
    #[error("competition {id} is {status}, cannot {operation}")]
    InvalidStatus {
        id: CompetitionId,
        status: Status,
        operation: &'static str,
    },
    #[error("{address} already joined competition {id}")]
    AlreadyJoined {
        id: CompetitionId,
        address: Address,
    },
    #[error("competition {id} is full ({max} participants)")]
    Full { id: CompetitionId, max: u32 },
    #[error("competition {id} is not a prediction market")]
    NotPrediction { id: CompetitionId },
    #[error("competition {id} has no market")]
    NoMarket { id: CompetitionId },
    #[error("invalid amount {amount}: must be positive and finite")]
    InvalidAmount { amount: f64 },
    #[error("invalid outcome `{outcome}`")]
    InvalidOutcome { outcome: String },
    #[error("market liquidity below floor (yes={yes}, no={no})")]
    LowLiquidity { yes: f64, no: f64 },
    #[error("bet {bet_id} already recorded for competition {id}")]
    DuplicateBet {
        id: CompetitionId,
        bet_id: uuid::Uuid,
    },
    #[error("{address} is not a judge of competition {id}")]
    NotJudge {
        id: CompetitionId,
        address: Address,
    },
    #[error("{address} already voted on competition {id}")]
    AlreadyVoted {
        id: CompetitionId,
        address: Address,
    },
    #[error("competition {id} already resolved as {verdict}")]
    AlreadyResolved { id: CompetitionId, verdict: Verdict },
    #[error("{address} is already a judge of competition {id}")]
    JudgeExists {
        id: CompetitionId,
        address: Address,
    },
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },
    #[error("{address} is not allowed to {operation}")]
    Unauthorized {
        address: Address,
        operation: &'static str,
    },
    #[error("invalid competition: {reason}")]
    InvalidCompetition { reason: String },
    #[error("competition {id} already exists")]
    AlreadyExists { id: CompetitionId },
    #[error(transparent)]
    Cpmm(#[from] CpmmError),
    #[error(transparent)]
    Db(#[from] sneed::Error),
}

impl Error {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::AlreadyJoined { .. } => "ALREADY_JOINED",
            Self::Full { .. } => "FULL",
            Self::NotPrediction { .. } => "NOT_PREDICTION",
            Self::NoMarket { .. } => "NO_MARKET",
            Self::InvalidAmount { .. } => "INVALID_AMOUNT",
            Self::InvalidOutcome { .. } => "INVALID_OUTCOME",
            Self::LowLiquidity { .. } => "LOW_LIQUIDITY",
            Self::DuplicateBet { .. } => "DUPLICATE_BET",
            Self::NotJudge { .. } => "NOT_JUDGE",
            Self::AlreadyVoted { .. } => "ALREADY_VOTED",
            Self::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            Self::JudgeExists { .. } => "JUDGE_EXISTS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::InvalidCompetition { .. } | Self::AlreadyExists { .. } => {
                "INVALID_COMPETITION"
            }
            Self::Cpmm(CpmmError::InvalidAmount(_)) => "INVALID_AMOUNT",
            Self::Cpmm(CpmmError::InsufficientLiquidity { .. }) => {
                "LOW_LIQUIDITY"
            }
            Self::Cpmm(CpmmError::UnknownOutcome(_)) => "INVALID_OUTCOME",
            Self::Cpmm(CpmmError::InvalidProbability(_)) => {
                "INVALID_COMPETITION"
            }
            Self::Cpmm(CpmmError::InvariantViolation { .. }) => "SCRIPT_ERROR",
            Self::Db(_) => "SCRIPT_ERROR",
        }
    }

    /// Failures of the transaction mechanism itself; worth one retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Db(_))
    }
}
