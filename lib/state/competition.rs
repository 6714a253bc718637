use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    math::{
        arbitration,
        cpmm::{self, Outcome, Pool},
    },
    state::Error,
    types::{Address, CompetitionId},
};

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_PLATFORM_FEE_PERCENT: f64 = 50.0;
pub const DEFAULT_CURRENCY: &str = "ETH";

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    Wager,
    Prediction,
    PooledPrize,
}

impl Category {
    pub fn is_market_based(&self) -> bool {
        matches!(self, Self::Prediction)
    }
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    Draft,
    Pending,
    Active,
    Resolving,
    Completed,
    Disputed,
    Cancelled,
}

impl Status {
    pub fn can_transition_to(&self, new_status: Status) -> bool {
        use Status::{
            Active, Cancelled, Completed, Disputed, Draft, Pending, Resolving,
        };
        match (self, new_status) {
            (Draft, Pending) | (Draft, Cancelled) => true,
            (Pending, Active) | (Pending, Cancelled) => true,
            // votes are accepted while active, so resolution may happen early
            (Active, Resolving)
            | (Active, Completed)
            | (Active, Disputed)
            | (Active, Cancelled) => true,
            (Resolving, Completed)
            | (Resolving, Disputed)
            | (Resolving, Cancelled) => true,
            _ => false,
        }
    }

    pub fn accepts_judges(&self) -> bool {
        matches!(self, Self::Draft | Self::Pending)
    }

    pub fn accepts_participants(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    pub fn accepts_votes(&self) -> bool {
        matches!(self, Self::Active | Self::Resolving)
    }

    pub fn accepts_bets(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Disputed | Self::Cancelled)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct PrizePool {
    pub total: f64,
    pub currency: String,
    pub platform_fee_percent: f64,
}

impl PrizePool {
    pub fn platform_fee(&self) -> f64 {
        self.total * self.platform_fee_percent / 100.0
    }

    pub fn net(&self) -> f64 {
        self.total - self.platform_fee()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct ParticipantEntry {
    pub address: Address,
    /// Position or team tag, e.g. `yes`, `no`, `red`
    pub position: String,
    pub stake: f64,
    pub joined_at: u64,
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JudgeRole {
    Arbiter,
    Reviewer,
    Verifier,
    ParticipantJudge,
}

impl JudgeRole {
    pub fn is_panel(&self) -> bool {
        !matches!(self, Self::ParticipantJudge)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct Judge {
    pub address: Address,
    pub role: JudgeRole,
    /// Reputation weight, at least 1
    pub weight: u32,
    pub added_at: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct Vote {
    pub id: uuid::Uuid,
    pub judge: Address,
    pub choice: String,
    pub comment: Option<String>,
    /// Judge weight at the time the vote was cast
    pub weight: u32,
    pub cast_at: u64,
}

/// Final outcome of a competition
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
    /// A specific winner named by the judges' choice token
    Winner(String),
    Disputed,
}

impl Verdict {
    /// The market outcome that pays out under this verdict
    pub fn market_outcome(&self) -> Option<Outcome> {
        match self {
            Self::Approved => Some(Outcome::Yes),
            Self::Rejected => Some(Outcome::No),
            Self::Winner(token) => token.parse().ok(),
            Self::Disputed => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => f.write_str("approved"),
            Self::Rejected => f.write_str("rejected"),
            Self::Winner(token) => write!(f, "winner:{token}"),
            Self::Disputed => f.write_str("disputed"),
        }
    }
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    #[default]
    Judges,
    MarketPrice,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct Arbitration {
    pub judges: Vec<Judge>,
    /// Explicit votes in the order they were cast
    pub votes: Vec<Vote>,
    /// Overrides the role-based default threshold
    pub threshold_percent: Option<u8>,
    pub mode: ResolutionMode,
    pub verdict: Option<Verdict>,
    pub resolved_at: Option<u64>,
}

impl Arbitration {
    pub fn judge(&self, address: &Address) -> Option<&Judge> {
        self.judges.iter().find(|judge| &judge.address == address)
    }

    pub fn vote_of(&self, address: &Address) -> Option<&Vote> {
        self.votes.iter().find(|vote| &vote.judge == address)
    }

    pub fn effective_threshold(&self) -> u8 {
        self.threshold_percent
            .unwrap_or_else(|| arbitration::default_threshold(&self.judges))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct Market {
    pub pool: Pool,
    pub probability: f64,
    pub volume: f64,
    pub initial_liquidity: f64,
    pub bet_count: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct Bet {
    pub id: uuid::Uuid,
    /// Position of the bet in the market's trade order
    pub seq: u32,
    pub bettor: Address,
    pub outcome: Outcome,
    pub amount: f64,
    pub shares: f64,
    pub probability_before: f64,
    pub probability_after: f64,
    pub placed_at: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct Competition {
    pub id: CompetitionId,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub status: Status,
    pub creator: Address,
    pub starts_at: u64,
    pub ends_at: u64,
    pub prize_pool: PrizePool,
    pub max_participants: Option<u32>,
    pub participants: Vec<ParticipantEntry>,
    pub arbitration: Arbitration,
    pub market: Option<Market>,
    /// External multisig vault holding the funds
    pub vault: Option<Address>,
    /// Number of transparency events allocated so far
    pub event_seq: u64,
    /// Incremented on every committed mutation
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Competition {
    pub fn participant(&self, address: &Address) -> Option<&ParticipantEntry> {
        self.participants
            .iter()
            .find(|entry| &entry.address == address)
    }

    pub fn total_participants(&self) -> u32 {
        self.participants.len() as u32
    }

    pub fn is_full(&self) -> bool {
        self.max_participants
            .is_some_and(|max| self.total_participants() >= max)
    }

    /// Reserve the next transparency event sequence number
    pub(in crate::state) fn next_event_seq(&mut self) -> u64 {
        let seq = self.event_seq;
        self.event_seq += 1;
        seq
    }

    pub(in crate::state) fn set_status(
        &mut self,
        to: Status,
    ) -> Result<Status, Error> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        self.status = to;
        Ok(from)
    }

    /// Timeline-driven status changes due at `now`, in order
    pub fn due_transitions(&self, now: u64) -> Vec<Status> {
        let mut due = Vec::new();
        let mut status = self.status;
        if status == Status::Pending && now >= self.starts_at {
            due.push(Status::Active);
            status = Status::Active;
        }
        if status == Status::Active && now >= self.ends_at {
            due.push(Status::Resolving);
        }
        due
    }
}

/// Builder for new competitions; `build` performs all creation-time checks
#[derive(Clone, Debug)]
pub struct CompetitionBuilder {
    title: String,
    description: String,
    category: Category,
    creator: Address,
    starts_at: Option<u64>,
    ends_at: Option<u64>,
    currency: String,
    platform_fee_percent: f64,
    max_participants: Option<u32>,
    judges: Vec<(Address, JudgeRole, u32)>,
    threshold_percent: Option<u8>,
    mode: ResolutionMode,
    liquidity: Option<(f64, f64)>,
    draft: bool,
}

impl CompetitionBuilder {
    pub fn new(title: String, creator: Address, category: Category) -> Self {
        Self {
            title,
            description: String::new(),
            category,
            creator,
            starts_at: None,
            ends_at: None,
            currency: DEFAULT_CURRENCY.to_owned(),
            platform_fee_percent: 0.0,
            max_participants: None,
            judges: Vec::new(),
            threshold_percent: None,
            mode: ResolutionMode::Judges,
            liquidity: None,
            draft: false,
        }
    }

    pub fn with_description(mut self, description: String) -> Self {
        self.description = description;
        self
    }

    pub fn with_timeline(mut self, starts_at: u64, ends_at: u64) -> Self {
        self.starts_at = Some(starts_at);
        self.ends_at = Some(ends_at);
        self
    }

    pub fn with_currency(mut self, currency: String) -> Self {
        self.currency = currency;
        self
    }

    pub fn with_platform_fee(mut self, percent: f64) -> Self {
        self.platform_fee_percent = percent;
        self
    }

    pub fn with_max_participants(mut self, max: u32) -> Self {
        self.max_participants = Some(max);
        self
    }

    pub fn with_judge(
        mut self,
        address: Address,
        role: JudgeRole,
        weight: u32,
    ) -> Self {
        self.judges.push((address, role, weight));
        self
    }

    pub fn with_threshold(mut self, percent: u8) -> Self {
        self.threshold_percent = Some(percent);
        self
    }

    pub fn with_resolution_mode(mut self, mode: ResolutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Seed a CPMM market with `liquidity` priced at `initial_probability`
    pub fn with_market(
        mut self,
        liquidity: f64,
        initial_probability: f64,
    ) -> Self {
        self.liquidity = Some((liquidity, initial_probability));
        self
    }

    pub fn as_draft(mut self) -> Self {
        self.draft = true;
        self
    }

    pub fn build(self, now: u64, nonce: &[u8]) -> Result<Competition, Error> {
        let invalid = |reason: &str| Error::InvalidCompetition {
            reason: reason.to_owned(),
        };
        let title = self.title.trim().to_owned();
        if title.is_empty() || title.len() > MAX_TITLE_LEN {
            return Err(invalid("title must be 1-200 characters"));
        }
        let starts_at = self.starts_at.unwrap_or(now);
        let Some(ends_at) = self.ends_at else {
            return Err(invalid("an end time is required"));
        };
        if ends_at <= starts_at {
            return Err(invalid("end time must be after start time"));
        }
        if !(0.0..=MAX_PLATFORM_FEE_PERCENT)
            .contains(&self.platform_fee_percent)
        {
            return Err(invalid("platform fee must be between 0 and 50%"));
        }
        if self.max_participants == Some(0) {
            return Err(invalid("max participants must be positive"));
        }
        if self
            .threshold_percent
            .is_some_and(|threshold| !(1..=100).contains(&threshold))
        {
            return Err(invalid("threshold must be between 1 and 100"));
        }
        let market = match (self.category, self.liquidity) {
            (Category::Prediction, Some((liquidity, probability))) => {
                let pool = cpmm::seed_pool(liquidity, probability)?;
                Some(Market {
                    pool,
                    probability: cpmm::calculate_new_probability(&pool),
                    volume: 0.0,
                    initial_liquidity: liquidity,
                    bet_count: 0,
                })
            }
            (Category::Prediction, None) => None,
            (_, Some(_)) => {
                return Err(invalid("only prediction competitions have markets"));
            }
            (_, None) => None,
        };
        if self.mode == ResolutionMode::MarketPrice && market.is_none() {
            return Err(invalid("market price resolution requires a market"));
        }

        let mut judges: Vec<Judge> = Vec::with_capacity(self.judges.len());
        for (address, role, weight) in self.judges {
            if weight == 0 {
                return Err(invalid("judge weight must be at least 1"));
            }
            if judges.iter().any(|judge| judge.address == address) {
                return Err(invalid("duplicate judge"));
            }
            judges.push(Judge {
                address,
                role,
                weight,
                added_at: now,
            });
        }

        let id = CompetitionId::derive(&self.creator, &title, now, nonce);
        Ok(Competition {
            id,
            title,
            description: self.description,
            category: self.category,
            status: if self.draft {
                Status::Draft
            } else {
                Status::Pending
            },
            creator: self.creator,
            starts_at,
            ends_at,
            prize_pool: PrizePool {
                total: 0.0,
                currency: self.currency,
                platform_fee_percent: self.platform_fee_percent,
            },
            max_participants: self.max_participants,
            participants: Vec::new(),
            arbitration: Arbitration {
                judges,
                votes: Vec::new(),
                threshold_percent: self.threshold_percent,
                mode: self.mode,
                verdict: None,
                resolved_at: None,
            },
            market,
            vault: None,
            event_seq: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creator() -> Address {
        Address::parse("0x00000000000000000000000000000000000000c0").unwrap()
    }

    #[test]
    fn lifecycle_transitions() {
        assert!(Status::Draft.can_transition_to(Status::Pending));
        assert!(Status::Pending.can_transition_to(Status::Active));
        assert!(Status::Active.can_transition_to(Status::Resolving));
        assert!(Status::Resolving.can_transition_to(Status::Completed));
        assert!(!Status::Completed.can_transition_to(Status::Disputed));
        assert!(!Status::Cancelled.can_transition_to(Status::Active));
        assert!(!Status::Pending.can_transition_to(Status::Completed));
        assert!(!Status::Active.can_transition_to(Status::Active));
        for terminal in [Status::Completed, Status::Disputed, Status::Cancelled]
        {
            assert!(terminal.is_terminal());
            assert!(!terminal.accepts_votes());
            assert!(!terminal.accepts_participants());
        }
    }

    #[test]
    fn due_transitions_follow_timeline() {
        let competition =
            CompetitionBuilder::new("race".into(), creator(), Category::Wager)
                .with_timeline(100, 200)
                .build(50, b"n")
                .unwrap();
        assert_eq!(competition.status, Status::Pending);
        assert!(competition.due_transitions(99).is_empty());
        assert_eq!(competition.due_transitions(100), vec![Status::Active]);
        assert_eq!(
            competition.due_transitions(250),
            vec![Status::Active, Status::Resolving]
        );
    }

    #[test]
    fn builder_rejects_bad_input() {
        let base =
            CompetitionBuilder::new("x".into(), creator(), Category::Wager);
        assert!(base.clone().build(0, b"n").is_err());
        assert!(base.clone().with_timeline(10, 5).build(0, b"n").is_err());
        assert!(
            base.clone()
                .with_timeline(0, 5)
                .with_market(100.0, 0.5)
                .build(0, b"n")
                .is_err()
        );
        assert!(
            base.with_timeline(0, 5)
                .with_threshold(0)
                .build(0, b"n")
                .is_err()
        );
    }

    #[test]
    fn prediction_builder_seeds_market() {
        let competition = CompetitionBuilder::new(
            "rain tomorrow".into(),
            creator(),
            Category::Prediction,
        )
        .with_timeline(0, 10)
        .with_market(50.0, 0.5)
        .build(0, b"n")
        .unwrap();
        let market = competition.market.unwrap();
        assert_eq!(market.pool, Pool::new(50.0, 50.0));
        assert_eq!(market.probability, 0.5);
    }

    #[test]
    fn out_of_range_initial_probability_is_an_invalid_competition() {
        let err = CompetitionBuilder::new(
            "rain tomorrow".into(),
            creator(),
            Category::Prediction,
        )
        .with_timeline(0, 10)
        .with_market(50.0, 1.5)
        .build(0, b"n")
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_COMPETITION");
    }
}
