//! Request checks that run before a store transaction is opened

use thiserror::Error;

use crate::{
    math::cpmm::Outcome,
    types::{Address, AddressError},
};

pub const MAX_POSITION_LEN: usize = 64;
pub const MAX_CHOICE_LEN: usize = 64;
pub const MAX_COMMENT_LEN: usize = 1_000;
pub const MAX_REASON_LEN: usize = 1_000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
    #[error("invalid amount {amount}: must be positive and finite")]
    InvalidAmount { amount: f64 },
    #[error("invalid stake {stake}: must be zero or positive and finite")]
    InvalidStake { stake: f64 },
    #[error("invalid outcome `{outcome}`, expected yes or no")]
    InvalidOutcome { outcome: String },
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::InvalidAmount { .. } | Self::InvalidStake { .. } => {
                "INVALID_AMOUNT"
            }
            Self::InvalidOutcome { .. } => "INVALID_OUTCOME",
            Self::InvalidField { .. } => "INVALID_COMPETITION",
        }
    }
}

fn check_text(
    field: &'static str,
    value: &str,
    max: usize,
    required: bool,
) -> Result<(), Error> {
    if required && value.trim().is_empty() {
        return Err(Error::InvalidField {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max {
        return Err(Error::InvalidField {
            field,
            reason: "too long",
        });
    }
    Ok(())
}

pub struct AddressValidator;

impl AddressValidator {
    pub fn parse(raw: &str) -> Result<Address, Error> {
        Ok(Address::parse(raw)?)
    }

    pub fn parse_all(raw: &[String]) -> Result<Vec<Address>, Error> {
        raw.iter().map(|address| Self::parse(address)).collect()
    }
}

pub struct JoinValidator;

impl JoinValidator {
    pub fn validate_join(position: &str, stake: f64) -> Result<(), Error> {
        check_text("position", position, MAX_POSITION_LEN, false)?;
        if !stake.is_finite() || stake < 0.0 {
            return Err(Error::InvalidStake { stake });
        }
        Ok(())
    }
}

pub struct BetValidator;

impl BetValidator {
    /// Parse the outcome and check the amount of a bet
    pub fn validate_bet(outcome: &str, amount: f64) -> Result<Outcome, Error> {
        let outcome =
            outcome.parse::<Outcome>().map_err(|_| Error::InvalidOutcome {
                outcome: outcome.to_owned(),
            })?;
        if !amount.is_finite() || amount <= 0.0 {
            return Err(Error::InvalidAmount { amount });
        }
        Ok(outcome)
    }
}

pub struct VoteValidator;

impl VoteValidator {
    pub fn validate_vote(
        choice: &str,
        comment: Option<&str>,
    ) -> Result<(), Error> {
        check_text("choice", choice, MAX_CHOICE_LEN, true)?;
        if let Some(comment) = comment {
            check_text("comment", comment, MAX_COMMENT_LEN, false)?;
        }
        Ok(())
    }
}

pub struct JudgeValidator;

impl JudgeValidator {
    pub fn validate_weight(weight: u32) -> Result<(), Error> {
        if weight == 0 {
            return Err(Error::InvalidField {
                field: "weight",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

pub fn validate_reason(reason: &str) -> Result<(), Error> {
    check_text("reason", reason, MAX_REASON_LEN, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bets_need_known_outcome_and_positive_amount() {
        assert_eq!(BetValidator::validate_bet("Yes", 1.5), Ok(Outcome::Yes));
        assert!(matches!(
            BetValidator::validate_bet("maybe", 1.0),
            Err(Error::InvalidOutcome { .. })
        ));
        let err = BetValidator::validate_bet("no", 0.0).unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");
        assert!(BetValidator::validate_bet("no", f64::INFINITY).is_err());
    }

    #[test]
    fn zero_stake_is_a_free_entry() {
        assert!(JoinValidator::validate_join("red", 0.0).is_ok());
        assert!(JoinValidator::validate_join("red", -1.0).is_err());
        assert!(
            JoinValidator::validate_join(&"x".repeat(65), 1.0).is_err()
        );
    }

    #[test]
    fn address_errors_map_to_invalid_address() {
        let err = AddressValidator::parse("nope").unwrap_err();
        assert_eq!(err.code(), "INVALID_ADDRESS");
    }

    #[test]
    fn votes_need_a_choice() {
        assert!(VoteValidator::validate_vote("approve", None).is_ok());
        assert!(VoteValidator::validate_vote("  ", None).is_err());
        assert!(
            VoteValidator::validate_vote("approve", Some(&"c".repeat(1_001)))
                .is_err()
        );
    }
}
