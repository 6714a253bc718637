//! Constant-product market maker for binary (YES/NO) markets.
//!
//! The pool holds outcome shares on both sides with `yes × no = k`. Buying an
//! outcome with `amount` mints `amount` complete sets into the pool, then
//! withdraws purchased-side shares until the product is back to `k`:
//!
//! ```text
//! YES buy:  no' = no + amount,  yes' = k / no',  shares = yes + amount - yes'
//! NO buy:   yes' = yes + amount, no' = k / yes', shares = no + amount - no'
//! ```
//!
//! The probability of YES is `no / (yes + no)` and is always recomputed from
//! the pool after a trade.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Pools below this size are refused for trading; the probability would be
/// dominated by rounding.
pub const MIN_LIQUIDITY: f64 = 1.0;
const MIN_INITIAL_PROBABILITY: f64 = 0.01;
const MAX_INITIAL_PROBABILITY: f64 = 0.99;
/// Relative tolerance when checking that `k` survives a trade
const INVARIANT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CpmmError {
    #[error("trade amount must be positive and finite, got {0}")]
    InvalidAmount(f64),
    #[error("pool below liquidity floor: yes={yes}, no={no}, floor={floor}")]
    InsufficientLiquidity { yes: f64, no: f64, floor: f64 },
    #[error("initial probability {0} outside [{MIN_INITIAL_PROBABILITY}, {MAX_INITIAL_PROBABILITY}]")]
    InvalidProbability(f64),
    #[error("constant product drifted from {before} to {after}")]
    InvariantViolation { before: f64, after: f64 },
    #[error("unknown outcome `{0}`, expected yes or no")]
    UnknownOutcome(String),
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn opposite(self) -> Self {
        match self {
            Self::Yes => Self::No,
            Self::No => Self::Yes,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yes => f.write_str("yes"),
            Self::No => f.write_str("no"),
        }
    }
}

impl FromStr for Outcome {
    type Err = CpmmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            _ => Err(CpmmError::UnknownOutcome(s.to_owned())),
        }
    }
}

/// Outcome-share reserves held by the market maker
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct Pool {
    pub yes: f64,
    pub no: f64,
}

impl Pool {
    pub fn new(yes: f64, no: f64) -> Self {
        Self { yes, no }
    }

    /// The constant product `k`
    pub fn product(&self) -> f64 {
        self.yes * self.no
    }

    pub fn reserve(&self, outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Yes => self.yes,
            Outcome::No => self.no,
        }
    }

    pub fn is_liquid(&self) -> bool {
        self.yes.is_finite()
            && self.no.is_finite()
            && self.yes >= MIN_LIQUIDITY
            && self.no >= MIN_LIQUIDITY
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct TradeQuote {
    pub outcome: Outcome,
    pub amount: f64,
    pub shares: f64,
    pub new_pool: Pool,
    pub probability_before: f64,
    pub probability_after: f64,
    /// Change in the bought outcome's probability caused by the trade
    pub price_impact: f64,
    /// Currency paid per share received
    pub average_price: f64,
}

/// Probability of YES implied by the pool
pub fn calculate_new_probability(pool: &Pool) -> f64 {
    pool.no / (pool.yes + pool.no)
}

/// Probability of `outcome` implied by the pool
pub fn outcome_probability(pool: &Pool, outcome: Outcome) -> f64 {
    let p_yes = calculate_new_probability(pool);
    match outcome {
        Outcome::Yes => p_yes,
        Outcome::No => 1.0 - p_yes,
    }
}

fn validate_trade(pool: &Pool, amount: f64) -> Result<(), CpmmError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(CpmmError::InvalidAmount(amount));
    }
    if !pool.is_liquid() {
        return Err(CpmmError::InsufficientLiquidity {
            yes: pool.yes,
            no: pool.no,
            floor: MIN_LIQUIDITY,
        });
    }
    Ok(())
}

fn trade(pool: &Pool, outcome: Outcome, amount: f64) -> (f64, Pool) {
    let k = pool.product();
    match outcome {
        Outcome::Yes => {
            let no = pool.no + amount;
            let yes = k / no;
            (pool.yes + amount - yes, Pool { yes, no })
        }
        Outcome::No => {
            let yes = pool.yes + amount;
            let no = k / yes;
            (pool.no + amount - no, Pool { yes, no })
        }
    }
}

/// Apply a trade, refusing any that would leave the pool below the floor or
/// round the probability onto 0 or 1
fn checked_trade(
    pool: &Pool,
    outcome: Outcome,
    amount: f64,
) -> Result<(f64, Pool), CpmmError> {
    validate_trade(pool, amount)?;
    let (shares, new_pool) = trade(pool, outcome, amount);
    let probability = calculate_new_probability(&new_pool);
    let interior = probability > 0.0 && probability < 1.0;
    if !new_pool.is_liquid() || !interior {
        return Err(CpmmError::InsufficientLiquidity {
            yes: new_pool.yes,
            no: new_pool.no,
            floor: MIN_LIQUIDITY,
        });
    }
    Ok((shares, new_pool))
}

/// Number of `outcome` shares bought with `amount`
pub fn calculate_shares(
    pool: &Pool,
    outcome: Outcome,
    amount: f64,
) -> Result<f64, CpmmError> {
    let (shares, _) = checked_trade(pool, outcome, amount)?;
    Ok(shares)
}

/// Full pricing of a trade, including the post-trade pool
pub fn quote(
    pool: &Pool,
    outcome: Outcome,
    amount: f64,
) -> Result<TradeQuote, CpmmError> {
    let (shares, new_pool) = checked_trade(pool, outcome, amount)?;

    let before = pool.product();
    let after = new_pool.product();
    if ((after - before) / before).abs() > INVARIANT_TOLERANCE {
        return Err(CpmmError::InvariantViolation { before, after });
    }

    let probability_before = calculate_new_probability(pool);
    let probability_after = calculate_new_probability(&new_pool);
    let price_impact = outcome_probability(&new_pool, outcome)
        - outcome_probability(pool, outcome);

    Ok(TradeQuote {
        outcome,
        amount,
        shares,
        new_pool,
        probability_before,
        probability_after,
        price_impact,
        average_price: amount / shares,
    })
}

/// Winning shares redeem for one unit of currency each
pub fn calculate_payout(
    shares: f64,
    held: Outcome,
    final_outcome: Outcome,
) -> f64 {
    if held == final_outcome && shares.is_finite() && shares > 0.0 {
        shares
    } else {
        0.0
    }
}

/// Reserves for a new market holding `liquidity` on the larger side and
/// priced at `initial_probability` for YES.
pub fn seed_pool(
    liquidity: f64,
    initial_probability: f64,
) -> Result<Pool, CpmmError> {
    if !liquidity.is_finite() || liquidity < MIN_LIQUIDITY {
        return Err(CpmmError::InsufficientLiquidity {
            yes: liquidity,
            no: liquidity,
            floor: MIN_LIQUIDITY,
        });
    }
    if !(MIN_INITIAL_PROBABILITY..=MAX_INITIAL_PROBABILITY)
        .contains(&initial_probability)
    {
        return Err(CpmmError::InvalidProbability(initial_probability));
    }
    // no / yes = p / (1 - p)
    let ratio = initial_probability / (1.0 - initial_probability);
    let pool = if ratio >= 1.0 {
        Pool::new(liquidity / ratio, liquidity)
    } else {
        Pool::new(liquidity, liquidity * ratio)
    };
    if !pool.is_liquid() {
        return Err(CpmmError::InsufficientLiquidity {
            yes: pool.yes,
            no: pool.no,
            floor: MIN_LIQUIDITY,
        });
    }
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn yes_bet_moves_price_towards_yes() {
        let pool = Pool::new(100.0, 100.0);
        let quote = quote(&pool, Outcome::Yes, 10.0).unwrap();

        assert!(quote.probability_after > quote.probability_before);
        assert!(quote.new_pool.yes < pool.yes);
        assert!(
            outcome_probability(&quote.new_pool, Outcome::No)
                < outcome_probability(&pool, Outcome::No)
        );
        assert!(quote.probability_after > 0.0 && quote.probability_after < 1.0);
        assert_relative_eq!(quote.new_pool.product(), pool.product(), max_relative = 1e-12);
        // 110 - 10000 / 110
        assert_relative_eq!(quote.shares, 110.0 - 10_000.0 / 110.0, epsilon = 1e-9);
        assert!(quote.price_impact > 0.0);
        assert!(quote.average_price < 1.0);
    }

    #[test]
    fn no_bet_is_symmetric() {
        let pool = Pool::new(100.0, 100.0);
        let yes = quote(&pool, Outcome::Yes, 10.0).unwrap();
        let no = quote(&pool, Outcome::No, 10.0).unwrap();
        assert_relative_eq!(yes.shares, no.shares, epsilon = 1e-12);
        assert_relative_eq!(
            yes.probability_after,
            1.0 - no.probability_after,
            epsilon = 1e-12
        );
    }

    #[test]
    fn balanced_pool_bet_of_25() {
        let pool = Pool::new(50.0, 50.0);
        assert_relative_eq!(calculate_new_probability(&pool), 0.5);
        let quote = quote(&pool, Outcome::Yes, 25.0).unwrap();
        assert!(quote.probability_after > 0.5);
        assert!(quote.probability_after < 1.0);
    }

    #[test]
    fn repeated_trades_stop_at_the_liquidity_floor() {
        let mut pool = Pool::new(10.0, 10.0);
        let mut refused = None;
        for _ in 0..50 {
            match quote(&pool, Outcome::Yes, 5.0) {
                Ok(quote) => {
                    assert!(quote.new_pool.is_liquid());
                    assert!(quote.probability_after > 0.0);
                    assert!(quote.probability_after < 1.0);
                    pool = quote.new_pool;
                }
                Err(err) => {
                    refused = Some(err);
                    break;
                }
            }
        }
        assert!(matches!(
            refused,
            Some(CpmmError::InsufficientLiquidity { .. })
        ));
        // the other side still trades
        let back = quote(&pool, Outcome::No, 5.0).unwrap();
        assert!(back.probability_after < back.probability_before);
    }

    #[test]
    fn draining_trade_is_refused() {
        let pool = Pool::new(100.0, 100.0);
        assert!(matches!(
            quote(&pool, Outcome::Yes, 10_000.0),
            Err(CpmmError::InsufficientLiquidity { .. })
        ));
        assert!(matches!(
            calculate_shares(&Pool::new(1.0, 1.0), Outcome::Yes, 1e17),
            Err(CpmmError::InsufficientLiquidity { .. })
        ));
    }

    #[test]
    fn saturated_probability_is_refused() {
        // 1e17 + 2 rounds to 1e17, so the probability would be exactly 1
        let pool = Pool::new(2.0, 1e17);
        assert!(matches!(
            quote(&pool, Outcome::Yes, 1.0),
            Err(CpmmError::InsufficientLiquidity { .. })
        ));
    }

    #[test]
    fn invalid_amounts_are_caller_errors() {
        let pool = Pool::new(100.0, 100.0);
        assert_eq!(
            calculate_shares(&pool, Outcome::Yes, 0.0),
            Err(CpmmError::InvalidAmount(0.0))
        );
        assert!(matches!(
            calculate_shares(&pool, Outcome::No, -3.0),
            Err(CpmmError::InvalidAmount(_))
        ));
        assert!(matches!(
            calculate_shares(&pool, Outcome::No, f64::NAN),
            Err(CpmmError::InvalidAmount(_))
        ));
    }

    #[test]
    fn illiquid_pool_is_rejected() {
        let pool = Pool::new(0.5, 100.0);
        assert!(matches!(
            quote(&pool, Outcome::Yes, 1.0),
            Err(CpmmError::InsufficientLiquidity { .. })
        ));
    }

    #[test]
    fn payout_is_one_unit_per_winning_share() {
        assert_eq!(calculate_payout(12.5, Outcome::Yes, Outcome::Yes), 12.5);
        assert_eq!(calculate_payout(12.5, Outcome::Yes, Outcome::No), 0.0);
    }

    #[test]
    fn seeded_pool_matches_requested_probability() {
        let pool = seed_pool(100.0, 0.7).unwrap();
        assert_relative_eq!(calculate_new_probability(&pool), 0.7, epsilon = 1e-12);
        assert_relative_eq!(pool.no, 100.0);
        let even = seed_pool(100.0, 0.5).unwrap();
        assert_eq!(even, Pool::new(100.0, 100.0));
        assert!(seed_pool(100.0, 1.0).is_err());
        assert!(seed_pool(0.1, 0.5).is_err());
    }

    #[test]
    fn outcome_parses_case_insensitively() {
        assert_eq!("YES".parse::<Outcome>().unwrap(), Outcome::Yes);
        assert_eq!(" no ".parse::<Outcome>().unwrap(), Outcome::No);
        assert!("maybe".parse::<Outcome>().is_err());
    }
}
