//! Payout planning for resolved competitions.
//!
//! The plan is handed to the custody vault as proposed transactions; nothing
//! here moves funds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    math::cpmm::{self, Outcome},
    state::competition::{Bet, Competition, Status, Verdict},
    types::{Address, CompetitionId},
};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct Payout {
    pub address: Address,
    pub amount: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct SettlementPlan {
    pub competition_id: CompetitionId,
    pub verdict: Option<Verdict>,
    /// One entry per address, sorted by address
    pub payouts: Vec<Payout>,
    pub platform_fee: f64,
    /// Stakes and bets are returned instead of paid out
    pub refund: bool,
}

impl SettlementPlan {
    pub fn total(&self) -> f64 {
        self.payouts.iter().map(|payout| payout.amount).sum::<f64>()
            + self.platform_fee
    }
}

/// The participant position tag that wins under `verdict`
fn winning_position(verdict: &Verdict) -> Option<String> {
    match verdict {
        Verdict::Approved => Some(Outcome::Yes.to_string()),
        Verdict::Rejected => Some(Outcome::No.to_string()),
        Verdict::Winner(token) => Some(token.to_ascii_lowercase()),
        Verdict::Disputed => None,
    }
}

fn credit(payouts: &mut BTreeMap<Address, f64>, address: &Address, amount: f64) {
    if amount > 0.0 {
        *payouts.entry(address.clone()).or_default() += amount;
    }
}

fn refund_all(
    competition: &Competition,
    bets: &[Bet],
    payouts: &mut BTreeMap<Address, f64>,
) {
    for entry in &competition.participants {
        credit(payouts, &entry.address, entry.stake);
    }
    for bet in bets {
        credit(payouts, &bet.bettor, bet.amount);
    }
}

/// Compute the payouts owed once `competition` reaches a terminal status.
/// Returns `None` while the competition is still open.
pub fn plan(competition: &Competition, bets: &[Bet]) -> Option<SettlementPlan> {
    if !competition.status.is_terminal() {
        return None;
    }
    let verdict = competition.arbitration.verdict.clone();
    let mut payouts = BTreeMap::new();
    let mut platform_fee = 0.0;
    let mut refund = false;

    match (&competition.status, &verdict) {
        (Status::Completed, Some(verdict)) => {
            match verdict.market_outcome() {
                Some(outcome) => {
                    for bet in bets {
                        let amount =
                            cpmm::calculate_payout(bet.shares, bet.outcome, outcome);
                        credit(&mut payouts, &bet.bettor, amount);
                    }
                }
                None => {
                    for bet in bets {
                        credit(&mut payouts, &bet.bettor, bet.amount);
                    }
                }
            }

            let winners: Vec<_> = winning_position(verdict)
                .map(|position| {
                    competition
                        .participants
                        .iter()
                        .filter(|entry| {
                            entry.position.eq_ignore_ascii_case(&position)
                        })
                        .collect()
                })
                .unwrap_or_default();
            if winners.is_empty() {
                for entry in &competition.participants {
                    credit(&mut payouts, &entry.address, entry.stake);
                }
            } else {
                platform_fee = competition.prize_pool.platform_fee();
                let net = competition.prize_pool.net();
                let winning_stake: f64 =
                    winners.iter().map(|entry| entry.stake).sum();
                for entry in &winners {
                    let share = if winning_stake > 0.0 {
                        entry.stake / winning_stake
                    } else {
                        1.0 / winners.len() as f64
                    };
                    credit(&mut payouts, &entry.address, net * share);
                }
            }
        }
        _ => {
            refund = true;
            refund_all(competition, bets, &mut payouts);
        }
    }

    Some(SettlementPlan {
        competition_id: competition.id,
        verdict,
        payouts: payouts
            .into_iter()
            .map(|(address, amount)| Payout { address, amount })
            .collect(),
        platform_fee,
        refund,
    })
}
