//! Judge vote tallying and resolution checks.
//!
//! Everything here is a pure function of the judge list and the explicit
//! votes; the atomic mutator calls it after appending a vote inside the same
//! store transaction.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::competition::{Judge, JudgeRole, Verdict, Vote};

/// Default threshold when any arbiter, reviewer or verifier sits on the panel
pub const PANEL_THRESHOLD_PERCENT: u8 = 66;
/// Default threshold when only participants judge themselves
pub const SELF_ARBITRATION_THRESHOLD_PERCENT: u8 = 51;

const APPROVE_TOKENS: [&str; 4] = ["approve", "approved", "yes", "accept"];
const REJECT_TOKENS: [&str; 4] = ["reject", "rejected", "no", "deny"];

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Choice {
    Approve,
    Reject,
    /// A named winner, normalized to lowercase
    Winner(String),
}

pub fn classify_choice(choice: &str) -> Choice {
    let normalized = choice.trim().to_ascii_lowercase();
    if APPROVE_TOKENS.contains(&normalized.as_str()) {
        Choice::Approve
    } else if REJECT_TOKENS.contains(&normalized.as_str()) {
        Choice::Reject
    } else {
        Choice::Winner(normalized)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct VotingProgress {
    pub total_judges: u32,
    pub required_votes: u32,
    pub threshold_percent: u8,
    pub explicit_votes: u32,
    /// Participant judges that have not voted explicitly
    pub implicit_self_votes: u32,
    pub approval_votes: u32,
    pub rejection_votes: u32,
    pub approval_weight: u64,
    pub rejection_weight: u64,
    pub winner_votes: BTreeMap<String, u32>,
}

impl VotingProgress {
    pub fn is_complete(&self) -> bool {
        self.explicit_votes + self.implicit_self_votes >= self.total_judges
    }
}

pub fn default_threshold(judges: &[Judge]) -> u8 {
    if judges.iter().any(|judge| judge.role.is_panel()) {
        PANEL_THRESHOLD_PERCENT
    } else {
        SELF_ARBITRATION_THRESHOLD_PERCENT
    }
}

/// `ceil(total × threshold / 100)`
pub fn required_votes(total_judges: u32, threshold_percent: u8) -> u32 {
    (total_judges * u32::from(threshold_percent)).div_ceil(100)
}

pub fn tally(
    judges: &[Judge],
    votes: &[Vote],
    threshold_percent: u8,
) -> VotingProgress {
    let total_judges = judges.len() as u32;
    let mut progress = VotingProgress {
        total_judges,
        required_votes: required_votes(total_judges, threshold_percent),
        threshold_percent,
        ..VotingProgress::default()
    };
    let mut voted = HashSet::with_capacity(votes.len());
    for vote in votes {
        if !voted.insert(&vote.judge) {
            continue;
        }
        progress.explicit_votes += 1;
        match classify_choice(&vote.choice) {
            Choice::Approve => {
                progress.approval_votes += 1;
                progress.approval_weight += u64::from(vote.weight);
            }
            Choice::Reject => {
                progress.rejection_votes += 1;
                progress.rejection_weight += u64::from(vote.weight);
            }
            Choice::Winner(token) => {
                *progress.winner_votes.entry(token).or_default() += 1;
            }
        }
    }
    progress.implicit_self_votes = judges
        .iter()
        .filter(|judge| {
            judge.role == JudgeRole::ParticipantJudge
                && !voted.contains(&judge.address)
        })
        .count() as u32;
    progress
}

fn plurality_winner(winner_votes: &BTreeMap<String, u32>) -> Option<String> {
    let max = winner_votes.values().copied().max()?;
    let mut leaders = winner_votes.iter().filter(|(_, count)| **count == max);
    let (token, _) = leaders.next()?;
    if leaders.next().is_some() {
        return None;
    }
    Some(token.clone())
}

/// The verdict reached by `progress`, if any. `Disputed` is a verdict: a
/// complete tally with no majority ends the vote.
pub fn check_resolution(progress: &VotingProgress) -> Option<Verdict> {
    if progress.total_judges == 0 || progress.explicit_votes == 0 {
        return None;
    }
    if progress.approval_votes >= progress.required_votes {
        return Some(Verdict::Approved);
    }
    if progress.rejection_votes >= progress.required_votes {
        return Some(Verdict::Rejected);
    }
    if !progress.is_complete() {
        return None;
    }
    let verdict = match progress.approval_votes.cmp(&progress.rejection_votes)
    {
        std::cmp::Ordering::Greater => Verdict::Approved,
        std::cmp::Ordering::Less => Verdict::Rejected,
        std::cmp::Ordering::Equal if progress.approval_votes == 0 => {
            plurality_winner(&progress.winner_votes)
                .map_or(Verdict::Disputed, Verdict::Winner)
        }
        std::cmp::Ordering::Equal => Verdict::Disputed,
    };
    Some(verdict)
}

/// Verdict for a market resolved by its final YES probability
pub fn market_price_verdict(probability: f64) -> Verdict {
    if probability > 0.5 {
        Verdict::Approved
    } else if probability < 0.5 {
        Verdict::Rejected
    } else {
        Verdict::Disputed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    fn judge(n: u8, role: JudgeRole) -> Judge {
        Judge {
            address: addr(n),
            role,
            weight: 1,
            added_at: 0,
        }
    }

    fn vote(n: u8, choice: &str) -> Vote {
        Vote {
            id: uuid::Uuid::new_v4(),
            judge: addr(n),
            choice: choice.to_owned(),
            comment: None,
            weight: 1,
            cast_at: 0,
        }
    }

    #[test]
    fn choices_are_classified_case_insensitively() {
        assert_eq!(classify_choice("APPROVE"), Choice::Approve);
        assert_eq!(classify_choice(" yes "), Choice::Approve);
        assert_eq!(classify_choice("Deny"), Choice::Reject);
        assert_eq!(classify_choice("Red"), Choice::Winner("red".to_owned()));
    }

    #[test]
    fn thresholds_depend_on_panel_roles() {
        let panel = [
            judge(1, JudgeRole::Arbiter),
            judge(2, JudgeRole::ParticipantJudge),
        ];
        let selves = [judge(1, JudgeRole::ParticipantJudge)];
        assert_eq!(default_threshold(&panel), 66);
        assert_eq!(default_threshold(&selves), 51);
        assert_eq!(required_votes(3, 66), 2);
        assert_eq!(required_votes(4, 51), 3);
        assert_eq!(required_votes(10, 66), 7);
        assert_eq!(required_votes(0, 66), 0);
    }

    #[test]
    fn three_arbiters_resolve_after_second_approval() {
        let judges = [
            judge(1, JudgeRole::Arbiter),
            judge(2, JudgeRole::Arbiter),
            judge(3, JudgeRole::Arbiter),
        ];
        let mut votes = vec![vote(1, "approve")];
        let progress = tally(&judges, &votes, 66);
        assert_eq!(progress.required_votes, 2);
        assert_eq!(check_resolution(&progress), None);

        votes.push(vote(2, "approved"));
        let progress = tally(&judges, &votes, 66);
        assert_eq!(progress.approval_votes, 2);
        assert_eq!(check_resolution(&progress), Some(Verdict::Approved));
    }

    #[test]
    fn duplicate_judge_votes_count_once() {
        let judges = [judge(1, JudgeRole::Arbiter), judge(2, JudgeRole::Arbiter)];
        let votes = [vote(1, "approve"), vote(1, "reject")];
        let progress = tally(&judges, &votes, 66);
        assert_eq!(progress.explicit_votes, 1);
        assert_eq!(progress.approval_votes, 1);
        assert_eq!(progress.rejection_votes, 0);
    }

    #[test]
    fn implicit_self_votes_complete_the_tally() {
        let judges = [
            judge(1, JudgeRole::Arbiter),
            judge(2, JudgeRole::Arbiter),
            judge(3, JudgeRole::ParticipantJudge),
            judge(4, JudgeRole::ParticipantJudge),
        ];
        // required = ceil(4 × 66 / 100) = 3
        let votes = [vote(1, "approve"), vote(2, "reject")];
        let progress = tally(&judges, &votes, 66);
        assert_eq!(progress.implicit_self_votes, 2);
        assert!(progress.is_complete());
        assert_eq!(check_resolution(&progress), Some(Verdict::Disputed));

        let votes = [vote(1, "approve"), vote(2, "approve")];
        let progress = tally(&judges, &votes, 66);
        assert_eq!(check_resolution(&progress), Some(Verdict::Approved));
    }

    #[test]
    fn incomplete_panel_waits() {
        let judges = [
            judge(1, JudgeRole::Arbiter),
            judge(2, JudgeRole::Reviewer),
            judge(3, JudgeRole::Verifier),
        ];
        let progress = tally(&judges, &[vote(1, "reject")], 66);
        assert!(!progress.is_complete());
        assert_eq!(check_resolution(&progress), None);
    }

    #[test]
    fn plurality_winner_token() {
        let judges = [
            judge(1, JudgeRole::Arbiter),
            judge(2, JudgeRole::Arbiter),
            judge(3, JudgeRole::Arbiter),
        ];
        let votes = [vote(1, "red"), vote(2, "Red"), vote(3, "blue")];
        let progress = tally(&judges, &votes, 66);
        assert_eq!(
            check_resolution(&progress),
            Some(Verdict::Winner("red".to_owned()))
        );

        let judges = &judges[..2];
        let votes = [vote(1, "red"), vote(2, "blue")];
        let progress = tally(judges, &votes, 66);
        assert_eq!(check_resolution(&progress), Some(Verdict::Disputed));
    }

    #[test]
    fn market_price_resolution() {
        assert_eq!(market_price_verdict(0.73), Verdict::Approved);
        assert_eq!(market_price_verdict(0.2), Verdict::Rejected);
        assert_eq!(market_price_verdict(0.5), Verdict::Disputed);
    }
}
