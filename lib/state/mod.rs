//! Competition state and the atomic mutator.
//!
//! Every mutation runs inside a single LMDB write transaction supplied by the
//! caller. LMDB admits one writer per environment, so the read, validation
//! and write of a competition record cannot interleave with another mutation
//! in this or any other process.

use sneed::{Env, RoTxn, RwTxn};

use crate::{
    math::{
        arbitration::{self, VotingProgress},
        cpmm::{self, Outcome},
    },
    types::{Address, CompetitionId},
};

pub mod competition;
pub mod competitions;
pub mod error;
pub mod events;
pub mod settlement;
#[cfg(test)]
mod tests;

pub use competition::{
    Bet, Category, Competition, CompetitionBuilder, Judge, JudgeRole,
    ParticipantEntry, ResolutionMode, Status, Verdict, Vote,
};
pub use competitions::{CompetitionFilter, CompetitionsDatabase};
pub use error::Error;
pub use events::{EventKind, EventLog, TransparencyEvent};

/// Result of a committed-to-be mutation: the value returned to the caller,
/// the updated record and the transparency events it allocated.
#[derive(Clone, Debug)]
pub struct Applied<T> {
    pub value: T,
    pub competition: Competition,
    pub events: Vec<TransparencyEvent>,
    /// The mutation moved the competition into a terminal status
    pub terminal: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Joined {
    pub total_participants: u32,
    pub judge_added: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BetPlaced {
    pub bet: Bet,
    pub new_probability: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VoteCast {
    pub progress: VotingProgress,
    pub resolution_reached: bool,
    pub verdict: Option<Verdict>,
}

/// Parameters of a participant joining a competition
#[derive(Clone, Debug)]
pub struct JoinRequest {
    pub participant: Address,
    pub position: String,
    pub stake: f64,
}

/// Parameters of a bet placement
#[derive(Clone, Debug)]
pub struct BetRequest {
    pub bettor: Address,
    pub outcome: Outcome,
    pub amount: f64,
    /// Caller-supplied idempotency key
    pub bet_id: Option<uuid::Uuid>,
}

fn event(
    competition: &mut Competition,
    kind: EventKind,
    now: u64,
    actor: &Address,
    action: String,
) -> TransparencyEvent {
    let seq = competition.next_event_seq();
    TransparencyEvent::new(
        competition.id,
        seq,
        kind,
        now,
        actor.clone(),
        action,
    )
}

/// Store the verdict and move to the matching terminal status
fn apply_verdict(
    competition: &mut Competition,
    verdict: Verdict,
    now: u64,
) -> Result<(), Error> {
    let to = match verdict {
        Verdict::Disputed => Status::Disputed,
        Verdict::Approved | Verdict::Rejected | Verdict::Winner(_) => {
            Status::Completed
        }
    };
    competition.set_status(to)?;
    competition.arbitration.verdict = Some(verdict);
    competition.arbitration.resolved_at = Some(now);
    Ok(())
}

/// Resolve a market-price competition that has just entered `resolving`
fn resolve_by_market(
    competition: &mut Competition,
    now: u64,
    events: &mut Vec<TransparencyEvent>,
) -> Result<(), Error> {
    if competition.arbitration.mode != ResolutionMode::MarketPrice {
        return Ok(());
    }
    let Some(probability) =
        competition.market.as_ref().map(|market| market.probability)
    else {
        return Ok(());
    };
    let verdict = arbitration::market_price_verdict(probability);
    apply_verdict(competition, verdict.clone(), now)?;
    let creator = competition.creator.clone();
    let resolved = event(
        competition,
        EventKind::Resolved,
        now,
        &creator,
        format!("resolved {verdict} at market price {probability:.4}"),
    )
    .with_detail("verdict", &verdict)
    .with_detail("probability", probability)
    .with_detail("trigger", "market_price");
    tracing::info!(
        id = %competition.id,
        %verdict,
        probability,
        "competition resolved by market price"
    );
    events.push(resolved);
    Ok(())
}

/// Apply `to` as a status change, running market resolution when the
/// competition enters `resolving`
fn change_status(
    competition: &mut Competition,
    to: Status,
    actor: &Address,
    trigger: &str,
    now: u64,
    events: &mut Vec<TransparencyEvent>,
) -> Result<(), Error> {
    let from = competition.set_status(to)?;
    let changed = event(
        competition,
        EventKind::StatusChanged,
        now,
        actor,
        format!("status changed from {from} to {to}"),
    )
    .with_detail("from", from)
    .with_detail("to", to)
    .with_detail("trigger", trigger);
    events.push(changed);
    if to == Status::Resolving {
        resolve_by_market(competition, now, events)?;
    }
    Ok(())
}

/// Apply every timeline transition due at `now`
fn sync_timeline(
    competition: &mut Competition,
    now: u64,
    events: &mut Vec<TransparencyEvent>,
) -> Result<(), Error> {
    let creator = competition.creator.clone();
    for to in competition.due_transitions(now) {
        change_status(competition, to, &creator, "timeline", now, events)?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct State {
    competitions: CompetitionsDatabase,
    events: EventLog,
}

impl State {
    pub const NUM_DBS: u32 = CompetitionsDatabase::NUM_DBS + EventLog::NUM_DBS;

    pub fn new(env: &Env) -> Result<Self, Error> {
        let mut rwtxn = env.write_txn()?;
        let competitions = CompetitionsDatabase::new(env, &mut rwtxn)?;
        let events = EventLog::new(env, &mut rwtxn)?;
        rwtxn.commit()?;
        Ok(Self {
            competitions,
            events,
        })
    }

    pub fn competitions(&self) -> &CompetitionsDatabase {
        &self.competitions
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Load a competition for mutation, applying due timeline transitions
    fn load(
        &self,
        rwtxn: &mut RwTxn,
        id: CompetitionId,
        now: u64,
    ) -> Result<(Competition, Competition, Vec<TransparencyEvent>), Error> {
        let previous = self.competitions.get_competition(rwtxn, &id)?;
        let mut competition = previous.clone();
        let mut events = Vec::new();
        sync_timeline(&mut competition, now, &mut events)?;
        Ok((previous, competition, events))
    }

    fn save<T>(
        &self,
        rwtxn: &mut RwTxn,
        previous: &Competition,
        mut competition: Competition,
        events: Vec<TransparencyEvent>,
        now: u64,
        value: T,
    ) -> Result<Applied<T>, Error> {
        competition.version += 1;
        competition.updated_at = now;
        self.competitions
            .update_competition(rwtxn, previous, &competition)?;
        let terminal =
            !previous.status.is_terminal() && competition.status.is_terminal();
        Ok(Applied {
            value,
            competition,
            events,
            terminal,
        })
    }

    pub fn get_competition(
        &self,
        rotxn: &RoTxn,
        id: CompetitionId,
    ) -> Result<Competition, Error> {
        self.competitions.get_competition(rotxn, &id)
    }

    pub fn create_competition(
        &self,
        rwtxn: &mut RwTxn,
        mut competition: Competition,
        now: u64,
    ) -> Result<Applied<()>, Error> {
        let creator = competition.creator.clone();
        let action = format!(
            "created {} competition `{}`",
            competition.category, competition.title
        );
        let created = event(
            &mut competition,
            EventKind::Created,
            now,
            &creator,
            action,
        )
        .with_detail("category", competition.category)
        .with_detail("starts_at", competition.starts_at)
        .with_detail("ends_at", competition.ends_at)
        .with_detail("judges", competition.arbitration.judges.len());
        let mut events = vec![created];
        sync_timeline(&mut competition, now, &mut events)?;
        competition.version = 1;
        self.competitions.add_competition(rwtxn, &competition)?;
        tracing::info!(
            id = %competition.id,
            category = %competition.category,
            status = %competition.status,
            "competition created"
        );
        Ok(Applied {
            value: (),
            competition,
            events,
            terminal: false,
        })
    }

    pub fn join(
        &self,
        rwtxn: &mut RwTxn,
        id: CompetitionId,
        request: JoinRequest,
        now: u64,
    ) -> Result<Applied<Joined>, Error> {
        let (previous, mut competition, mut events) =
            self.load(rwtxn, id, now)?;
        if !competition.status.accepts_participants() {
            return Err(Error::InvalidStatus {
                id,
                status: competition.status,
                operation: "join",
            });
        }
        if competition.participant(&request.participant).is_some() {
            return Err(Error::AlreadyJoined {
                id,
                address: request.participant,
            });
        }
        if let Some(max) = competition.max_participants {
            if competition.is_full() {
                return Err(Error::Full { id, max });
            }
        }
        competition.participants.push(ParticipantEntry {
            address: request.participant.clone(),
            position: request.position.clone(),
            stake: request.stake,
            joined_at: now,
        });
        competition.prize_pool.total += request.stake;
        let judge_added = competition
            .arbitration
            .judge(&request.participant)
            .is_none();
        if judge_added {
            competition.arbitration.judges.push(Judge {
                address: request.participant.clone(),
                role: JudgeRole::ParticipantJudge,
                weight: 1,
                added_at: now,
            });
        }
        let total_participants = competition.total_participants();
        let joined = event(
            &mut competition,
            EventKind::ParticipantJoined,
            now,
            &request.participant,
            format!(
                "{} joined as participant {total_participants}",
                request.participant
            ),
        )
        .with_detail("position", &request.position)
        .with_detail("stake", request.stake)
        .with_detail("total_participants", total_participants)
        .with_detail("participant_judge", judge_added);
        events.push(joined);
        tracing::info!(
            %id,
            participant = %request.participant,
            total_participants,
            "participant joined"
        );
        self.save(
            rwtxn,
            &previous,
            competition,
            events,
            now,
            Joined {
                total_participants,
                judge_added,
            },
        )
    }

    pub fn place_bet(
        &self,
        rwtxn: &mut RwTxn,
        id: CompetitionId,
        request: BetRequest,
        now: u64,
    ) -> Result<Applied<BetPlaced>, Error> {
        let (previous, mut competition, mut events) =
            self.load(rwtxn, id, now)?;
        if !competition.category.is_market_based() {
            return Err(Error::NotPrediction { id });
        }
        let Some(market) = competition.market.as_ref() else {
            return Err(Error::NoMarket { id });
        };
        if !competition.status.accepts_bets() {
            return Err(Error::InvalidStatus {
                id,
                status: competition.status,
                operation: "place a bet",
            });
        }
        if !request.amount.is_finite() || request.amount <= 0.0 {
            return Err(Error::InvalidAmount {
                amount: request.amount,
            });
        }
        if !market.pool.is_liquid() {
            return Err(Error::LowLiquidity {
                yes: market.pool.yes,
                no: market.pool.no,
            });
        }
        if let Some(bet_id) = request.bet_id {
            if self.competitions.bet_id_exists(rwtxn, id, bet_id)? {
                return Err(Error::DuplicateBet { id, bet_id });
            }
        }
        let quote = cpmm::quote(&market.pool, request.outcome, request.amount)?;
        let bet = Bet {
            id: request.bet_id.unwrap_or_else(uuid::Uuid::new_v4),
            seq: market.bet_count,
            bettor: request.bettor.clone(),
            outcome: request.outcome,
            amount: request.amount,
            shares: quote.shares,
            probability_before: quote.probability_before,
            probability_after: quote.probability_after,
            placed_at: now,
        };
        if let Some(market) = competition.market.as_mut() {
            market.pool = quote.new_pool;
            market.probability = quote.probability_after;
            market.volume += request.amount;
            market.bet_count += 1;
        }
        self.competitions.put_bet(rwtxn, id, &bet)?;
        let placed = event(
            &mut competition,
            EventKind::BetPlaced,
            now,
            &request.bettor,
            format!(
                "bet {} on {} for {:.4} shares",
                request.amount, request.outcome, quote.shares
            ),
        )
        .with_detail("bet_id", bet.id)
        .with_detail("outcome", request.outcome)
        .with_detail("amount", request.amount)
        .with_detail("shares", quote.shares)
        .with_detail("probability_before", quote.probability_before)
        .with_detail("probability_after", quote.probability_after);
        events.push(placed);
        tracing::info!(
            %id,
            bettor = %request.bettor,
            outcome = %request.outcome,
            amount = request.amount,
            probability = quote.probability_after,
            "bet placed"
        );
        let new_probability = quote.probability_after;
        self.save(
            rwtxn,
            &previous,
            competition,
            events,
            now,
            BetPlaced {
                bet,
                new_probability,
            },
        )
    }

    pub fn vote(
        &self,
        rwtxn: &mut RwTxn,
        id: CompetitionId,
        judge: Address,
        choice: String,
        comment: Option<String>,
        now: u64,
    ) -> Result<Applied<VoteCast>, Error> {
        let (previous, mut competition, mut events) =
            self.load(rwtxn, id, now)?;
        if competition.status == Status::Completed {
            if let Some(verdict) = competition.arbitration.verdict.clone() {
                return Err(Error::AlreadyResolved { id, verdict });
            }
        }
        if !competition.status.accepts_votes() {
            return Err(Error::InvalidStatus {
                id,
                status: competition.status,
                operation: "vote",
            });
        }
        let Some(weight) = competition
            .arbitration
            .judge(&judge)
            .map(|registered| registered.weight)
        else {
            return Err(Error::NotJudge { id, address: judge });
        };
        if competition.arbitration.vote_of(&judge).is_some() {
            return Err(Error::AlreadyVoted { id, address: judge });
        }
        competition.arbitration.votes.push(Vote {
            id: uuid::Uuid::new_v4(),
            judge: judge.clone(),
            choice: choice.clone(),
            comment,
            weight,
            cast_at: now,
        });
        let progress = arbitration::tally(
            &competition.arbitration.judges,
            &competition.arbitration.votes,
            competition.arbitration.effective_threshold(),
        );
        let verdict = arbitration::check_resolution(&progress);
        if let Some(verdict) = &verdict {
            apply_verdict(&mut competition, verdict.clone(), now)?;
            tracing::info!(%id, %verdict, "competition resolved by judges");
        }
        let mut cast = event(
            &mut competition,
            EventKind::VoteCast,
            now,
            &judge,
            format!("{judge} voted `{choice}`"),
        )
        .with_detail("choice", &choice)
        .with_detail("weight", weight)
        .with_detail("approvals", progress.approval_votes)
        .with_detail("rejections", progress.rejection_votes)
        .with_detail("required", progress.required_votes);
        if let Some(verdict) = &verdict {
            cast = cast.with_detail("verdict", verdict);
        }
        events.push(cast);
        self.save(
            rwtxn,
            &previous,
            competition,
            events,
            now,
            VoteCast {
                resolution_reached: verdict.is_some(),
                progress,
                verdict,
            },
        )
    }

    pub fn register_judge(
        &self,
        rwtxn: &mut RwTxn,
        id: CompetitionId,
        caller: &Address,
        judge: Judge,
        now: u64,
    ) -> Result<Applied<()>, Error> {
        let (previous, mut competition, mut events) =
            self.load(rwtxn, id, now)?;
        if &competition.creator != caller {
            return Err(Error::Unauthorized {
                address: caller.clone(),
                operation: "register judges",
            });
        }
        if !competition.status.accepts_judges() {
            return Err(Error::InvalidStatus {
                id,
                status: competition.status,
                operation: "register a judge",
            });
        }
        if competition.arbitration.judge(&judge.address).is_some() {
            return Err(Error::JudgeExists {
                id,
                address: judge.address,
            });
        }
        let registered = event(
            &mut competition,
            EventKind::JudgeRegistered,
            now,
            caller,
            format!("registered {} as {}", judge.address, judge.role),
        )
        .with_detail("judge", &judge.address)
        .with_detail("role", judge.role)
        .with_detail("weight", judge.weight);
        events.push(registered);
        competition.arbitration.judges.push(judge);
        self.save(rwtxn, &previous, competition, events, now, ())
    }

    /// Creator-driven lifecycle move. Terminal statuses are reached through
    /// votes, disputes and cancellation only.
    pub fn transition(
        &self,
        rwtxn: &mut RwTxn,
        id: CompetitionId,
        caller: &Address,
        to: Status,
        now: u64,
    ) -> Result<Applied<()>, Error> {
        let (previous, mut competition, mut events) =
            self.load(rwtxn, id, now)?;
        if &competition.creator != caller {
            return Err(Error::Unauthorized {
                address: caller.clone(),
                operation: "transition",
            });
        }
        if to.is_terminal() || !competition.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: competition.status,
                to,
            });
        }
        change_status(&mut competition, to, caller, "creator", now, &mut events)?;
        self.save(rwtxn, &previous, competition, events, now, ())
    }

    pub fn dispute(
        &self,
        rwtxn: &mut RwTxn,
        id: CompetitionId,
        caller: &Address,
        reason: String,
        now: u64,
    ) -> Result<Applied<()>, Error> {
        let (previous, mut competition, mut events) =
            self.load(rwtxn, id, now)?;
        if competition.status != Status::Resolving {
            return Err(Error::InvalidStatus {
                id,
                status: competition.status,
                operation: "dispute",
            });
        }
        if competition.participant(caller).is_none()
            && competition.arbitration.judge(caller).is_none()
        {
            return Err(Error::Unauthorized {
                address: caller.clone(),
                operation: "dispute",
            });
        }
        apply_verdict(&mut competition, Verdict::Disputed, now)?;
        let disputed = event(
            &mut competition,
            EventKind::Disputed,
            now,
            caller,
            format!("{caller} disputed the outcome"),
        )
        .with_detail("reason", &reason);
        events.push(disputed);
        tracing::info!(%id, %caller, "competition disputed");
        self.save(rwtxn, &previous, competition, events, now, ())
    }

    pub fn cancel(
        &self,
        rwtxn: &mut RwTxn,
        id: CompetitionId,
        caller: &Address,
        reason: String,
        now: u64,
    ) -> Result<Applied<()>, Error> {
        let (previous, mut competition, mut events) =
            self.load(rwtxn, id, now)?;
        if &competition.creator != caller {
            return Err(Error::Unauthorized {
                address: caller.clone(),
                operation: "cancel",
            });
        }
        if competition.status.is_terminal() {
            return Err(Error::InvalidStatus {
                id,
                status: competition.status,
                operation: "cancel",
            });
        }
        competition.set_status(Status::Cancelled)?;
        let cancelled = event(
            &mut competition,
            EventKind::Cancelled,
            now,
            caller,
            "competition cancelled".to_owned(),
        )
        .with_detail("reason", &reason);
        events.push(cancelled);
        tracing::info!(%id, "competition cancelled");
        self.save(rwtxn, &previous, competition, events, now, ())
    }

    /// Record an action taken against the competition's custody vault
    #[allow(clippy::too_many_arguments)]
    pub fn record_custody_event(
        &self,
        rwtxn: &mut RwTxn,
        id: CompetitionId,
        actor: &Address,
        kind: EventKind,
        tx_hash: String,
        verified: bool,
        now: u64,
    ) -> Result<Applied<()>, Error> {
        let previous = self.competitions.get_competition(rwtxn, &id)?;
        let mut competition = previous.clone();
        let recorded = event(
            &mut competition,
            kind,
            now,
            actor,
            format!("custody {kind} {tx_hash}"),
        )
        .with_proof(tx_hash, verified);
        self.save(rwtxn, &previous, competition, vec![recorded], now, ())
    }

    /// Apply due timeline transitions to every pending or active competition
    pub fn sync_due(
        &self,
        rwtxn: &mut RwTxn,
        now: u64,
    ) -> Result<Vec<Applied<()>>, Error> {
        let mut candidates = Vec::new();
        for status in [Status::Pending, Status::Active] {
            let filter = CompetitionFilter {
                status: Some(status),
                ..CompetitionFilter::default()
            };
            candidates.extend(
                self.competitions
                    .list_competitions(rwtxn, &filter)?
                    .into_iter()
                    .filter(|competition| {
                        !competition.due_transitions(now).is_empty()
                    }),
            );
        }
        let mut applied = Vec::with_capacity(candidates.len());
        for previous in candidates {
            let mut competition = previous.clone();
            let mut events = Vec::new();
            sync_timeline(&mut competition, now, &mut events)?;
            applied.push(self.save(
                rwtxn,
                &previous,
                competition,
                events,
                now,
                (),
            )?);
        }
        Ok(applied)
    }

    pub fn voting_progress(
        &self,
        rotxn: &RoTxn,
        id: CompetitionId,
    ) -> Result<VotingProgress, Error> {
        let competition = self.get_competition(rotxn, id)?;
        Ok(arbitration::tally(
            &competition.arbitration.judges,
            &competition.arbitration.votes,
            competition.arbitration.effective_threshold(),
        ))
    }

    pub fn write_events(
        &self,
        rwtxn: &mut RwTxn,
        events: &[TransparencyEvent],
    ) -> Result<(), Error> {
        for event in events {
            self.events.append(rwtxn, event)?;
        }
        Ok(())
    }

    /// Last `limit` durable events of a competition
    pub fn recent_events(
        &self,
        rotxn: &RoTxn,
        id: CompetitionId,
        limit: usize,
    ) -> Result<Vec<TransparencyEvent>, Error> {
        let competition = self.get_competition(rotxn, id)?;
        self.events
            .recent(rotxn, id, competition.event_seq, limit)
    }
}
