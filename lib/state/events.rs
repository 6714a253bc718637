//! Append-only transparency log

use std::collections::BTreeMap;

use heed::types::SerdeBincode;
use serde::{Deserialize, Serialize};
use sneed::{DatabaseUnique, Env, RoTxn, RwTxn};
use utoipa::ToSchema;

use crate::{
    state::Error,
    types::{Address, CompetitionId},
};

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
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Created,
    StatusChanged,
    ParticipantJoined,
    JudgeRegistered,
    BetPlaced,
    VoteCast,
    Resolved,
    Disputed,
    Cancelled,
    CustodyProposed,
    CustodyConfirmed,
    CustodyExecuted,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct TransparencyEvent {
    pub competition_id: CompetitionId,
    pub seq: u64,
    pub kind: EventKind,
    pub timestamp: u64,
    pub actor: Address,
    /// Human-readable summary
    pub action: String,
    pub details: BTreeMap<String, String>,
    /// External proof reference such as a custody transaction hash
    pub proof: Option<String>,
    pub verified: bool,
}

impl TransparencyEvent {
    pub fn new(
        competition_id: CompetitionId,
        seq: u64,
        kind: EventKind,
        timestamp: u64,
        actor: Address,
        action: impl Into<String>,
    ) -> Self {
        Self {
            competition_id,
            seq,
            kind,
            timestamp,
            actor,
            action: action.into(),
            details: BTreeMap::new(),
            proof: None,
            verified: false,
        }
    }

    pub fn with_detail(
        mut self,
        key: &str,
        value: impl ToString,
    ) -> Self {
        self.details.insert(key.to_owned(), value.to_string());
        self
    }

    pub fn with_proof(mut self, proof: String, verified: bool) -> Self {
        self.proof = Some(proof);
        self.verified = verified;
        self
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct EventKey {
    competition_id: CompetitionId,
    seq: u64,
}

#[derive(Clone)]
pub struct EventLog {
    events: DatabaseUnique<SerdeBincode<EventKey>, SerdeBincode<TransparencyEvent>>,
}

impl EventLog {
    pub const NUM_DBS: u32 = 1;

    pub fn new(env: &Env, rwtxn: &mut RwTxn) -> Result<Self, Error> {
        let events =
            DatabaseUnique::create(env, rwtxn, "transparency_events")?;
        Ok(Self { events })
    }

    pub fn append(
        &self,
        rwtxn: &mut RwTxn,
        event: &TransparencyEvent,
    ) -> Result<(), Error> {
        let key = EventKey {
            competition_id: event.competition_id,
            seq: event.seq,
        };
        self.events.put(rwtxn, &key, event)?;
        Ok(())
    }

    /// Events with sequence numbers in `from..to`, skipping any whose
    /// durable write never landed
    pub fn range(
        &self,
        rotxn: &RoTxn,
        competition_id: CompetitionId,
        from: u64,
        to: u64,
    ) -> Result<Vec<TransparencyEvent>, Error> {
        let mut events = Vec::new();
        for seq in from..to {
            let key = EventKey {
                competition_id,
                seq,
            };
            if let Some(event) = self.events.try_get(rotxn, &key)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// The last `limit` events out of `event_seq` allocated
    pub fn recent(
        &self,
        rotxn: &RoTxn,
        competition_id: CompetitionId,
        event_seq: u64,
        limit: usize,
    ) -> Result<Vec<TransparencyEvent>, Error> {
        let from = event_seq.saturating_sub(limit as u64);
        self.range(rotxn, competition_id, from, event_seq)
    }
}
