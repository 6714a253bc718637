//! Live fan-out of transparency events with a bounded recent-history cache

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use futures::{Stream, StreamExt as _};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{state::TransparencyEvent, types::CompetitionId};

pub const DEFAULT_RECENT_CAPACITY: usize = 128;
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<TransparencyEvent>,
    recent: Arc<Mutex<HashMap<CompetitionId, VecDeque<TransparencyEvent>>>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sender,
            recent: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Cache and broadcast committed events. Callers publish in commit
    /// order; the cache keeps each buffer sorted by sequence and ignores
    /// repeats.
    pub fn publish(&self, events: &[TransparencyEvent]) {
        {
            let mut recent = self.recent.lock();
            for event in events {
                let buffer = recent.entry(event.competition_id).or_default();
                match buffer.binary_search_by_key(&event.seq, |cached| cached.seq)
                {
                    Ok(_) => continue,
                    Err(index) => buffer.insert(index, event.clone()),
                }
                while buffer.len() > self.capacity {
                    buffer.pop_front();
                }
            }
        }
        for event in events {
            if self.sender.send(event.clone()).is_err() {
                // no subscribers
                break;
            }
        }
    }

    /// Last `limit` of the `event_seq` allocated events of a competition,
    /// oldest first. Returns `None` unless the cache holds all of them.
    pub fn recent(
        &self,
        competition_id: CompetitionId,
        limit: usize,
        event_seq: u64,
    ) -> Option<Vec<TransparencyEvent>> {
        let recent = self.recent.lock();
        let buffer = recent.get(&competition_id)?;
        let wanted = (limit as u64).min(event_seq);
        let first_wanted = event_seq - wanted;
        let events: Vec<_> = buffer
            .iter()
            .filter(|event| (first_wanted..event_seq).contains(&event.seq))
            .cloned()
            .collect();
        (events.len() as u64 == wanted).then_some(events)
    }

    /// Stream of future events for one competition. Lagging subscribers
    /// skip what they missed.
    pub fn subscribe(
        &self,
        competition_id: CompetitionId,
    ) -> impl Stream<Item = TransparencyEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(
            move |event| {
                let event = match event {
                    Ok(event) if event.competition_id == competition_id => {
                        Some(event)
                    }
                    Ok(_) => None,
                    Err(err) => {
                        tracing::warn!(
                            %competition_id,
                            "event subscriber lagged: {err}"
                        );
                        None
                    }
                };
                futures::future::ready(event)
            },
        )
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state::EventKind, types::Address};

    fn event(id: CompetitionId, seq: u64) -> TransparencyEvent {
        TransparencyEvent::new(
            id,
            seq,
            EventKind::VoteCast,
            seq,
            Address::from_bytes([1; 20]),
            "vote",
        )
    }

    #[test]
    fn cache_is_bounded_per_competition() {
        let hub = EventHub::new(3);
        let a = CompetitionId::new([1; 8]);
        let b = CompetitionId::new([2; 8]);
        let events: Vec<_> = (0..5).map(|seq| event(a, seq)).collect();
        hub.publish(&events);
        hub.publish(&[event(b, 0)]);

        let cached = hub.recent(a, 3, 5).unwrap();
        let seqs: Vec<_> = cached.iter().map(|event| event.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(hub.recent(a, 2, 5).unwrap().len(), 2);
        // older than the cache holds
        assert!(hub.recent(a, 4, 5).is_none());
        // the cache is behind the allocated sequence
        assert!(hub.recent(a, 2, 7).is_none());
        assert_eq!(hub.recent(b, 10, 1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribers_only_see_their_competition() {
        let hub = EventHub::default();
        let a = CompetitionId::new([1; 8]);
        let b = CompetitionId::new([2; 8]);
        let stream = hub.subscribe(a);
        hub.publish(&[event(b, 0), event(a, 0), event(a, 1)]);
        drop(hub);
        let received: Vec<_> = stream.collect().await;
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|event| event.competition_id == a));
    }
}
