//! Competition store: primary records, bets and secondary indexes

use fallible_iterator::FallibleIterator;
use heed::types::SerdeBincode;
use serde::{Deserialize, Serialize};
use sneed::{DatabaseUnique, Env, RoTxn, RwTxn};

use crate::{
    state::{
        Error,
        competition::{Bet, Category, Competition, Status},
    },
    types::{Address, CompetitionId},
};

/// Key of one bet in a competition's ordered bet list
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct BetKey {
    competition_id: CompetitionId,
    seq: u32,
}

/// Filters for listing competitions. Every set filter must match.
#[derive(Clone, Debug, Default)]
pub struct CompetitionFilter {
    pub category: Option<Category>,
    pub creator: Option<Address>,
    pub participant: Option<Address>,
    pub status: Option<Status>,
}

type IndexDb<K> = DatabaseUnique<SerdeBincode<K>, SerdeBincode<Vec<CompetitionId>>>;

#[derive(Clone)]
pub struct CompetitionsDatabase {
    competitions:
        DatabaseUnique<SerdeBincode<CompetitionId>, SerdeBincode<Competition>>,
    bets: DatabaseUnique<SerdeBincode<BetKey>, SerdeBincode<Bet>>,
    /// Idempotency keys of accepted bets
    bet_ids: DatabaseUnique<
        SerdeBincode<(CompetitionId, uuid::Uuid)>,
        SerdeBincode<u32>,
    >,
    category_index: IndexDb<Category>,
    creator_index: IndexDb<Address>,
    participant_index: IndexDb<Address>,
    status_index: IndexDb<Status>,
}

fn index_insert<K>(
    db: &IndexDb<K>,
    rwtxn: &mut RwTxn,
    key: &K,
    id: CompetitionId,
) -> Result<(), Error>
where
    K: Serialize + for<'de> Deserialize<'de> + 'static,
{
    let mut ids = db.try_get(rwtxn, key)?.unwrap_or_default();
    if !ids.contains(&id) {
        ids.push(id);
        db.put(rwtxn, key, &ids)?;
    }
    Ok(())
}

fn index_remove<K>(
    db: &IndexDb<K>,
    rwtxn: &mut RwTxn,
    key: &K,
    id: CompetitionId,
) -> Result<(), Error>
where
    K: Serialize + for<'de> Deserialize<'de> + 'static,
{
    let mut ids = db.try_get(rwtxn, key)?.unwrap_or_default();
    ids.retain(|existing| *existing != id);
    if ids.is_empty() {
        db.delete(rwtxn, key)?;
    } else {
        db.put(rwtxn, key, &ids)?;
    }
    Ok(())
}

impl CompetitionsDatabase {
    pub const NUM_DBS: u32 = 7;

    pub fn new(env: &Env, rwtxn: &mut RwTxn) -> Result<Self, Error> {
        let competitions = DatabaseUnique::create(env, rwtxn, "competitions")?;
        let bets = DatabaseUnique::create(env, rwtxn, "competition_bets")?;
        let bet_ids = DatabaseUnique::create(env, rwtxn, "competition_bet_ids")?;
        let category_index =
            DatabaseUnique::create(env, rwtxn, "competitions_by_category")?;
        let creator_index =
            DatabaseUnique::create(env, rwtxn, "competitions_by_creator")?;
        let participant_index =
            DatabaseUnique::create(env, rwtxn, "competitions_by_participant")?;
        let status_index =
            DatabaseUnique::create(env, rwtxn, "competitions_by_status")?;
        Ok(Self {
            competitions,
            bets,
            bet_ids,
            category_index,
            creator_index,
            participant_index,
            status_index,
        })
    }

    /// Insert a new competition and its index entries
    pub fn add_competition(
        &self,
        rwtxn: &mut RwTxn,
        competition: &Competition,
    ) -> Result<(), Error> {
        if self.competitions.try_get(rwtxn, &competition.id)?.is_some() {
            return Err(Error::AlreadyExists { id: competition.id });
        }
        self.competitions.put(rwtxn, &competition.id, competition)?;
        index_insert(
            &self.category_index,
            rwtxn,
            &competition.category,
            competition.id,
        )?;
        index_insert(
            &self.creator_index,
            rwtxn,
            &competition.creator,
            competition.id,
        )?;
        index_insert(
            &self.status_index,
            rwtxn,
            &competition.status,
            competition.id,
        )?;
        for entry in &competition.participants {
            index_insert(
                &self.participant_index,
                rwtxn,
                &entry.address,
                competition.id,
            )?;
        }
        tracing::debug!(id = %competition.id, "stored new competition");
        Ok(())
    }

    /// Overwrite a competition, keeping the status and participant indexes
    /// consistent with the previous version.
    pub fn update_competition(
        &self,
        rwtxn: &mut RwTxn,
        previous: &Competition,
        competition: &Competition,
    ) -> Result<(), Error> {
        self.competitions.put(rwtxn, &competition.id, competition)?;
        if previous.status != competition.status {
            index_remove(
                &self.status_index,
                rwtxn,
                &previous.status,
                competition.id,
            )?;
            index_insert(
                &self.status_index,
                rwtxn,
                &competition.status,
                competition.id,
            )?;
        }
        for entry in &competition.participants[previous.participants.len()..]
        {
            index_insert(
                &self.participant_index,
                rwtxn,
                &entry.address,
                competition.id,
            )?;
        }
        tracing::debug!(
            id = %competition.id,
            version = competition.version,
            "updated competition"
        );
        Ok(())
    }

    pub fn try_get_competition(
        &self,
        rotxn: &RoTxn,
        id: &CompetitionId,
    ) -> Result<Option<Competition>, Error> {
        Ok(self.competitions.try_get(rotxn, id)?)
    }

    pub fn get_competition(
        &self,
        rotxn: &RoTxn,
        id: &CompetitionId,
    ) -> Result<Competition, Error> {
        self.try_get_competition(rotxn, id)?
            .ok_or(Error::NotFound { id: *id })
    }

    fn ids_for_filter(
        &self,
        rotxn: &RoTxn,
        filter: &CompetitionFilter,
    ) -> Result<Option<Vec<CompetitionId>>, Error> {
        // Narrow with the most selective index available
        let ids = if let Some(participant) = &filter.participant {
            self.participant_index.try_get(rotxn, participant)?
        } else if let Some(creator) = &filter.creator {
            self.creator_index.try_get(rotxn, creator)?
        } else if let Some(status) = &filter.status {
            self.status_index.try_get(rotxn, status)?
        } else if let Some(category) = &filter.category {
            self.category_index.try_get(rotxn, category)?
        } else {
            return Ok(None);
        };
        Ok(Some(ids.unwrap_or_default()))
    }

    /// Competitions matching `filter`, newest first
    pub fn list_competitions(
        &self,
        rotxn: &RoTxn,
        filter: &CompetitionFilter,
    ) -> Result<Vec<Competition>, Error> {
        let mut competitions: Vec<Competition> =
            match self.ids_for_filter(rotxn, filter)? {
                Some(ids) => {
                    let mut competitions = Vec::with_capacity(ids.len());
                    for id in ids {
                        if let Some(competition) =
                            self.competitions.try_get(rotxn, &id)?
                        {
                            competitions.push(competition);
                        }
                    }
                    competitions
                }
                None => self
                    .competitions
                    .iter(rotxn)?
                    .map(|(_, competition)| Ok(competition))
                    .collect()?,
            };
        competitions.retain(|competition| {
            filter.category.is_none_or(|c| competition.category == c)
                && filter.status.is_none_or(|s| competition.status == s)
                && filter
                    .creator
                    .as_ref()
                    .is_none_or(|creator| &competition.creator == creator)
                && filter.participant.as_ref().is_none_or(|participant| {
                    competition.participant(participant).is_some()
                })
        });
        competitions.sort_by(|a, b| {
            b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id))
        });
        Ok(competitions)
    }

    pub fn bet_id_exists(
        &self,
        rotxn: &RoTxn,
        id: CompetitionId,
        bet_id: uuid::Uuid,
    ) -> Result<bool, Error> {
        Ok(self.bet_ids.try_get(rotxn, &(id, bet_id))?.is_some())
    }

    pub fn put_bet(
        &self,
        rwtxn: &mut RwTxn,
        id: CompetitionId,
        bet: &Bet,
    ) -> Result<(), Error> {
        let key = BetKey {
            competition_id: id,
            seq: bet.seq,
        };
        self.bets.put(rwtxn, &key, bet)?;
        self.bet_ids.put(rwtxn, &(id, bet.id), &bet.seq)?;
        Ok(())
    }

    /// Bets on a competition in the order they were placed
    pub fn get_bets(
        &self,
        rotxn: &RoTxn,
        competition: &Competition,
    ) -> Result<Vec<Bet>, Error> {
        let count = competition
            .market
            .as_ref()
            .map_or(0, |market| market.bet_count);
        let mut bets = Vec::with_capacity(count as usize);
        for seq in 0..count {
            let key = BetKey {
                competition_id: competition.id,
                seq,
            };
            if let Some(bet) = self.bets.try_get(rotxn, &key)? {
                bets.push(bet);
            }
        }
        Ok(bets)
    }
}
