use std::{path::PathBuf, sync::Arc, time::Duration};

use futures::Stream;
use parking_lot::Mutex;
use sneed::{Env, EnvError, RwTxn, env};

use crate::{
    custody::{self, Balance, Custody, CustodyTransaction, Proposal},
    math::{
        arbitration::VotingProgress,
        cpmm::{self, Outcome, TradeQuote},
    },
    state::{
        self, Applied, Bet, BetPlaced, BetRequest, Competition,
        CompetitionBuilder, CompetitionFilter, EventKind, JoinRequest, Joined,
        Judge, State, Status, TransparencyEvent, VoteCast, settlement,
    },
    types::{self, Address, CompetitionId},
    validation,
};

mod hub;

pub use hub::{DEFAULT_RECENT_CAPACITY, EventHub};

#[derive(Clone, Debug)]
pub struct Config {
    pub datadir: PathBuf,
    pub map_size_mb: usize,
    /// Capacity of the per-competition recent event cache
    pub recent_events: usize,
    /// Owners of every competition vault; no vault is created when empty
    pub vault_owners: Vec<Address>,
    pub vault_threshold: u32,
    /// Receives platform fees and proposes settlement transactions
    pub platform_address: Option<Address>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datadir: PathBuf::from("."),
            map_size_mb: 1024,
            recent_events: DEFAULT_RECENT_CAPACITY,
            vault_owners: Vec::new(),
            vault_threshold: 1,
            platform_address: None,
        }
    }
}

#[allow(clippy::duplicated_attributes)]
#[derive(thiserror::Error, transitive::Transitive, Debug)]
#[transitive(from(env::error::OpenEnv, EnvError))]
#[transitive(from(env::error::ReadTxn, EnvError))]
pub enum Error {
    #[error(transparent)]
    Custody(#[from] custody::Error),
    #[error("Database env error")]
    DbEnv(#[from] EnvError),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("custody transaction {hash} does not spend from the vault of competition {id}")]
    ForeignTransaction { id: CompetitionId, hash: String },
    #[error("competition {id} has no custody vault")]
    NoVault { id: CompetitionId },
    #[error(transparent)]
    State(Box<state::Error>),
    #[error(transparent)]
    Validation(#[from] validation::Error),
}

impl From<state::Error> for Error {
    fn from(err: state::Error) -> Self {
        Self::State(Box::new(err))
    }
}

impl Error {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Custody(err) => err.code(),
            Self::ForeignTransaction { .. } => "CUSTODY_ERROR",
            Self::DbEnv(_) => "SCRIPT_ERROR",
            Self::Io(_) => "INTERNAL_ERROR",
            Self::NoVault { .. } => "NO_VAULT",
            Self::State(err) => err.code(),
            Self::Validation(err) => err.code(),
        }
    }
}

#[derive(Clone)]
pub struct Node {
    env: Env,
    state: State,
    hub: EventHub,
    custody: Arc<dyn Custody>,
    config: Arc<Config>,
    /// Held from the write transaction until its events are broadcast, so
    /// subscribers see events in commit order
    write_lock: Arc<Mutex<()>>,
}

impl Node {
    pub fn new(config: Config, custody: Arc<dyn Custody>) -> Result<Self, Error> {
        let env_path = config.datadir.join("data.mdb");
        std::fs::create_dir_all(&env_path)?;
        let env = {
            let mut env_open_opts = heed::EnvOpenOptions::new();
            env_open_opts
                .map_size(config.map_size_mb * 1024 * 1024)
                .max_dbs(State::NUM_DBS);
            unsafe { Env::open(&env_open_opts, &env_path) }?
        };
        let state = State::new(&env)?;
        tracing::info!(path = %env_path.display(), "opened competition store");
        Ok(Self {
            env,
            state,
            hub: EventHub::new(config.recent_events),
            custody,
            config: Arc::new(config),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `f` in a write transaction, retrying once if the transaction
    /// mechanism itself fails
    fn run_txn<T>(
        &self,
        operation: &'static str,
        f: impl Fn(&State, &mut RwTxn) -> Result<T, state::Error>,
    ) -> Result<T, Error> {
        let attempt = || -> Result<T, state::Error> {
            let mut rwtxn = self.env.write_txn()?;
            let value = f(&self.state, &mut rwtxn)?;
            rwtxn.commit()?;
            Ok(value)
        };
        match attempt() {
            Err(err) if err.is_retryable() => {
                tracing::warn!(operation, "store transaction failed, retrying: {err:#}");
                attempt().map_err(|err| {
                    tracing::error!(
                        operation,
                        "store transaction failed after retry: {err:#}"
                    );
                    Error::from(err)
                })
            }
            result => Ok(result?),
        }
    }

    fn persist_events(
        &self,
        events: &[TransparencyEvent],
    ) -> Result<(), state::Error> {
        let mut rwtxn = self.env.write_txn()?;
        self.state.write_events(&mut rwtxn, events)?;
        rwtxn.commit()?;
        Ok(())
    }

    /// Durably record and broadcast committed events. Failures are logged
    /// and never undo the mutation.
    fn publish(&self, events: &[TransparencyEvent]) {
        self.publish_with(events, |events| self.persist_events(events))
    }

    fn publish_with(
        &self,
        events: &[TransparencyEvent],
        persist: impl FnOnce(&[TransparencyEvent]) -> Result<(), state::Error>,
    ) {
        if events.is_empty() {
            return;
        }
        if let Err(err) = persist(events) {
            tracing::warn!(
                competition_id = %events[0].competition_id,
                "failed to persist transparency events: {err:#}"
            );
        }
        self.hub.publish(events);
    }

    fn mutate<T>(
        &self,
        operation: &'static str,
        f: impl Fn(&State, &mut RwTxn) -> Result<Applied<T>, state::Error>,
    ) -> Result<Applied<T>, Error> {
        let applied = {
            let _write = self.write_lock.lock();
            let applied = self.run_txn(operation, f)?;
            self.publish(&applied.events);
            applied
        };
        if applied.terminal {
            self.spawn_settlement(applied.competition.clone());
        }
        Ok(applied)
    }

    pub async fn create_competition(
        &self,
        builder: CompetitionBuilder,
    ) -> Result<Competition, Error> {
        let now = types::now();
        let nonce = uuid::Uuid::new_v4();
        let mut competition = builder.build(now, nonce.as_bytes())?;
        if !self.config.vault_owners.is_empty() {
            match self
                .custody
                .predict_address(
                    self.config.vault_owners.clone(),
                    self.config.vault_threshold,
                    competition.id.to_string(),
                )
                .await
            {
                Ok(vault) => competition.vault = Some(vault),
                Err(err) => tracing::warn!(
                    id = %competition.id,
                    "failed to predict vault address: {err:#}"
                ),
            }
        }
        let applied = self.mutate("create_competition", |state, rwtxn| {
            state.create_competition(rwtxn, competition.clone(), now)
        })?;
        Ok(applied.competition)
    }

    pub fn join(
        &self,
        id: CompetitionId,
        request: JoinRequest,
    ) -> Result<Applied<Joined>, Error> {
        validation::JoinValidator::validate_join(
            &request.position,
            request.stake,
        )?;
        let now = types::now();
        self.mutate("join", |state, rwtxn| {
            state.join(rwtxn, id, request.clone(), now)
        })
    }

    pub fn place_bet(
        &self,
        id: CompetitionId,
        request: BetRequest,
    ) -> Result<Applied<BetPlaced>, Error> {
        let now = types::now();
        self.mutate("place_bet", |state, rwtxn| {
            state.place_bet(rwtxn, id, request.clone(), now)
        })
    }

    pub fn vote(
        &self,
        id: CompetitionId,
        judge: Address,
        choice: String,
        comment: Option<String>,
    ) -> Result<Applied<VoteCast>, Error> {
        validation::VoteValidator::validate_vote(&choice, comment.as_deref())?;
        let now = types::now();
        self.mutate("vote", |state, rwtxn| {
            state.vote(
                rwtxn,
                id,
                judge.clone(),
                choice.clone(),
                comment.clone(),
                now,
            )
        })
    }

    pub fn register_judge(
        &self,
        id: CompetitionId,
        caller: Address,
        judge: Judge,
    ) -> Result<Competition, Error> {
        validation::JudgeValidator::validate_weight(judge.weight)?;
        let now = types::now();
        let applied = self.mutate("register_judge", |state, rwtxn| {
            state.register_judge(rwtxn, id, &caller, judge.clone(), now)
        })?;
        Ok(applied.competition)
    }

    pub fn transition(
        &self,
        id: CompetitionId,
        caller: Address,
        to: Status,
    ) -> Result<Competition, Error> {
        let now = types::now();
        let applied = self.mutate("transition", |state, rwtxn| {
            state.transition(rwtxn, id, &caller, to, now)
        })?;
        Ok(applied.competition)
    }

    pub fn dispute(
        &self,
        id: CompetitionId,
        caller: Address,
        reason: String,
    ) -> Result<Competition, Error> {
        validation::validate_reason(&reason)?;
        let now = types::now();
        let applied = self.mutate("dispute", |state, rwtxn| {
            state.dispute(rwtxn, id, &caller, reason.clone(), now)
        })?;
        Ok(applied.competition)
    }

    pub fn cancel(
        &self,
        id: CompetitionId,
        caller: Address,
        reason: String,
    ) -> Result<Competition, Error> {
        validation::validate_reason(&reason)?;
        let now = types::now();
        let applied = self.mutate("cancel", |state, rwtxn| {
            state.cancel(rwtxn, id, &caller, reason.clone(), now)
        })?;
        Ok(applied.competition)
    }

    /// Apply due timeline transitions to every open competition
    pub fn sync_timelines(&self) -> Result<usize, Error> {
        let now = types::now();
        let applied = {
            let _write = self.write_lock.lock();
            let applied = self
                .run_txn("sync_timelines", |state, rwtxn| state.sync_due(rwtxn, now))?;
            for applied in &applied {
                self.publish(&applied.events);
            }
            applied
        };
        for applied in &applied {
            if applied.terminal {
                self.spawn_settlement(applied.competition.clone());
            }
        }
        Ok(applied.len())
    }

    /// Periodically apply timeline transitions so that competitions nobody
    /// touches still start, end and resolve
    pub async fn run_timeline_task(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match self.sync_timelines() {
                Ok(0) => (),
                Ok(count) => {
                    tracing::debug!(count, "applied timeline transitions")
                }
                Err(err) => {
                    tracing::warn!("timeline sync failed: {err:#}")
                }
            }
        }
    }

    pub fn get_competition(
        &self,
        id: CompetitionId,
    ) -> Result<Competition, Error> {
        let rotxn = self.env.read_txn()?;
        Ok(self.state.get_competition(&rotxn, id)?)
    }

    pub fn list_competitions(
        &self,
        filter: &CompetitionFilter,
    ) -> Result<Vec<Competition>, Error> {
        let rotxn = self.env.read_txn()?;
        Ok(self.state.competitions().list_competitions(&rotxn, filter)?)
    }

    pub fn get_bets(&self, id: CompetitionId) -> Result<Vec<Bet>, Error> {
        let rotxn = self.env.read_txn()?;
        let competition = self.state.get_competition(&rotxn, id)?;
        Ok(self.state.competitions().get_bets(&rotxn, &competition)?)
    }

    /// Price a bet against the current pool without placing it
    pub fn quote_bet(
        &self,
        id: CompetitionId,
        outcome: Outcome,
        amount: f64,
    ) -> Result<TradeQuote, Error> {
        let competition = self.get_competition(id)?;
        if !competition.category.is_market_based() {
            return Err(state::Error::NotPrediction { id }.into());
        }
        let market = competition
            .market
            .ok_or(state::Error::NoMarket { id })?;
        Ok(cpmm::quote(&market.pool, outcome, amount)
            .map_err(state::Error::from)?)
    }

    pub fn voting_progress(
        &self,
        id: CompetitionId,
    ) -> Result<VotingProgress, Error> {
        let rotxn = self.env.read_txn()?;
        Ok(self.state.voting_progress(&rotxn, id)?)
    }

    /// Last `limit` events, from the cache when it covers the request
    pub fn recent_events(
        &self,
        id: CompetitionId,
        limit: usize,
    ) -> Result<Vec<TransparencyEvent>, Error> {
        let rotxn = self.env.read_txn()?;
        let competition = self.state.get_competition(&rotxn, id)?;
        if let Some(events) = self.hub.recent(id, limit, competition.event_seq)
        {
            return Ok(events);
        }
        tracing::debug!(%id, limit, "recent events served from store");
        Ok(self.state.events().recent(
            &rotxn,
            id,
            competition.event_seq,
            limit,
        )?)
    }

    pub fn subscribe_events(
        &self,
        id: CompetitionId,
    ) -> impl Stream<Item = TransparencyEvent> + Send + 'static {
        self.hub.subscribe(id)
    }

    fn vault_of(&self, id: CompetitionId) -> Result<Address, Error> {
        self.get_competition(id)?
            .vault
            .ok_or(Error::NoVault { id })
    }

    pub async fn vault_balance(
        &self,
        id: CompetitionId,
    ) -> Result<Balance, Error> {
        let vault = self.vault_of(id)?;
        Ok(self.custody.get_balance(vault).await?)
    }

    fn record_custody(
        &self,
        id: CompetitionId,
        actor: &Address,
        kind: EventKind,
        transaction: &CustodyTransaction,
    ) -> Result<(), Error> {
        let now = types::now();
        self.mutate("record_custody_event", |state, rwtxn| {
            state.record_custody_event(
                rwtxn,
                id,
                actor,
                kind,
                transaction.hash.clone(),
                transaction.executed,
                now,
            )
        })?;
        Ok(())
    }

    pub async fn propose_custody_transaction(
        &self,
        id: CompetitionId,
        caller: Address,
        to: Address,
        value: f64,
    ) -> Result<CustodyTransaction, Error> {
        if !value.is_finite() || value <= 0.0 {
            return Err(validation::Error::InvalidAmount { amount: value }.into());
        }
        let vault = self.vault_of(id)?;
        let proposal = Proposal {
            vault,
            proposer: caller.clone(),
            to,
            value,
            data: Some(format!("competition:{id}")),
        };
        let transaction = self.custody.propose_transaction(proposal).await?;
        self.record_custody(id, &caller, EventKind::CustodyProposed, &transaction)?;
        Ok(transaction)
    }

    /// Check that `hash` spends from the vault of competition `id`
    async fn check_vault_transaction(
        &self,
        id: CompetitionId,
        hash: &str,
    ) -> Result<(), Error> {
        let vault = self.vault_of(id)?;
        let transaction = self.custody.get_transaction(hash.to_owned()).await?;
        if transaction.vault != vault {
            return Err(Error::ForeignTransaction {
                id,
                hash: hash.to_owned(),
            });
        }
        Ok(())
    }

    pub async fn confirm_custody_transaction(
        &self,
        id: CompetitionId,
        caller: Address,
        hash: String,
    ) -> Result<CustodyTransaction, Error> {
        self.check_vault_transaction(id, &hash).await?;
        let transaction = self
            .custody
            .confirm_transaction(hash, caller.clone())
            .await?;
        self.record_custody(id, &caller, EventKind::CustodyConfirmed, &transaction)?;
        Ok(transaction)
    }

    pub async fn execute_custody_transaction(
        &self,
        id: CompetitionId,
        caller: Address,
        hash: String,
    ) -> Result<CustodyTransaction, Error> {
        self.check_vault_transaction(id, &hash).await?;
        let transaction = self.custody.execute_transaction(hash).await?;
        self.record_custody(id, &caller, EventKind::CustodyExecuted, &transaction)?;
        Ok(transaction)
    }

    pub async fn get_custody_transaction(
        &self,
        hash: String,
    ) -> Result<CustodyTransaction, Error> {
        Ok(self.custody.get_transaction(hash).await?)
    }

    /// Propose payout transactions for a competition that reached a
    /// terminal status. Runs in the background; never blocks the caller.
    fn spawn_settlement(&self, competition: Competition) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                id = %competition.id,
                "no async runtime, settlement not proposed"
            );
            return;
        };
        let node = self.clone();
        handle.spawn(async move {
            let id = competition.id;
            if let Err(err) = node.settle(competition).await {
                tracing::warn!(%id, "settlement failed: {err:#}");
            }
        });
    }

    async fn settle(&self, competition: Competition) -> Result<(), Error> {
        let id = competition.id;
        let Some(vault) = competition.vault.clone() else {
            tracing::debug!(%id, "no vault, nothing to settle");
            return Ok(());
        };
        let Some(proposer) = self
            .config
            .platform_address
            .clone()
            .or_else(|| self.config.vault_owners.first().cloned())
        else {
            tracing::warn!(%id, "no proposer configured for settlement");
            return Ok(());
        };
        let bets = self.get_bets(id)?;
        let Some(plan) = settlement::plan(&competition, &bets) else {
            return Ok(());
        };
        let mut transfers: Vec<(Address, f64)> = plan
            .payouts
            .iter()
            .map(|payout| (payout.address.clone(), payout.amount))
            .collect();
        if let Some(platform) = &self.config.platform_address {
            if plan.platform_fee > 0.0 {
                transfers.push((platform.clone(), plan.platform_fee));
            }
        }
        tracing::info!(
            %id,
            payouts = transfers.len(),
            refund = plan.refund,
            "proposing settlement"
        );
        for (to, value) in transfers {
            let proposal = Proposal {
                vault: vault.clone(),
                proposer: proposer.clone(),
                to,
                value,
                data: Some(format!("settlement:{id}")),
            };
            match self.custody.propose_transaction(proposal).await {
                Ok(transaction) => self.record_custody(
                    id,
                    &proposer,
                    EventKind::CustodyProposed,
                    &transaction,
                )?,
                Err(err) => {
                    tracing::warn!(%id, "failed to propose payout: {err:#}")
                }
            }
        }
        Ok(())
    }
}
