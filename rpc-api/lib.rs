//! RPC API

use jsonrpsee::{
    core::{RpcResult, SubscriptionResult},
    proc_macros::rpc,
};
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};
use wagerpool::{
    custody::{Balance, CustodyTransaction},
    math::{
        arbitration::VotingProgress,
        cpmm::{Outcome, Pool, TradeQuote},
    },
    state::{
        Bet, Category, Competition, EventKind, Judge, JudgeRole,
        ParticipantEntry, ResolutionMode, Status, TransparencyEvent,
        Verdict, Vote,
        competition::{Arbitration, Market, PrizePool},
    },
    types::{Address, CompetitionId},
};

#[cfg(test)]
mod test;

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct JudgeSpec {
    pub address: Address,
    pub role: JudgeRole,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct MarketSpec {
    pub initial_liquidity: f64,
    /// Initial probability of YES
    #[serde(default = "default_probability")]
    pub initial_probability: f64,
}

fn default_probability() -> f64 {
    0.5
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct CreateCompetitionRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: Category,
    pub creator: Address,
    /// Unix seconds; defaults to now
    #[serde(default)]
    pub starts_at: Option<u64>,
    pub ends_at: u64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub platform_fee_percent: Option<f64>,
    #[serde(default)]
    pub max_participants: Option<u32>,
    #[serde(default)]
    pub judges: Vec<JudgeSpec>,
    #[serde(default)]
    pub threshold_percent: Option<u8>,
    #[serde(default)]
    pub resolution_mode: Option<ResolutionMode>,
    #[serde(default)]
    pub market: Option<MarketSpec>,
    /// Create in `draft` instead of `pending`
    #[serde(default)]
    pub draft: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct JoinResponse {
    pub success: bool,
    pub total_participants: u32,
    pub judge_added: bool,
    pub event_seq: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct BetResponse {
    pub bet: Bet,
    pub new_probability: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct VoteResponse {
    pub progress: VotingProgress,
    pub resolution_reached: bool,
    pub verdict: Option<Verdict>,
}

#[derive(OpenApi)]
#[openapi(components(schemas(
    Address,
    Arbitration,
    Balance,
    Bet,
    BetResponse,
    Category,
    Competition,
    CompetitionId,
    CreateCompetitionRequest,
    CustodyTransaction,
    EventKind,
    JoinResponse,
    Judge,
    JudgeRole,
    JudgeSpec,
    Market,
    MarketSpec,
    Outcome,
    ParticipantEntry,
    Pool,
    PrizePool,
    ResolutionMode,
    Status,
    TradeQuote,
    TransparencyEvent,
    Verdict,
    Vote,
    VoteResponse,
    VotingProgress,
)))]
pub struct RpcDoc;

#[rpc(client, server)]
pub trait Rpc {
    /// Cancel a competition. Creator only.
    #[method(name = "cancel_competition")]
    async fn cancel_competition(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        reason: String,
    ) -> RpcResult<Competition>;

    /// Add a signature to a pending vault transaction
    #[method(name = "confirm_custody_transaction")]
    async fn confirm_custody_transaction(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        tx_hash: String,
    ) -> RpcResult<CustodyTransaction>;

    #[method(name = "create_competition")]
    async fn create_competition(
        &self,
        request: CreateCompetitionRequest,
    ) -> RpcResult<Competition>;

    /// Flag a resolving competition as disputed. Participant or judge only.
    #[method(name = "dispute_competition")]
    async fn dispute_competition(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        reason: String,
    ) -> RpcResult<Competition>;

    #[method(name = "execute_custody_transaction")]
    async fn execute_custody_transaction(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        tx_hash: String,
    ) -> RpcResult<CustodyTransaction>;

    /// Bets of a prediction market, oldest first
    #[method(name = "get_bets")]
    async fn get_bets(
        &self,
        competition_id: CompetitionId,
    ) -> RpcResult<Vec<Bet>>;

    #[method(name = "get_competition")]
    async fn get_competition(
        &self,
        competition_id: CompetitionId,
    ) -> RpcResult<Competition>;

    #[method(name = "get_custody_transaction")]
    async fn get_custody_transaction(
        &self,
        tx_hash: String,
    ) -> RpcResult<CustodyTransaction>;

    #[method(name = "join_competition")]
    async fn join_competition(
        &self,
        competition_id: CompetitionId,
        participant: Address,
        position: String,
        stake: f64,
    ) -> RpcResult<JoinResponse>;

    /// Newest first
    #[method(name = "list_competitions")]
    async fn list_competitions(
        &self,
        category: Option<Category>,
        creator: Option<Address>,
        participant: Option<Address>,
        status: Option<Status>,
    ) -> RpcResult<Vec<Competition>>;

    #[method(name = "openapi_schema")]
    async fn openapi_schema(&self) -> RpcResult<utoipa::openapi::OpenApi>;

    /// Place a bet. `bet_id` makes retries idempotent.
    #[method(name = "place_bet")]
    async fn place_bet(
        &self,
        competition_id: CompetitionId,
        bettor: Address,
        outcome: String,
        amount: f64,
        bet_id: Option<uuid::Uuid>,
    ) -> RpcResult<BetResponse>;

    /// Propose a transfer out of the competition vault
    #[method(name = "propose_custody_transaction")]
    async fn propose_custody_transaction(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        to: Address,
        value: f64,
    ) -> RpcResult<CustodyTransaction>;

    /// Price a bet without placing it
    #[method(name = "quote_bet")]
    async fn quote_bet(
        &self,
        competition_id: CompetitionId,
        outcome: String,
        amount: f64,
    ) -> RpcResult<TradeQuote>;

    /// Last `limit` transparency events, oldest first
    #[method(name = "recent_events")]
    async fn recent_events(
        &self,
        competition_id: CompetitionId,
        limit: Option<usize>,
    ) -> RpcResult<Vec<TransparencyEvent>>;

    #[method(name = "register_judge")]
    async fn register_judge(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        judge: JudgeSpec,
    ) -> RpcResult<Competition>;

    #[method(name = "stop")]
    async fn stop(&self);

    #[method(name = "submit_vote")]
    async fn submit_vote(
        &self,
        competition_id: CompetitionId,
        judge: Address,
        choice: String,
        comment: Option<String>,
    ) -> RpcResult<VoteResponse>;

    /// Manual status transition. Creator only; terminal statuses are
    /// reached through voting, disputes and cancellation.
    #[method(name = "transition_competition")]
    async fn transition_competition(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        status: Status,
    ) -> RpcResult<Competition>;

    #[method(name = "vault_balance")]
    async fn vault_balance(
        &self,
        competition_id: CompetitionId,
    ) -> RpcResult<Balance>;

    #[method(name = "voting_progress")]
    async fn voting_progress(
        &self,
        competition_id: CompetitionId,
    ) -> RpcResult<VotingProgress>;
}

/// Subscriptions; served over WebSocket on the same port
#[rpc(client, server)]
pub trait EventsRpc {
    /// Live transparency events, after replaying the last `catch_up`
    #[subscription(
        name = "subscribe_events",
        unsubscribe = "unsubscribe_events",
        item = TransparencyEvent
    )]
    async fn subscribe_events(
        &self,
        competition_id: CompetitionId,
        catch_up: Option<usize>,
    ) -> SubscriptionResult;
}
