use std::net::SocketAddr;

use futures::StreamExt as _;
use jsonrpsee::{
    PendingSubscriptionSink, SubscriptionMessage,
    core::{RpcResult, SubscriptionResult, async_trait},
    server::{RpcServiceBuilder, Server},
    types::ErrorObject,
};
use tower_http::{
    request_id::{
        MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
    },
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use wagerpool::{
    custody::{Balance, CustodyTransaction},
    math::{arbitration::VotingProgress, cpmm::TradeQuote},
    node::{self, Node},
    state::{
        Bet, BetRequest, Category, Competition, CompetitionBuilder,
        CompetitionFilter, JoinRequest, Judge, Status, TransparencyEvent,
    },
    types::{self, Address, CompetitionId},
    validation::BetValidator,
};
use wagerpool_app_rpc_api::{
    BetResponse, CreateCompetitionRequest, EventsRpcServer, JoinResponse,
    JudgeSpec, RpcServer, VoteResponse,
};

use crate::app::App;

const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 1000;

/// JSON-RPC error number for a stable error code
fn error_number(code: &str) -> i32 {
    match code {
        "INVALID_ADDRESS" | "INVALID_AMOUNT" | "INVALID_OUTCOME"
        | "INVALID_COMPETITION" => -32602,
        "NOT_FOUND" => -32001,
        "UNAUTHORIZED" | "NOT_JUDGE" => -32003,
        "CUSTODY_ERROR" | "NO_VAULT" => -32010,
        "SCRIPT_ERROR" | "INTERNAL_ERROR" => -32603,
        _ => -32000,
    }
}

fn node_err(err: node::Error) -> ErrorObject<'static> {
    let code = err.code();
    let message = format!("{:#}", anyhow::Error::from(err));
    ErrorObject::owned(error_number(code), message, Some(code))
}

fn validation_err(err: wagerpool::validation::Error) -> ErrorObject<'static> {
    node_err(err.into())
}

pub struct RpcServerImpl {
    app: App,
}

impl RpcServerImpl {
    #[inline(always)]
    fn node(&self) -> &Node {
        &self.app.node
    }
}

#[async_trait]
impl RpcServer for RpcServerImpl {
    async fn cancel_competition(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        reason: String,
    ) -> RpcResult<Competition> {
        self.node()
            .cancel(competition_id, caller, reason)
            .map_err(node_err)
    }

    async fn confirm_custody_transaction(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        tx_hash: String,
    ) -> RpcResult<CustodyTransaction> {
        self.node()
            .confirm_custody_transaction(competition_id, caller, tx_hash)
            .await
            .map_err(node_err)
    }

    async fn create_competition(
        &self,
        request: CreateCompetitionRequest,
    ) -> RpcResult<Competition> {
        let starts_at = request.starts_at.unwrap_or_else(types::now);
        let mut builder = CompetitionBuilder::new(
            request.title,
            request.creator,
            request.category,
        )
        .with_description(request.description)
        .with_timeline(starts_at, request.ends_at);
        if let Some(currency) = request.currency {
            builder = builder.with_currency(currency);
        }
        if let Some(percent) = request.platform_fee_percent {
            builder = builder.with_platform_fee(percent);
        }
        if let Some(max) = request.max_participants {
            builder = builder.with_max_participants(max);
        }
        for JudgeSpec {
            address,
            role,
            weight,
        } in request.judges
        {
            builder = builder.with_judge(address, role, weight);
        }
        if let Some(percent) = request.threshold_percent {
            builder = builder.with_threshold(percent);
        }
        if let Some(mode) = request.resolution_mode {
            builder = builder.with_resolution_mode(mode);
        }
        if let Some(market) = request.market {
            builder = builder
                .with_market(market.initial_liquidity, market.initial_probability);
        }
        if request.draft {
            builder = builder.as_draft();
        }
        self.node()
            .create_competition(builder)
            .await
            .map_err(node_err)
    }

    async fn dispute_competition(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        reason: String,
    ) -> RpcResult<Competition> {
        self.node()
            .dispute(competition_id, caller, reason)
            .map_err(node_err)
    }

    async fn execute_custody_transaction(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        tx_hash: String,
    ) -> RpcResult<CustodyTransaction> {
        self.node()
            .execute_custody_transaction(competition_id, caller, tx_hash)
            .await
            .map_err(node_err)
    }

    async fn get_bets(
        &self,
        competition_id: CompetitionId,
    ) -> RpcResult<Vec<Bet>> {
        self.node().get_bets(competition_id).map_err(node_err)
    }

    async fn get_competition(
        &self,
        competition_id: CompetitionId,
    ) -> RpcResult<Competition> {
        self.node().get_competition(competition_id).map_err(node_err)
    }

    async fn get_custody_transaction(
        &self,
        tx_hash: String,
    ) -> RpcResult<CustodyTransaction> {
        self.node()
            .get_custody_transaction(tx_hash)
            .await
            .map_err(node_err)
    }

    async fn join_competition(
        &self,
        competition_id: CompetitionId,
        participant: Address,
        position: String,
        stake: f64,
    ) -> RpcResult<JoinResponse> {
        let request = JoinRequest {
            participant,
            position,
            stake,
        };
        let applied = self
            .node()
            .join(competition_id, request)
            .map_err(node_err)?;
        let event_seq = applied
            .events
            .last()
            .map_or(applied.competition.event_seq, |event| event.seq);
        Ok(JoinResponse {
            success: true,
            total_participants: applied.value.total_participants,
            judge_added: applied.value.judge_added,
            event_seq,
        })
    }

    async fn list_competitions(
        &self,
        category: Option<Category>,
        creator: Option<Address>,
        participant: Option<Address>,
        status: Option<Status>,
    ) -> RpcResult<Vec<Competition>> {
        let filter = CompetitionFilter {
            category,
            creator,
            participant,
            status,
        };
        self.node().list_competitions(&filter).map_err(node_err)
    }

    async fn openapi_schema(&self) -> RpcResult<utoipa::openapi::OpenApi> {
        let res =
            <wagerpool_app_rpc_api::RpcDoc as utoipa::OpenApi>::openapi();
        Ok(res)
    }

    async fn place_bet(
        &self,
        competition_id: CompetitionId,
        bettor: Address,
        outcome: String,
        amount: f64,
        bet_id: Option<uuid::Uuid>,
    ) -> RpcResult<BetResponse> {
        let outcome =
            BetValidator::validate_bet(&outcome, amount).map_err(validation_err)?;
        let request = BetRequest {
            bettor,
            outcome,
            amount,
            bet_id,
        };
        let applied = self
            .node()
            .place_bet(competition_id, request)
            .map_err(node_err)?;
        Ok(BetResponse {
            bet: applied.value.bet,
            new_probability: applied.value.new_probability,
        })
    }

    async fn propose_custody_transaction(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        to: Address,
        value: f64,
    ) -> RpcResult<CustodyTransaction> {
        self.node()
            .propose_custody_transaction(competition_id, caller, to, value)
            .await
            .map_err(node_err)
    }

    async fn quote_bet(
        &self,
        competition_id: CompetitionId,
        outcome: String,
        amount: f64,
    ) -> RpcResult<TradeQuote> {
        let outcome =
            BetValidator::validate_bet(&outcome, amount).map_err(validation_err)?;
        self.node()
            .quote_bet(competition_id, outcome, amount)
            .map_err(node_err)
    }

    async fn recent_events(
        &self,
        competition_id: CompetitionId,
        limit: Option<usize>,
    ) -> RpcResult<Vec<TransparencyEvent>> {
        let limit = limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
        self.node()
            .recent_events(competition_id, limit)
            .map_err(node_err)
    }

    async fn register_judge(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        judge: JudgeSpec,
    ) -> RpcResult<Competition> {
        let judge = Judge {
            address: judge.address,
            role: judge.role,
            weight: judge.weight,
            added_at: types::now(),
        };
        self.node()
            .register_judge(competition_id, caller, judge)
            .map_err(node_err)
    }

    async fn stop(&self) {
        tracing::info!("stop requested");
        self.app.shutdown.cancel();
    }

    async fn submit_vote(
        &self,
        competition_id: CompetitionId,
        judge: Address,
        choice: String,
        comment: Option<String>,
    ) -> RpcResult<VoteResponse> {
        let applied = self
            .node()
            .vote(competition_id, judge, choice, comment)
            .map_err(node_err)?;
        Ok(VoteResponse {
            progress: applied.value.progress,
            resolution_reached: applied.value.resolution_reached,
            verdict: applied.value.verdict,
        })
    }

    async fn transition_competition(
        &self,
        competition_id: CompetitionId,
        caller: Address,
        status: Status,
    ) -> RpcResult<Competition> {
        self.node()
            .transition(competition_id, caller, status)
            .map_err(node_err)
    }

    async fn vault_balance(
        &self,
        competition_id: CompetitionId,
    ) -> RpcResult<Balance> {
        self.node()
            .vault_balance(competition_id)
            .await
            .map_err(node_err)
    }

    async fn voting_progress(
        &self,
        competition_id: CompetitionId,
    ) -> RpcResult<VotingProgress> {
        self.node()
            .voting_progress(competition_id)
            .map_err(node_err)
    }
}

#[async_trait]
impl EventsRpcServer for RpcServerImpl {
    async fn subscribe_events(
        &self,
        pending: PendingSubscriptionSink,
        competition_id: CompetitionId,
        catch_up: Option<usize>,
    ) -> SubscriptionResult {
        // subscribe before reading the backlog so nothing falls in between
        let mut live = Box::pin(self.node().subscribe_events(competition_id));
        let backlog = match catch_up.map(|n| n.min(MAX_EVENT_LIMIT)) {
            None | Some(0) => self
                .node()
                .get_competition(competition_id)
                .map(|_| Vec::new()),
            Some(limit) => self.node().recent_events(competition_id, limit),
        };
        let backlog = match backlog {
            Ok(backlog) => backlog,
            Err(err) => {
                pending.reject(node_err(err)).await;
                return Ok(());
            }
        };
        let sink = pending.accept().await?;
        let mut last_seq = None;
        for event in backlog {
            last_seq = Some(event.seq);
            sink.send(SubscriptionMessage::from_json(&event)?).await?;
        }
        loop {
            tokio::select! {
                () = sink.closed() => break,
                event = live.next() => {
                    let Some(event) = event else { break };
                    if last_seq.is_some_and(|last| event.seq <= last) {
                        continue;
                    }
                    sink.send(SubscriptionMessage::from_json(&event)?).await?;
                }
            }
        }
        tracing::debug!(%competition_id, "event subscription closed");
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct RequestIdMaker;

impl MakeRequestId for RequestIdMaker {
    fn make_request_id<B>(
        &mut self,
        _: &http::Request<B>,
    ) -> Option<RequestId> {
        use uuid::Uuid;
        let id = Uuid::new_v4();
        let id = id.as_simple();
        let id = format!("req_{id}");

        let Ok(header_value) = http::HeaderValue::from_str(&id) else {
            return None;
        };

        Some(RequestId::new(header_value))
    }
}

pub async fn run_server(
    app: App,
    rpc_addr: SocketAddr,
) -> anyhow::Result<SocketAddr> {
    const REQUEST_ID_HEADER: &str = "x-request-id";

    let tracer = tower::ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            http::HeaderName::from_static(REQUEST_ID_HEADER),
            RequestIdMaker,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get(http::HeaderName::from_static(REQUEST_ID_HEADER))
                        .and_then(|h| h.to_str().ok())
                        .filter(|s| !s.is_empty());

                    tracing::span!(
                        tracing::Level::DEBUG,
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id,
                    )
                })
                .on_request(())
                .on_eos(())
                .on_response(
                    DefaultOnResponse::new().level(tracing::Level::INFO),
                )
                .on_failure(
                    DefaultOnFailure::new().level(tracing::Level::ERROR),
                ),
        )
        .layer(PropagateRequestIdLayer::new(http::HeaderName::from_static(
            REQUEST_ID_HEADER,
        )))
        .into_inner();

    let http_middleware = tower::ServiceBuilder::new().layer(tracer);
    let rpc_middleware = RpcServiceBuilder::new().rpc_logger(1024);

    let server = Server::builder()
        .set_http_middleware(http_middleware)
        .set_rpc_middleware(rpc_middleware)
        .build(rpc_addr)
        .await?;

    let addr = server.local_addr()?;
    let shutdown = app.shutdown.clone();
    let mut module = RpcServer::into_rpc(RpcServerImpl { app: app.clone() });
    module.merge(EventsRpcServer::into_rpc(RpcServerImpl { app }))?;
    let handle = server.start(module);

    tokio::spawn(async move {
        shutdown.cancelled().await;
        if let Err(err) = handle.stop() {
            tracing::warn!("RPC server already stopped: {err}");
        }
        handle.stopped().await;
    });

    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::error_number;

    #[test]
    fn error_numbers_group_codes() {
        assert_eq!(error_number("INVALID_OUTCOME"), -32602);
        assert_eq!(error_number("ALREADY_JOINED"), -32000);
        assert_eq!(error_number("FULL"), -32000);
        assert_eq!(error_number("NOT_FOUND"), -32001);
        assert_eq!(error_number("SCRIPT_ERROR"), -32603);
    }
}
