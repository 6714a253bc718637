use std::time::Duration;

use clap::{Parser, Subcommand};
use http::HeaderMap;
use jsonrpsee::{core::client::ClientT, http_client::HttpClientBuilder};
use tracing_subscriber::layer::SubscriberExt as _;
use url::Url;
use wagerpool::{
    math::cpmm::Outcome,
    state::{Category, JudgeRole, ResolutionMode, Status},
    types::{Address, CompetitionId},
};
use wagerpool_app_rpc_api::{
    CreateCompetitionRequest, JudgeSpec, MarketSpec, RpcClient,
};

#[derive(Clone, Debug, Subcommand)]
#[command(arg_required_else_help(true))]
pub enum Command {
    /// List bets placed on a prediction market
    Bets { competition_id: CompetitionId },
    /// Cancel a competition
    Cancel {
        competition_id: CompetitionId,
        #[arg(long)]
        reason: String,
    },
    /// Confirm a pending vault transaction
    ConfirmCustody {
        competition_id: CompetitionId,
        tx_hash: String,
    },
    /// Create a competition. The caller is the creator.
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, value_enum)]
        category: Category,
        /// Unix seconds; defaults to now
        #[arg(long)]
        starts_at: Option<u64>,
        #[arg(long)]
        ends_at: u64,
        #[arg(long)]
        currency: Option<String>,
        #[arg(long)]
        platform_fee_percent: Option<f64>,
        #[arg(long)]
        max_participants: Option<u32>,
        /// Panel judge address; repeatable
        #[arg(long = "judge")]
        judges: Vec<Address>,
        #[arg(long, value_enum, default_value_t = JudgeRole::Arbiter)]
        judge_role: JudgeRole,
        #[arg(long)]
        threshold_percent: Option<u8>,
        #[arg(long, value_enum)]
        resolution_mode: Option<ResolutionMode>,
        /// Seed a market with this much liquidity
        #[arg(long)]
        liquidity: Option<f64>,
        #[arg(long, default_value_t = 0.5)]
        initial_probability: f64,
        #[arg(long)]
        draft: bool,
    },
    /// Flag a competition as disputed
    Dispute {
        competition_id: CompetitionId,
        #[arg(long)]
        reason: String,
    },
    /// Recent transparency events
    Events {
        competition_id: CompetitionId,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Execute a fully confirmed vault transaction
    ExecuteCustody {
        competition_id: CompetitionId,
        tx_hash: String,
    },
    Get { competition_id: CompetitionId },
    GetCustodyTransaction { tx_hash: String },
    /// Join a competition as the caller
    Join {
        competition_id: CompetitionId,
        #[arg(long)]
        position: String,
        #[arg(long, default_value_t = 0.0)]
        stake: f64,
    },
    List {
        #[arg(long, value_enum)]
        category: Option<Category>,
        #[arg(long)]
        creator: Option<Address>,
        #[arg(long)]
        participant: Option<Address>,
        #[arg(long, value_enum)]
        status: Option<Status>,
    },
    /// Show OpenAPI schema
    OpenapiSchema,
    /// Place a bet as the caller
    PlaceBet {
        competition_id: CompetitionId,
        #[arg(long, value_enum)]
        outcome: Outcome,
        #[arg(long)]
        amount: f64,
        /// Idempotency key; generated when omitted
        #[arg(long)]
        bet_id: Option<uuid::Uuid>,
    },
    /// Voting progress of a competition
    Progress { competition_id: CompetitionId },
    /// Propose a transfer out of a competition vault
    ProposeCustody {
        competition_id: CompetitionId,
        #[arg(long)]
        to: Address,
        #[arg(long)]
        value: f64,
    },
    /// Price a bet without placing it
    Quote {
        competition_id: CompetitionId,
        #[arg(long, value_enum)]
        outcome: Outcome,
        #[arg(long)]
        amount: f64,
    },
    /// Register a judge
    RegisterJudge {
        competition_id: CompetitionId,
        address: Address,
        #[arg(long, value_enum, default_value_t = JudgeRole::Arbiter)]
        role: JudgeRole,
        #[arg(long, default_value_t = 1)]
        weight: u32,
    },
    /// Stop the node
    Stop,
    /// Move a competition to another status
    Transition {
        competition_id: CompetitionId,
        #[arg(value_enum)]
        status: Status,
    },
    /// Balance of a competition vault
    VaultBalance { competition_id: CompetitionId },
    /// Vote as the caller
    Vote {
        competition_id: CompetitionId,
        /// `approve`, `reject` or a winning position
        choice: String,
        #[arg(long)]
        comment: Option<String>,
    },
}

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:6160";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    /// URL of the node's RPC server
    #[arg(default_value = DEFAULT_RPC_URL, long)]
    pub rpc_url: Url,
    /// Timeout for RPC requests in seconds.
    #[arg(default_value_t = DEFAULT_TIMEOUT_SECS, long)]
    timeout_secs: u64,
    #[arg(short, long, help = "Enable verbose HTTP output")]
    pub verbose: bool,
    /// Address the request is made on behalf of
    #[arg(long)]
    pub caller: Option<Address>,
}

fn caller(caller: &Option<Address>) -> anyhow::Result<Address> {
    caller
        .clone()
        .ok_or_else(|| anyhow::anyhow!("this command requires --caller"))
}

/// Handle a command, returning CLI output
async fn handle_command<RpcClient>(
    rpc_client: &RpcClient,
    caller_address: Option<Address>,
    command: Command,
) -> anyhow::Result<String>
where
    RpcClient: ClientT + Sync,
{
    Ok(match command {
        Command::Bets { competition_id } => {
            let bets = rpc_client.get_bets(competition_id).await?;
            serde_json::to_string_pretty(&bets)?
        }
        Command::Cancel {
            competition_id,
            reason,
        } => {
            let caller = caller(&caller_address)?;
            let competition = rpc_client
                .cancel_competition(competition_id, caller, reason)
                .await?;
            format!("{}", competition.status)
        }
        Command::ConfirmCustody {
            competition_id,
            tx_hash,
        } => {
            let caller = caller(&caller_address)?;
            let transaction = rpc_client
                .confirm_custody_transaction(competition_id, caller, tx_hash)
                .await?;
            serde_json::to_string_pretty(&transaction)?
        }
        Command::Create {
            title,
            description,
            category,
            starts_at,
            ends_at,
            currency,
            platform_fee_percent,
            max_participants,
            judges,
            judge_role,
            threshold_percent,
            resolution_mode,
            liquidity,
            initial_probability,
            draft,
        } => {
            let request = CreateCompetitionRequest {
                title,
                description,
                category,
                creator: caller(&caller_address)?,
                starts_at,
                ends_at,
                currency,
                platform_fee_percent,
                max_participants,
                judges: judges
                    .into_iter()
                    .map(|address| JudgeSpec {
                        address,
                        role: judge_role,
                        weight: 1,
                    })
                    .collect(),
                threshold_percent,
                resolution_mode,
                market: liquidity.map(|initial_liquidity| MarketSpec {
                    initial_liquidity,
                    initial_probability,
                }),
                draft,
            };
            let competition = rpc_client.create_competition(request).await?;
            format!("{}", competition.id)
        }
        Command::Dispute {
            competition_id,
            reason,
        } => {
            let caller = caller(&caller_address)?;
            let competition = rpc_client
                .dispute_competition(competition_id, caller, reason)
                .await?;
            format!("{}", competition.status)
        }
        Command::Events {
            competition_id,
            limit,
        } => {
            let events =
                rpc_client.recent_events(competition_id, limit).await?;
            serde_json::to_string_pretty(&events)?
        }
        Command::ExecuteCustody {
            competition_id,
            tx_hash,
        } => {
            let caller = caller(&caller_address)?;
            let transaction = rpc_client
                .execute_custody_transaction(competition_id, caller, tx_hash)
                .await?;
            serde_json::to_string_pretty(&transaction)?
        }
        Command::Get { competition_id } => {
            let competition =
                rpc_client.get_competition(competition_id).await?;
            serde_json::to_string_pretty(&competition)?
        }
        Command::GetCustodyTransaction { tx_hash } => {
            let transaction =
                rpc_client.get_custody_transaction(tx_hash).await?;
            serde_json::to_string_pretty(&transaction)?
        }
        Command::Join {
            competition_id,
            position,
            stake,
        } => {
            let caller = caller(&caller_address)?;
            let joined = rpc_client
                .join_competition(competition_id, caller, position, stake)
                .await?;
            serde_json::to_string_pretty(&joined)?
        }
        Command::List {
            category,
            creator,
            participant,
            status,
        } => {
            let competitions = rpc_client
                .list_competitions(category, creator, participant, status)
                .await?;
            let mut output = String::new();
            for competition in competitions {
                output.push_str(&format!(
                    "{}  {:<12} {:<10} {}\n",
                    competition.id,
                    competition.category,
                    competition.status,
                    competition.title
                ));
            }
            output
        }
        Command::OpenapiSchema => {
            let openapi = rpc_client.openapi_schema().await?;
            openapi.to_pretty_json()?
        }
        Command::PlaceBet {
            competition_id,
            outcome,
            amount,
            bet_id,
        } => {
            let caller = caller(&caller_address)?;
            let bet_id = bet_id.unwrap_or_else(uuid::Uuid::new_v4);
            let placed = rpc_client
                .place_bet(
                    competition_id,
                    caller,
                    outcome.to_string(),
                    amount,
                    Some(bet_id),
                )
                .await?;
            serde_json::to_string_pretty(&placed)?
        }
        Command::Progress { competition_id } => {
            let progress = rpc_client.voting_progress(competition_id).await?;
            serde_json::to_string_pretty(&progress)?
        }
        Command::ProposeCustody {
            competition_id,
            to,
            value,
        } => {
            let caller = caller(&caller_address)?;
            let transaction = rpc_client
                .propose_custody_transaction(competition_id, caller, to, value)
                .await?;
            format!("{}", transaction.hash)
        }
        Command::Quote {
            competition_id,
            outcome,
            amount,
        } => {
            let quote = rpc_client
                .quote_bet(competition_id, outcome.to_string(), amount)
                .await?;
            serde_json::to_string_pretty(&quote)?
        }
        Command::RegisterJudge {
            competition_id,
            address,
            role,
            weight,
        } => {
            let caller = caller(&caller_address)?;
            let judge = JudgeSpec {
                address,
                role,
                weight,
            };
            let competition = rpc_client
                .register_judge(competition_id, caller, judge)
                .await?;
            format!("{} judges", competition.arbitration.judges.len())
        }
        Command::Stop => {
            let () = rpc_client.stop().await?;
            String::default()
        }
        Command::Transition {
            competition_id,
            status,
        } => {
            let caller = caller(&caller_address)?;
            let competition = rpc_client
                .transition_competition(competition_id, caller, status)
                .await?;
            format!("{}", competition.status)
        }
        Command::VaultBalance { competition_id } => {
            let balance = rpc_client.vault_balance(competition_id).await?;
            serde_json::to_string_pretty(&balance)?
        }
        Command::Vote {
            competition_id,
            choice,
            comment,
        } => {
            let caller = caller(&caller_address)?;
            let voted = rpc_client
                .submit_vote(competition_id, caller, choice, comment)
                .await?;
            serde_json::to_string_pretty(&voted)?
        }
    })
}

fn set_tracing_subscriber() -> anyhow::Result<()> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stdout()))
        .with_file(true)
        .with_line_number(true);

    let subscriber = tracing_subscriber::registry().with(stdout_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<String> {
        if self.verbose {
            set_tracing_subscriber()?;
        }
        let request_id = uuid::Uuid::new_v4().as_simple().to_string();
        tracing::info!(%request_id);
        let builder = HttpClientBuilder::default()
            .request_timeout(Duration::from_secs(self.timeout_secs))
            .set_max_logging_length(1024)
            .set_headers(HeaderMap::from_iter([(
                http::header::HeaderName::from_static("x-request-id"),
                http::header::HeaderValue::from_str(&request_id)?,
            )]));
        let client = builder.build(self.rpc_url.as_str())?;
        let result =
            handle_command(&client, self.caller, self.command).await?;
        Ok(result)
    }
}
