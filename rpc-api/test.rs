use utoipa::OpenApi as _;

use crate::{CreateCompetitionRequest, RpcDoc};

#[test]
fn openapi_lists_rpc_schemas() -> anyhow::Result<()> {
    let doc = RpcDoc::openapi();
    let components = doc
        .components
        .ok_or_else(|| anyhow::anyhow!("missing components"))?;
    for name in ["Competition", "TransparencyEvent", "TradeQuote", "Verdict"] {
        anyhow::ensure!(
            components.schemas.contains_key(name),
            "missing schema `{name}`"
        );
    }
    Ok(())
}

#[test]
fn create_request_defaults() -> anyhow::Result<()> {
    let request: CreateCompetitionRequest = serde_json::from_value(
        serde_json::json!({
            "title": "Office chess ladder",
            "category": "wager",
            "creator": "0x8ba1f109551bd432803012645ac136ddd64dba72",
            "ends_at": 1_900_000_000u64,
            "judges": [{
                "address": "0x00000000000000000000000000000000000000aa",
                "role": "arbiter"
            }],
            "market": { "initial_liquidity": 100.0 }
        }),
    )?;
    anyhow::ensure!(request.starts_at.is_none());
    anyhow::ensure!(!request.draft);
    anyhow::ensure!(request.judges[0].weight == 1);
    let market = request
        .market
        .ok_or_else(|| anyhow::anyhow!("missing market"))?;
    anyhow::ensure!(market.initial_probability == 0.5);
    Ok(())
}
