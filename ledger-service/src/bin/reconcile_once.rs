use std::env;

use anyhow::{Context, Result};
use ledger_service::{
    app::{Services, Stores},
    config::AppConfig,
    observability,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio_util::sync::CancellationToken;

fn parse_ts(s: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(s, &Rfc3339)
}

/// Runs one reconciliation pass and prints the report as JSON.
///
/// usage: reconcile_once [from_rfc3339 [to_rfc3339]]
/// Without arguments the configured lookback window ending now is audited.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let stores = Stores::open(&cfg.store).await?;
    let services = Services::build(stores, &cfg)?;

    let args: Vec<String> = env::args().skip(1).collect();
    let to = match args.get(1) {
        Some(s) => parse_ts(s).with_context(|| format!("invalid 'to' timestamp '{s}'"))?,
        None => OffsetDateTime::now_utc(),
    };
    let from = match args.first() {
        Some(s) => parse_ts(s).with_context(|| format!("invalid 'from' timestamp '{s}'"))?,
        None => to - services.reconciler.settings().lookback,
    };
    if to <= from {
        anyhow::bail!("'to' must be after 'from'");
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let report = services.reconciler.run(from, to, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
