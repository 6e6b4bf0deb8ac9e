//! Operator CLI: bootstrap a currency or watch its trade stream.
//!
//!   hourbridge create <CODE> <N/D>
//!   hourbridge watch <currency.toml>
//!
//! Environment: HORIZON_URL, DOMAIN, SPONSOR_SECRET (hex seed).

use std::sync::Arc;

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing_subscriber::{EnvFilter, fmt};

use hourbridge::core::{CurrencyConfig, CurrencyData, CurrencyState, Rate};
use hourbridge::events::EventKind;
use hourbridge::gateway::{GatewayOptions, HttpGateway};
use hourbridge::{KeyPair, Ledger, LedgerOptions};

#[derive(Debug, Deserialize)]
struct CurrencyFile {
    code: String,
    rate_n: u32,
    rate_d: u32,
    data: CurrencyData,
    cursor: Option<String>,
}

fn ledger_from_env() -> anyhow::Result<(Arc<Ledger>, KeyPair)> {
    let horizon_url = std::env::var("HORIZON_URL").context("HORIZON_URL must be set")?;
    let domain = std::env::var("DOMAIN").unwrap_or_else(|_| "localhost".to_string());
    let sponsor_secret =
        std::env::var("SPONSOR_SECRET").context("SPONSOR_SECRET must be set")?;
    let sponsor = KeyPair::from_secret_hex(&sponsor_secret)?;

    let gateway = Arc::new(HttpGateway::new(GatewayOptions {
        base_url: horizon_url,
    })?);
    let ledger = Ledger::new(
        gateway,
        LedgerOptions {
            sponsor_public_key: sponsor.public_key(),
            domain,
        },
    );
    Ok((ledger, sponsor))
}

async fn create(code: &str, rate: &str) -> anyhow::Result<()> {
    let (n, d) = rate
        .split_once('/')
        .context("rate must be given as N/D, e.g. 1/10")?;
    let rate = Rate::new(n.trim().parse()?, d.trim().parse()?)?;
    let config = CurrencyConfig::new(code, rate)?;

    let (ledger, sponsor) = ledger_from_env()?;
    let keys = ledger.create_currency(config, &sponsor).await?;

    // The secrets below are shown exactly once; persist them safely.
    println!("currency {code} created");
    for (role, key) in [
        ("issuer", &keys.issuer),
        ("credit", &keys.credit),
        ("admin", &keys.admin),
        ("external_issuer", &keys.external_issuer),
        ("external_trader", &keys.external_trader),
    ] {
        println!("{role}: public={} secret={}", key.public_key(), key.secret_hex());
    }
    Ok(())
}

async fn watch(path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {path}"))?;
    let file: CurrencyFile = toml::from_str(&content)?;
    let config = CurrencyConfig::new(file.code, Rate::new(file.rate_n, file.rate_d)?)?;

    let (ledger, _) = ledger_from_env()?;
    let currency = ledger.get_currency(
        config,
        file.data,
        file.cursor.map(|cursor| CurrencyState {
            external_trades_stream_cursor: cursor,
        }),
    )?;

    for kind in [
        EventKind::IncomingTransfer,
        EventKind::OutgoingTransfer,
        EventKind::IncomingHourTrade,
        EventKind::StateUpdated,
        EventKind::Error,
    ] {
        ledger.on(kind, |event| async move {
            println!("{event:?}");
            Ok(())
        });
    }
    currency.start();
    tracing::info!("watching external trades, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    ledger.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hourbridge=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("create") if args.len() == 4 => create(&args[2], &args[3]).await,
        Some("watch") if args.len() == 3 => watch(&args[2]).await,
        _ => bail!("usage: hourbridge create <CODE> <N/D> | hourbridge watch <currency.toml>"),
    }
}
