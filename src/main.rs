use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bybit_signal_trader::bybit::BybitClient;
use bybit_signal_trader::strategy::config::{EngineConfig, ExecutionMode, ServiceConfig};
use bybit_signal_trader::strategy::entry::EntryExecutor;
use bybit_signal_trader::strategy::execution_backend::ExchangeBackend;
use bybit_signal_trader::strategy::paper_trading_backend::PaperExchange;
use bybit_signal_trader::strategy::policy::SymbolPolicyTable;
use bybit_signal_trader::strategy::symbol_meta::{SymbolMetaHandle, SymbolMetaTable};
use bybit_signal_trader::webhook::{self, WebhookState};
use bybit_signal_trader::DynError;

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("failed to create env filter");

    let fmt_layer = fmt::layer().with_ansi(false).with_target(false).compact();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

/// Install a fresh metadata snapshot. On failure the previous one stays in place.
async fn refresh_metadata(backend: &dyn ExchangeBackend, meta: &SymbolMetaHandle) {
    match backend.get_instrument_meta().await {
        Ok(symbols) if !symbols.is_empty() => {
            let count = symbols.len();
            meta.install(SymbolMetaTable::new(symbols));
            info!(symbols = count, "[META] Snapshot installed");
        }
        Ok(_) => warn!("[META] Exchange returned no instruments, keeping previous snapshot"),
        Err(e) => warn!(error = %e, "[META] Refresh failed, keeping previous snapshot"),
    }
}

async fn metadata_refresh_loop(backend: Arc<dyn ExchangeBackend>, meta: SymbolMetaHandle, every: Duration) {
    let mut tick = tokio::time::interval(every);
    // First tick completes immediately; start-up already loaded a snapshot.
    tick.tick().await;
    loop {
        tick.tick().await;
        refresh_metadata(backend.as_ref(), &meta).await;
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), DynError> {
    dotenv::dotenv().ok();
    init_tracing();

    let service = ServiceConfig::from_env()?;
    let engine = EngineConfig::from_env()?;

    let mut policies = SymbolPolicyTable::builtin(engine.default_tp_rate, engine.default_sl_rate);
    if let Some(path) = &service.policy_file {
        policies = policies.with_overrides_from_file(path)?;
        info!(path = %path.display(), policies = policies.len(), "Symbol policy overrides loaded");
    }

    let bybit = Arc::new(BybitClient::from_config(&service));
    if let Err(e) = bybit.sync_server_time().await {
        warn!(error = %e, "Server time sync failed, using local clock");
    }

    let backend: Arc<dyn ExchangeBackend> = match service.execution_mode {
        ExecutionMode::Live => bybit,
        ExecutionMode::Paper => Arc::new(PaperExchange::new(service.paper_balance).with_market_data(bybit)),
    };

    let meta = SymbolMetaHandle::default();
    refresh_metadata(backend.as_ref(), &meta).await;
    let refresh_task = tokio::spawn(metadata_refresh_loop(Arc::clone(&backend), meta.clone(), service.meta_refresh));

    let executor = Arc::new(EntryExecutor::new(backend, engine, policies, meta));
    let engine = executor.config();
    info!(
        mode = ?service.execution_mode,
        backend = executor.backend_name(),
        leverage = engine.leverage,
        risk_ratio = engine.risk_ratio,
        margin_mode = engine.margin_mode.as_str(),
        "Engine configured"
    );
    let app = webhook::router(WebhookState {
        executor: Arc::clone(&executor),
        passphrase: service.webhook_passphrase.as_deref().map(Arc::from),
    });

    let listener = tokio::net::TcpListener::bind(&service.bind_addr).await?;
    info!(addr = %service.bind_addr, "Webhook listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    executor.shutdown();
    refresh_task.abort();
    info!("Shutdown complete");
    Ok(())
}
