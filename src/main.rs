use attack_simulation::alerts::AlertRouter;
use attack_simulation::context::ScanContext;
use attack_simulation::pipeline::{run_alert_feed, run_worker};
use attack_simulation::report::Finding;
use attack_simulation::scanner::{run_block_loop, BlockLoopConfig, ContractIntake};
use attack_simulation::scheduler::{ScanScheduler, SchedulerConfig};
use attack_simulation::storage::queue_db::{InMemoryQueueStore, QueueStore, SqliteQueueStore};
use attack_simulation::utils::config::Config;
use attack_simulation::utils::env_guard::load_dot_env;
use attack_simulation::utils::rpc::{connect_http, RobustRpc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const STARTUP_RPC_RETRIES: usize = 5;

fn compact_error(err: impl std::fmt::Display) -> String {
    attack_simulation::utils::error::compact_error_message(&err.to_string(), 320)
}

fn emit_finding(finding: &Finding) {
    match serde_json::to_string(finding) {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::error!("[SCAN] Failed to serialize finding: {}", err),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dot_env();

    // Logs go to stderr; stdout carries one JSON finding per line.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    let provider = connect_http(&config.eth_rpc_url)?;
    let chain_id = match config.chain_id {
        Some(chain_id) => chain_id,
        None => RobustRpc::get_chain_id_with_retry(&provider, STARTUP_RPC_RETRIES).await?,
    };
    tracing::info!(
        "[STARTUP] Config loaded: ChainID={}, TargetMode={}, Debug={}, WaitingSecs={}",
        chain_id,
        config.target_mode,
        config.debug,
        config.contract_waiting_secs
    );

    let store: Arc<dyn QueueStore> = match &config.queue_db_path {
        Some(path) => {
            let store = SqliteQueueStore::open(path)?;
            tracing::info!("[STARTUP] SQLite queue at {}", store.path().display());
            Arc::new(store)
        }
        None => {
            tracing::warn!("[STARTUP] QUEUE_DB_PATH unset; queue will not survive restarts");
            Arc::new(InMemoryQueueStore::default())
        }
    };
    let scheduler = ScanScheduler::new(
        store,
        SchedulerConfig {
            default_priority: config.default_priority,
            waiting_secs: config.contract_waiting_secs,
            target_mode: config.target_mode,
        },
    );
    scheduler.restore().await?;

    let ctx = Arc::new(ScanContext::new(&config, provider.clone(), chain_id)?);

    let (findings_tx, mut findings_rx) = mpsc::unbounded_channel::<Finding>();
    let printer = tokio::spawn(async move {
        while let Some(finding) = findings_rx.recv().await {
            emit_finding(&finding);
        }
    });
    let worker = tokio::spawn(run_worker(ctx.clone(), scheduler.clone(), findings_tx));

    if config.alerts_from_stdin {
        let router = AlertRouter::from_bot_config(&config.bot);
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        tokio::spawn(run_alert_feed(reader, router, scheduler.clone()));
        tracing::info!("[STARTUP] Reading alert events from stdin");
    }

    let start_block = RobustRpc::get_block_number_with_retry(&provider, STARTUP_RPC_RETRIES).await?;
    tracing::info!("[STARTUP] Following chain from block {}", start_block);
    let mut block_loop = tokio::spawn(run_block_loop(
        ContractIntake::new(provider),
        scheduler.clone(),
        start_block,
        BlockLoopConfig {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            debug: config.debug,
        },
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[SHUTDOWN] Ctrl-C received; pending contracts stay queued");
        }
        joined = &mut block_loop => {
            if let Err(err) = joined {
                tracing::error!("[SHUTDOWN] Block loop stopped: {}", compact_error(err));
            }
        }
    }

    scheduler.close().await;
    block_loop.abort();
    if let Err(err) = worker.await {
        tracing::warn!("[SHUTDOWN] Scan worker ended abnormally: {}", compact_error(err));
    }
    let _ = printer.await;
    Ok(())
}
