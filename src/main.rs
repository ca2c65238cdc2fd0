//! Binary entry point: composition root for the cycle orchestrator.
//!
//! Env-driven config, a `loop { ...; sleep(...) }` cycle, `json_log`
//! progress lines. Concrete `DataEngine`, `SignalEngine`, and exchange
//! `Connector` implementations are out of scope for this crate — a real
//! deployment wires its own feed/strategy/exchange crates in here in place
//! of the `Mock`/`Null`/`Sim` doubles below, the same way a stub adapter is
//! swapped for a real one once API keys are present.

use ledgerbot::config::EngineConfig;
use ledgerbot::contracts::{MockDataEngine, NullSignalEngine, SimConnector};
use ledgerbot::logging::{json_log, obj, v_num, v_str};
use ledgerbot::orchestrator::Orchestrator;
use ledgerbot::store::sqlite::SqliteStateStore;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match EngineConfig::from_env().validate() {
        Ok(cfg) => cfg,
        Err(reason) => {
            eprintln!("fatal init error: {reason}");
            std::process::exit(1);
        }
    };

    let session_id = std::env::var("SESSION_ID").unwrap_or_else(|_| format!("session-{}", uuid::Uuid::new_v4()));
    let db_path = std::env::var("STATE_DB_PATH").unwrap_or_else(|_| "out/ledgerbot.sqlite3".to_string());
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let store = match SqliteStateStore::open(&db_path) {
        Ok(s) => Box::new(s),
        Err(e) => {
            eprintln!("fatal init error: could not open state store at {db_path}: {e}");
            std::process::exit(1);
        }
    };

    json_log(
        "orchestrator",
        "STARTUP",
        obj(&[
            ("session_id", v_str(&session_id)),
            ("symbols", v_num(config.trading.symbols.len() as f64)),
            ("live_mode", v_str(if config.trading.live_mode { "true" } else { "false" })),
            ("dry_run", v_str(if config.trading.dry_run { "true" } else { "false" })),
        ]),
    );

    let mut orchestrator = match Orchestrator::hydrate(
        config.clone(),
        session_id.clone(),
        Box::new(MockDataEngine::default()),
        Box::new(NullSignalEngine),
        Box::new(SimConnector::default()),
        store,
    )
    .await
    {
        Ok(o) => o,
        Err(e) => {
            eprintln!("fatal init error: {e}");
            std::process::exit(1);
        }
    };

    let mut cycle: u64 = 0;
    loop {
        cycle += 1;
        if let Err(e) = orchestrator.run_cycle().await {
            json_log("orchestrator", "CYCLE_ERROR", obj(&[("cycle", v_num(cycle as f64)), ("error", v_str(&e.to_string()))]));
        }
        sleep(Duration::from_secs(config.trading.cycle_interval_secs)).await;
    }
}
