//! Structured JSON-line logging.
//!
//! Ad-hoc formatting choices here are intentionally minimal: this module's
//! job is to get a `component/event/fields` record onto disk as one JSON
//! line per call, ordered by a monotonic sequence number. The trading logic
//! never inspects a log record; logs are write-only from the engine's
//! perspective.

use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static SINK: OnceLock<Mutex<BufWriter<File>>> = OnceLock::new();

fn ensure_sink() -> &'static Mutex<BufWriter<File>> {
    SINK.get_or_init(|| {
        let dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/logs".to_string());
        let mut path = PathBuf::from(dir);
        let _ = create_dir_all(&path);
        path.push("engine.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap_or_else(|_| File::create("/tmp/ledgerbot-engine.jsonl").expect("fallback log file"));
        Mutex::new(BufWriter::new(file))
    })
}

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

fn ts_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Emit one structured record: `{ts, seq, lvl, component, event, ...fields}`.
pub fn json_log(component: &str, event: &str, fields: Map<String, Value>) {
    json_log_at(Level::Info, component, event, fields);
}

pub fn json_log_at(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() {
        return;
    }
    let mut entry = Map::new();
    entry.insert("ts".into(), json!(ts_now()));
    entry.insert("seq".into(), json!(next_seq()));
    entry.insert("lvl".into(), json!(level.as_str()));
    entry.insert("component".into(), json!(component));
    entry.insert("event".into(), json!(event));
    for (k, v) in fields {
        entry.insert(k, v);
    }
    let line = Value::Object(entry).to_string();
    if let Ok(mut w) = ensure_sink().lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
    if level >= Level::Warn {
        eprintln!("{}", line);
    }
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

pub fn v_bool(b: bool) -> Value {
    Value::Bool(b)
}
