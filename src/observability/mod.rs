//! 可观测性：日志初始化与轮次计数

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// 进程级计数器
#[derive(Debug, Default)]
pub struct Metrics {
    turns_started: AtomicU64,
    turns_completed: AtomicU64,
    turns_failed: AtomicU64,
    environments_created: AtomicU64,
    environments_reused: AtomicU64,
    malformed_lines: AtomicU64,
}

impl Metrics {
    pub fn global() -> &'static Metrics {
        static METRICS: OnceLock<Metrics> = OnceLock::new();
        METRICS.get_or_init(Metrics::default)
    }

    pub fn turn_started(&self) {
        self.turns_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turn_completed(&self) {
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turn_failed(&self) {
        self.turns_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn environment_created(&self) {
        self.environments_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn environment_reused(&self) {
        self.environments_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_line(&self) {
        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "turns_started": self.turns_started.load(Ordering::Relaxed),
            "turns_completed": self.turns_completed.load(Ordering::Relaxed),
            "turns_failed": self.turns_failed.load(Ordering::Relaxed),
            "environments_created": self.environments_created.load(Ordering::Relaxed),
            "environments_reused": self.environments_reused.load(Ordering::Relaxed),
            "malformed_lines": self.malformed_lines.load(Ordering::Relaxed),
        })
    }
}
