//! Per-indicator health: database reachability, process heap, disk space.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::Serialize;
use sysinfo::{Disks, System};

use super::RouterState;

/// The process is unhealthy above this resident set size.
const MAX_RSS_BYTES: u64 = 300 * 1024 * 1024;
/// ... or when less than half the disk is free.
const MIN_DISK_FREE_RATIO: f64 = 0.5;

#[derive(Serialize)]
struct Indicator {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl Indicator {
    fn up() -> Self {
        Self {
            status: "up",
            detail: None,
        }
    }

    fn down(detail: String) -> Self {
        Self {
            status: "down",
            detail: Some(detail),
        }
    }

    fn is_up(&self) -> bool {
        self.status == "up"
    }
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    db: Indicator,
    memory: Indicator,
    disk: Indicator,
}

pub(super) async fn health(State(state): State<RouterState>) -> Response {
    let db = match state.store.ping().await {
        Ok(()) => Indicator::up(),
        Err(err) => Indicator::down(err.to_string()),
    };

    let report = HealthReport {
        status: "ok",
        db,
        memory: memory_indicator(),
        disk: disk_indicator(),
    };

    let healthy = report.db.is_up() && report.memory.is_up() && report.disk.is_up();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let report = HealthReport {
        status: if healthy { "ok" } else { "degraded" },
        ..report
    };

    (status, Json(report)).into_response()
}

fn memory_indicator() -> Indicator {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return Indicator::down("could not resolve own pid".to_string());
    };

    let mut system = System::new();
    system.refresh_process(pid);

    match system.process(pid) {
        Some(process) if process.memory() <= MAX_RSS_BYTES => Indicator::up(),
        Some(process) => Indicator::down(format!(
            "rss {} MiB over the {} MiB budget",
            process.memory() / (1024 * 1024),
            MAX_RSS_BYTES / (1024 * 1024)
        )),
        None => Indicator::down("process not visible to sysinfo".to_string()),
    }
}

fn disk_indicator() -> Indicator {
    let disks = Disks::new_with_refreshed_list();

    let (total, available) = disks
        .iter()
        .fold((0u64, 0u64), |(total, available), disk| {
            (total + disk.total_space(), available + disk.available_space())
        });

    if total == 0 {
        // Containers without visible mounts; nothing to measure.
        return Indicator::up();
    }

    let ratio = available as f64 / total as f64;
    if ratio >= MIN_DISK_FREE_RATIO {
        Indicator::up()
    } else {
        Indicator::down(format!("only {:.0}% disk free", ratio * 100.0))
    }
}
