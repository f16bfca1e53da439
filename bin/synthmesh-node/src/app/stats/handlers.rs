use std::sync::{Arc, Mutex, PoisonError};

use axum::{extract::State, http::StatusCode};
use process_stats::Querier;
use tracing::warn;

type QuerierState = State<Arc<Mutex<Querier>>>;

pub async fn handle_cpu(State(querier): QuerierState) -> Result<String, StatusCode> {
    let cpu_percent = querier.lock().unwrap_or_else(PoisonError::into_inner).cpu_percent();
    match cpu_percent {
        Some(percent) => Ok(format!("{:.10}", percent)),
        None => {
            warn!("CPU usage is not available on this platform.");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

pub async fn handle_memory(State(querier): QuerierState) -> Result<String, StatusCode> {
    let virtual_size = querier
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .virtual_memory_size();
    match virtual_size {
        Some(bytes) => Ok(bytes.to_string()),
        None => {
            warn!("Memory usage is not available on this platform.");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

pub async fn handle_health() -> StatusCode {
    StatusCode::OK
}
