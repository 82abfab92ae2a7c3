/*!
Interface de statut HTTP (optionnelle)

Fournit :
- `GET /api/status` : instantané de l'horloge + compteurs
- `GET /api/time` : heure servie au format NTP et Unix
*/

use crate::clock::{ClockSnapshot, ClockSource};
use crate::packet::NtpTimestamp;
use crate::shutdown::{self, ShutdownSignal};
use crate::stats::{Stats, StatsSnapshot};
use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// État partagé du serveur web
#[derive(Clone)]
pub struct WebServerState {
    clock: Arc<dyn ClockSource>,
    stats: Arc<Stats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub clock: ClockSnapshot,
    pub stats: StatsSnapshot,
}

/// Heure courante sous plusieurs formes
#[derive(Debug, Clone, Serialize)]
pub struct TimeReport {
    /// Timestamp NTP complet (64 bits)
    pub timestamp: u64,

    /// Secondes depuis epoch NTP (1900-01-01)
    pub seconds: u32,

    /// Fraction (0 à 2^32-1)
    pub fraction: u32,

    /// Timestamp Unix (pour JavaScript Date)
    pub unix_timestamp_ms: i64,

    pub synchronized: bool,
}

pub struct WebServer {
    bind_addr: String,
    state: WebServerState,
}

impl WebServer {
    pub fn new(bind_addr: String, clock: Arc<dyn ClockSource>, stats: Arc<Stats>) -> Self {
        WebServer {
            bind_addr,
            state: WebServerState { clock, stats },
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(status_handler))
            .route("/api/time", get(time_handler))
            .with_state(self.state.clone())
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) -> anyhow::Result<()> {
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind web server on {}", self.bind_addr))?;
        info!("Web server listening on http://{}", self.bind_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown::requested(&mut shutdown).await })
            .await
            .context("Web server error")?;

        info!("Web server stopped");
        Ok(())
    }
}

/// API REST : état complet
async fn status_handler(State(state): State<WebServerState>) -> Json<StatusReport> {
    Json(StatusReport {
        clock: state.clock.snapshot(),
        stats: state.stats.snapshot(),
    })
}

/// API REST : temps actuel
async fn time_handler(State(state): State<WebServerState>) -> Json<TimeReport> {
    let snapshot = state.clock.snapshot();
    let timestamp = NtpTimestamp::from_datetime(snapshot.now);

    Json(TimeReport {
        timestamp: timestamp.0,
        seconds: timestamp.seconds(),
        fraction: timestamp.fraction(),
        unix_timestamp_ms: snapshot.now.timestamp_millis(),
        synchronized: snapshot.valid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::DisciplinedClock;
    use crate::nmea::DecodedFix;
    use chrono::{TimeZone, Utc};

    fn state() -> (Arc<DisciplinedClock>, WebServerState) {
        let clock = Arc::new(DisciplinedClock::new(None));
        let state = WebServerState {
            clock: clock.clone(),
            stats: Arc::new(Stats::new()),
        };
        (clock, state)
    }

    #[tokio::test]
    async fn test_status_handler() {
        let (clock, state) = state();
        let fix = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();
        clock.update(&DecodedFix {
            utc: fix,
            valid: true,
            checksum_ok: true,
        });

        let Json(report) = status_handler(State(state)).await;
        assert!(report.clock.valid);
        assert_eq!(report.clock.last_fix, Some(fix));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["clock"]["valid"], true);
        assert_eq!(json["stats"]["ingest"]["lines"], 0);
    }

    #[tokio::test]
    async fn test_time_handler_unsynced() {
        let (_clock, state) = state();

        let before = Utc::now().timestamp_millis();
        let Json(report) = time_handler(State(state)).await;

        assert!(!report.synchronized);
        assert!(report.unix_timestamp_ms >= before);
        assert_eq!(report.timestamp >> 32, report.seconds as u64);
    }
}
