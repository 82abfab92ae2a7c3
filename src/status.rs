use crate::clock::{ClockSnapshot, ClockSource};
use crate::shutdown::{self, ShutdownSignal};
use crate::stats::{Stats, StatsSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Formate une ligne d'état lisible
pub fn status_line(clock: &ClockSnapshot, stats: &StatsSnapshot) -> String {
    let sync = if clock.valid { "SYNC" } else { "NO SYNC" };

    let last_fix = match clock.last_fix {
        Some(fix) => {
            let age = clock.now - fix;
            format!(
                "{} (age {:.1}s)",
                fix.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                age.num_milliseconds() as f64 / 1000.0
            )
        }
        None => "none".to_string(),
    };

    format!(
        "[{}] now={} last_fix={} feed={} fixes={}/{} checksum_failures={} decode_errors={} \
         ntp_sent={} ntp_dropped={} last={}",
        sync,
        clock.now.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
        last_fix,
        if stats.ingest.connected { "up" } else { "down" },
        stats.ingest.fixes_valid,
        stats.ingest.fixes_valid + stats.ingest.fixes_invalid,
        stats.ingest.checksum_failures,
        stats.ingest.decode_errors,
        stats.ntp.responses_sent,
        stats.ntp.requests_dropped,
        clock.last_sentence.as_deref().unwrap_or("-"),
    )
}

/// Journalise l'état de l'horloge à intervalle fixe
pub async fn run(
    clock: Arc<dyn ClockSource>,
    stats: Arc<Stats>,
    interval: Duration,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown::requested(&mut shutdown) => break,
            _ = ticker.tick() => {
                info!("{}", status_line(&clock.snapshot(), &stats.snapshot()));
            }
        }
    }

    Ok(())
}
