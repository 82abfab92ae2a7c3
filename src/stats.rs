use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Compteurs partagés entre l'ingestion NMEA, le serveur NTP et le serveur TIME
///
/// Uniquement des atomiques : aucune tâche ne prend de verrou pour compter.
#[derive(Debug, Default)]
pub struct Stats {
    pub ingest: IngestCounters,
    pub ntp: NtpCounters,
    pub time_protocol: TimeProtocolCounters,
}

#[derive(Debug, Default)]
pub struct IngestCounters {
    /// Flux NMEA actuellement connecté
    pub connected: AtomicBool,
    pub connections: AtomicU64,
    /// Tentatives de connexion refusées ou expirées
    pub connect_failures: AtomicU64,
    pub lines: AtomicU64,
    /// Lignes vides et trafic AIS
    pub ignored: AtomicU64,
    pub unrecognized: AtomicU64,
    pub fixes_valid: AtomicU64,
    pub fixes_invalid: AtomicU64,
    /// Checksum absent ou faux (trame acceptée ou non selon la config)
    pub checksum_failures: AtomicU64,
    pub decode_errors: AtomicU64,
}

#[derive(Debug, Default)]
pub struct NtpCounters {
    pub requests_received: AtomicU64,
    pub responses_sent: AtomicU64,
    /// Requêtes malformées, abandonnées sans réponse
    pub requests_dropped: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Default)]
pub struct TimeProtocolCounters {
    pub connections: AtomicU64,
    pub errors: AtomicU64,
}

/// Copie sérialisable des compteurs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ingest: IngestSnapshot,
    pub ntp: NtpSnapshot,
    pub time_protocol: TimeProtocolSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub connected: bool,
    pub connections: u64,
    pub connect_failures: u64,
    pub lines: u64,
    pub ignored: u64,
    pub unrecognized: u64,
    pub fixes_valid: u64,
    pub fixes_invalid: u64,
    pub checksum_failures: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NtpSnapshot {
    pub requests_received: u64,
    pub responses_sent: u64,
    pub requests_dropped: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeProtocolSnapshot {
    pub connections: u64,
    pub errors: u64,
}

/// Incrémente un compteur
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let ingest = &self.ingest;
        let ntp = &self.ntp;
        let time_protocol = &self.time_protocol;

        StatsSnapshot {
            ingest: IngestSnapshot {
                connected: ingest.connected.load(Ordering::Relaxed),
                connections: load(&ingest.connections),
                connect_failures: load(&ingest.connect_failures),
                lines: load(&ingest.lines),
                ignored: load(&ingest.ignored),
                unrecognized: load(&ingest.unrecognized),
                fixes_valid: load(&ingest.fixes_valid),
                fixes_invalid: load(&ingest.fixes_invalid),
                checksum_failures: load(&ingest.checksum_failures),
                decode_errors: load(&ingest.decode_errors),
            },
            ntp: NtpSnapshot {
                requests_received: load(&ntp.requests_received),
                responses_sent: load(&ntp.responses_sent),
                requests_dropped: load(&ntp.requests_dropped),
                errors: load(&ntp.errors),
            },
            time_protocol: TimeProtocolSnapshot {
                connections: load(&time_protocol.connections),
                errors: load(&time_protocol.errors),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = Stats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());

        incr(&stats.ingest.lines);
        incr(&stats.ingest.lines);
        incr(&stats.ntp.requests_dropped);
        stats.ingest.connected.store(true, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ingest.lines, 2);
        assert!(snapshot.ingest.connected);
        assert_eq!(snapshot.ntp.requests_dropped, 1);
        assert_eq!(snapshot.time_protocol.connections, 0);
    }
}
