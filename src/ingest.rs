/*!
Lecture du flux NMEA via TCP avec reconnexion automatique

Le flux provient typiquement d'une passerelle série/IP ou d'un multiplexeur
NMEA. Chaque ligne est classée, décodée si elle porte l'heure, puis appliquée
à l'horloge disciplinée.

Architecture :
- Une seule tâche d'ingestion : les fix sont appliqués dans l'ordre de réception
- Reconnexion avec délai exponentiel, remis à zéro dès qu'une connexion aboutit
- Une connexion muette plus de `idle_timeout_secs` est recyclée
- Aucune erreur de trame n'est fatale : elles sont comptées et ignorées
*/

use crate::clock::DisciplinedClock;
use crate::config::IngestConfig;
use crate::nmea::{self, DecodeError, DecodedFix, SentenceKind};
use crate::shutdown::{self, ShutdownSignal};
use crate::stats::{incr, Stats};
use anyhow::{anyhow, Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Longueur maximale d'une ligne (une trame NMEA fait au plus 82 caractères)
const MAX_LINE_BYTES: u64 = 4096;

/// Résultat du traitement d'une ligne
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Ignored,
    Unrecognized,
    Fix(DecodedFix),
    Rejected(DecodeError),
}

/// Délai de reconnexion exponentiel, borné par `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    /// Délai à attendre maintenant ; le suivant est doublé
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Gestionnaire de lecture du flux NMEA
pub struct NmeaIngest {
    config: IngestConfig,
    clock: Arc<DisciplinedClock>,
    stats: Arc<Stats>,
}

impl NmeaIngest {
    pub fn new(config: IngestConfig, clock: Arc<DisciplinedClock>, stats: Arc<Stats>) -> Self {
        NmeaIngest {
            config,
            clock,
            stats,
        }
    }

    /// Boucle principale : connexion, lecture, reconnexion jusqu'à l'arrêt
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        info!("Starting NMEA ingestion from {}", self.config.address());
        info!("  Require checksum: {}", self.config.require_checksum);

        let mut backoff = Backoff::new(
            Duration::from_secs(self.config.reconnect_delay_secs),
            Duration::from_secs(self.config.max_reconnect_delay_secs),
        );

        loop {
            let session = tokio::select! {
                _ = shutdown::requested(&mut shutdown) => break,
                session = self.run_session(&mut backoff) => session,
            };

            match session {
                Ok(()) => warn!("NMEA feed closed by peer"),
                Err(e) => error!("NMEA feed error: {:#}", e),
            }

            let delay = backoff.next_delay();
            info!("Reconnecting in {:?}...", delay);
            tokio::select! {
                _ = shutdown::requested(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.stats.ingest.connected.store(false, Ordering::Relaxed);
        info!("NMEA ingestion stopped");
        Ok(())
    }

    /// Une connexion complète ; `Ok` si le pair ferme proprement
    ///
    /// Le délai de reconnexion repart de sa valeur initiale dès que la
    /// connexion TCP aboutit, quelle que soit l'issue de la session.
    async fn run_session(&self, backoff: &mut Backoff) -> Result<()> {
        let address = self.config.address();
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);

        info!("Connecting to NMEA feed at {}", address);
        let connected = tokio::time::timeout(idle_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", address))
            .and_then(|result| {
                result.with_context(|| format!("Failed to connect to {}", address))
            });

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                incr(&self.stats.ingest.connect_failures);
                return Err(e);
            }
        };

        info!("NMEA feed connected");
        backoff.reset();
        self.stats.ingest.connected.store(true, Ordering::Relaxed);
        incr(&self.stats.ingest.connections);

        let result = self.read_lines(stream, idle_timeout).await;

        self.stats.ingest.connected.store(false, Ordering::Relaxed);
        result
    }

    async fn read_lines(&self, stream: TcpStream, idle_timeout: Duration) -> Result<()> {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::with_capacity(128);

        loop {
            raw.clear();
            let mut limited = (&mut reader).take(MAX_LINE_BYTES);
            let size = tokio::time::timeout(idle_timeout, limited.read_until(b'\n', &mut raw))
                .await
                .map_err(|_| anyhow!("No data from NMEA feed for {:?}", idle_timeout))?
                .context("Failed to read from NMEA feed")?;

            if size == 0 {
                return Ok(());
            }

            self.process_line(&String::from_utf8_lossy(&raw));
        }
    }

    /// Traite une ligne brute et met à jour l'horloge si elle porte un fix
    pub fn process_line(&self, line: &str) -> LineOutcome {
        let counters = &self.stats.ingest;
        incr(&counters.lines);

        let sentence = nmea::strip_noise(line.trim());
        if !sentence.is_empty() {
            debug!("NMEA: {}", sentence.chars().take(80).collect::<String>());
        }

        match nmea::classify(sentence) {
            SentenceKind::Ignored => {
                incr(&counters.ignored);
                LineOutcome::Ignored
            }
            SentenceKind::Unrecognized => {
                incr(&counters.unrecognized);
                LineOutcome::Unrecognized
            }
            SentenceKind::Rmc | SentenceKind::Zda => {
                match nmea::decode(sentence, self.config.require_checksum) {
                    Ok(fix) => {
                        if !fix.checksum_ok {
                            incr(&counters.checksum_failures);
                        }
                        if fix.valid {
                            incr(&counters.fixes_valid);
                        } else {
                            debug!("GPS fix not valid: {}", sentence);
                            incr(&counters.fixes_invalid);
                        }

                        self.clock.note_sentence(sentence);
                        self.clock.update(&fix);
                        LineOutcome::Fix(fix)
                    }
                    Err(e) => {
                        if e == DecodeError::ChecksumMismatch {
                            incr(&counters.checksum_failures);
                        }
                        debug!("Rejected NMEA sentence ({}): {}", e, sentence);
                        incr(&counters.decode_errors);
                        LineOutcome::Rejected(e)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockSource;
    use chrono::{TimeZone, Utc};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const RMC_VALID: &str =
        "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
    const RMC_VOID: &str = "$GPRMC,235959.999,V,,,,,,,311279,,,N*4A";
    const ZDA_VALID: &str = "$GPZDA,201530.00,04,07,2002,00,00*60";

    fn ingest(require_checksum: bool) -> NmeaIngest {
        let config = IngestConfig {
            require_checksum,
            ..IngestConfig::default()
        };
        NmeaIngest::new(config, Arc::new(DisciplinedClock::new(None)), Arc::new(Stats::new()))
    }

    #[test]
    fn test_valid_rmc_updates_clock() {
        let ingest = ingest(false);

        let outcome = ingest.process_line(&format!("{}\r\n", RMC_VALID));
        assert!(matches!(outcome, LineOutcome::Fix(fix) if fix.valid));

        let snapshot = ingest.clock.snapshot();
        assert!(snapshot.valid);
        assert_eq!(
            snapshot.last_fix,
            Some(Utc.with_ymd_and_hms(1994, 3, 23, 12, 35, 19).unwrap())
        );
        assert_eq!(snapshot.last_sentence.as_deref(), Some(RMC_VALID));

        let stats = ingest.stats.snapshot();
        assert_eq!(stats.ingest.lines, 1);
        assert_eq!(stats.ingest.fixes_valid, 1);
        assert_eq!(stats.ingest.checksum_failures, 0);
    }

    #[test]
    fn test_void_rmc_marks_clock_unsynchronized() {
        let ingest = ingest(false);

        ingest.process_line(ZDA_VALID);
        assert!(ingest.clock.snapshot().valid);

        ingest.process_line(RMC_VOID);
        let snapshot = ingest.clock.snapshot();
        assert!(!snapshot.valid);
        assert_eq!(
            snapshot.last_fix,
            Some(Utc.with_ymd_and_hms(2002, 7, 4, 20, 15, 30).unwrap())
        );
        assert_eq!(snapshot.last_sentence.as_deref(), Some(RMC_VOID));
        assert_eq!(ingest.stats.snapshot().ingest.fixes_invalid, 1);
    }

    #[test]
    fn test_noise_ais_and_garbage() {
        let ingest = ingest(false);

        assert_eq!(ingest.process_line(""), LineOutcome::Ignored);
        assert_eq!(
            ingest.process_line("!AIVDM,1,1,,B,15M67FC000G?ufbE`FepT@3n00Sa,0*5C"),
            LineOutcome::Ignored
        );
        assert_eq!(ingest.process_line("$GPGGA,123519,4807.038,N"), LineOutcome::Unrecognized);
        assert_eq!(ingest.process_line("hello world"), LineOutcome::Unrecognized);

        // Bannière avant le marqueur
        let outcome = ingest.process_line(&format!("GPS-MUX v2> {}", ZDA_VALID));
        assert!(matches!(outcome, LineOutcome::Fix(_)));
        assert_eq!(ingest.clock.snapshot().last_sentence.as_deref(), Some(ZDA_VALID));

        let stats = ingest.stats.snapshot();
        assert_eq!(stats.ingest.ignored, 2);
        assert_eq!(stats.ingest.unrecognized, 2);
        assert_eq!(stats.ingest.lines, 5);
    }

    #[test]
    fn test_checksum_policy() {
        let bad = "$GPZDA,201530.00,04,07,2002,00,00*00";

        let lenient = ingest(false);
        assert!(matches!(lenient.process_line(bad), LineOutcome::Fix(_)));
        assert!(lenient.clock.snapshot().valid);
        assert_eq!(lenient.stats.snapshot().ingest.checksum_failures, 1);

        let strict = ingest(true);
        assert_eq!(
            strict.process_line(bad),
            LineOutcome::Rejected(DecodeError::ChecksumMismatch)
        );
        let snapshot = strict.clock.snapshot();
        assert!(!snapshot.valid);
        assert_eq!(snapshot.last_fix, None);
        assert_eq!(snapshot.last_sentence, None);

        let stats = strict.stats.snapshot();
        assert_eq!(stats.ingest.checksum_failures, 1);
        assert_eq!(stats.ingest.decode_errors, 1);
    }

    #[test]
    fn test_malformed_sentence_is_counted() {
        let ingest = ingest(false);

        let outcome = ingest.process_line("$GPRMC,123519,A,,,,,,,231394,");
        assert_eq!(
            outcome,
            LineOutcome::Rejected(DecodeError::CalendarConstructionFailed)
        );
        assert_eq!(ingest.stats.snapshot().ingest.decode_errors, 1);
        assert!(!ingest.clock.snapshot().valid);
    }

    #[tokio::test]
    async fn test_run_reads_feed_and_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let feed = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let lines = format!(
                "!AIVDM,1,1,,A,13u?etPv2;0n:dDPwUM1U1Cb069D,0*24\r\n{}\r\n",
                ZDA_VALID
            );
            socket.write_all(lines.as_bytes()).await.unwrap();
            // Garder la connexion ouverte jusqu'à la fin du test
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = IngestConfig {
            port,
            idle_timeout_secs: 30,
            ..IngestConfig::default()
        };
        let clock = Arc::new(DisciplinedClock::new(None));
        let stats = Arc::new(Stats::new());
        let (tx, rx) = shutdown::channel();

        let task = tokio::spawn(
            NmeaIngest::new(config, Arc::clone(&clock), Arc::clone(&stats)).run(rx),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while !clock.snapshot().valid {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let snapshot = stats.snapshot();
        assert!(snapshot.ingest.connected);
        assert_eq!(snapshot.ingest.connections, 1);
        assert_eq!(snapshot.ingest.ignored, 1);

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!stats.snapshot().ingest.connected);

        feed.abort();
    }

    #[test]
    fn test_backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));

        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_backoff_resets_after_idle_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (accepted_tx, mut accepted_rx) = tokio::sync::mpsc::unbounded_channel();

        // Accepte chaque connexion puis reste muet
        let feed = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let _ = accepted_tx.send(tokio::time::Instant::now());
                held.push(socket);
            }
        });

        let config = IngestConfig {
            port,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 60,
            idle_timeout_secs: 1,
            ..IngestConfig::default()
        };
        let stats = Arc::new(Stats::new());
        let (tx, rx) = shutdown::channel();
        let task = tokio::spawn(
            NmeaIngest::new(config, Arc::new(DisciplinedClock::new(None)), Arc::clone(&stats))
                .run(rx),
        );

        let mut accepted = Vec::new();
        while accepted.len() < 4 {
            let at = tokio::time::timeout(Duration::from_secs(10), accepted_rx.recv())
                .await
                .unwrap()
                .unwrap();
            accepted.push(at);
        }

        // 1 s d'inactivité + 1 s de délai à chaque cycle, sans croissance
        for pair in accepted.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(1_500), "gap too short: {:?}", gap);
            assert!(gap < Duration::from_millis(2_800), "backoff kept growing: {:?}", gap);
        }

        let snapshot = stats.snapshot();
        assert!(snapshot.ingest.connections >= 4);
        assert_eq!(snapshot.ingest.connect_failures, 0);

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        feed.abort();
    }

    #[tokio::test]
    async fn test_backoff_grows_to_cap_while_connect_fails() {
        // Port libéré aussitôt : chaque connexion est refusée
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = IngestConfig {
            port,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 2,
            idle_timeout_secs: 1,
            ..IngestConfig::default()
        };
        let stats = Arc::new(Stats::new());
        let (tx, rx) = shutdown::channel();
        let start = tokio::time::Instant::now();
        let task = tokio::spawn(
            NmeaIngest::new(config, Arc::new(DisciplinedClock::new(None)), Arc::clone(&stats))
                .run(rx),
        );

        // Tentatives attendues à t = 0, 1, 3, 5 s (1 s, 2 s, puis plafond à 2 s)
        let failures_at = |millis: u64| {
            let stats = Arc::clone(&stats);
            async move {
                tokio::time::sleep_until(start + Duration::from_millis(millis)).await;
                stats.snapshot().ingest.connect_failures
            }
        };
        assert_eq!(failures_at(2_000).await, 2);
        assert_eq!(failures_at(4_000).await, 3);
        assert_eq!(failures_at(6_000).await, 4);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ingest.connections, 0);
        assert!(!snapshot.ingest.connected);

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
