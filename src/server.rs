use crate::clock::ClockSource;
use crate::packet::NtpPacket;
use crate::response::build_response;
use crate::shutdown::{self, ShutdownSignal};
use crate::stats::{incr, Stats};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Taille du buffer de réception (en-tête + éventuels champs d'extension)
const RECV_BUFFER_SIZE: usize = 1024;

/// Serveur NTP
pub struct NtpServer {
    socket: Arc<UdpSocket>,
    clock: Arc<dyn ClockSource>,
    stats: Arc<Stats>,
    log_requests: bool,
}

impl NtpServer {
    pub async fn bind(
        bind_address: &str,
        clock: Arc<dyn ClockSource>,
        stats: Arc<Stats>,
        log_requests: bool,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_address)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {}", bind_address))?;

        Ok(NtpServer {
            socket: Arc::new(socket),
            clock,
            stats,
            log_requests,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Failed to read NTP socket address")
    }

    /// Boucle de réception ; chaque requête est traitée dans sa propre tâche
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        info!("NTP server listening on {}", self.local_addr()?);

        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            let received = tokio::select! {
                _ = shutdown::requested(&mut shutdown) => break,
                received = self.socket.recv_from(&mut buffer) => received,
            };

            // T2 : le plus tôt possible après recv_from
            let received_at = self.clock.now();

            let (size, client_addr) = match received {
                Ok(received) => received,
                Err(e) => {
                    // Ex: ICMP port unreachable remonté sur certains OS
                    warn!("Error receiving NTP request: {}", e);
                    incr(&self.stats.ntp.errors);
                    continue;
                }
            };

            incr(&self.stats.ntp.requests_received);

            let request = buffer[..size].to_vec();
            let socket = Arc::clone(&self.socket);
            let clock = Arc::clone(&self.clock);
            let stats = Arc::clone(&self.stats);
            let log_requests = self.log_requests;

            tokio::spawn(async move {
                respond(
                    &socket,
                    clock.as_ref(),
                    &stats,
                    &request,
                    client_addr,
                    received_at,
                    log_requests,
                )
                .await;
            });
        }

        info!("NTP server stopped");
        Ok(())
    }
}

/// Construit et envoie la réponse ; une requête malformée est ignorée en silence
async fn respond(
    socket: &UdpSocket,
    clock: &dyn ClockSource,
    stats: &Stats,
    request: &[u8],
    client_addr: SocketAddr,
    received_at: DateTime<Utc>,
    log_requests: bool,
) {
    let response = match build_response(request, received_at, clock) {
        Ok(response) => response,
        Err(e) => {
            debug!("Dropping NTP request from {}: {}", client_addr, e);
            incr(&stats.ntp.requests_dropped);
            return;
        }
    };

    if log_requests {
        if let Ok(packet) = NtpPacket::from_bytes(request) {
            debug!(
                "NTP request from {}: version={}, mode={:?}, client_time={:?}",
                client_addr,
                packet.version,
                packet.mode,
                packet.transmit_timestamp.to_datetime()
            );
        }
    }

    match socket.send_to(&response, client_addr).await {
        Ok(_) => {
            incr(&stats.ntp.responses_sent);
            if log_requests {
                debug!("NTP response sent to {} (stratum {})", client_addr, response[1]);
            }
        }
        Err(e) => {
            debug!("Failed to send NTP response to {}: {}", client_addr, e);
            incr(&stats.ntp.errors);
        }
    }
}
