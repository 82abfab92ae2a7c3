/*!
Serveur TIME (RFC 868) sur TCP

Protocole historique : à la connexion, le serveur écrit 4 octets big-endian
(secondes depuis 1900-01-01, modulo 2^32) puis ferme. Aucune requête n'est lue.
*/

use crate::clock::ClockSource;
use crate::packet::NtpTimestamp;
use crate::shutdown::{self, ShutdownSignal};
use crate::stats::{incr, Stats};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Encode un instant au format TIME (secondes NTP sur 32 bits)
pub fn encode_time(instant: DateTime<Utc>) -> [u8; 4] {
    NtpTimestamp::from_datetime(instant).seconds().to_be_bytes()
}

pub struct TimeServer {
    listener: TcpListener,
    clock: Arc<dyn ClockSource>,
    stats: Arc<Stats>,
}

impl TimeServer {
    pub async fn bind(
        bind_address: &str,
        clock: Arc<dyn ClockSource>,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("Failed to bind TIME listener on {}", bind_address))?;

        Ok(TimeServer {
            listener,
            clock,
            stats,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read TIME socket address")
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        info!("TIME server listening on {}", self.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = shutdown::requested(&mut shutdown) => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    incr(&self.stats.time_protocol.connections);
                    let payload = encode_time(self.clock.now());
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(async move {
                        if let Err(e) = send_time(stream, payload).await {
                            debug!("Failed to send TIME response to {}: {}", peer, e);
                            incr(&stats.time_protocol.errors);
                        }
                    });
                }
                Err(e) => {
                    warn!("Error accepting TIME connection: {}", e);
                    incr(&self.stats.time_protocol.errors);
                }
            }
        }

        info!("TIME server stopped");
        Ok(())
    }
}

async fn send_time(mut stream: TcpStream, payload: [u8; 4]) -> std::io::Result<()> {
    stream.write_all(&payload).await?;
    stream.shutdown().await
}
