use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};

/// Configuration du pont GPS → NTP
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// Flux NMEA (TCP)
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Serveur NTP (UDP)
    #[serde(default)]
    pub ntp: NtpConfig,

    /// Serveur TIME RFC 868 (TCP)
    #[serde(default)]
    pub time_protocol: TimeProtocolConfig,

    /// Discipline de l'horloge
    #[serde(default)]
    pub clock: ClockConfig,

    /// Rapport d'état périodique
    #[serde(default)]
    pub status: StatusConfig,

    /// Configuration des logs
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Interface de statut HTTP
    #[serde(default)]
    pub webserver: WebServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IngestConfig {
    /// Hôte qui diffuse les trames NMEA (multiplexeur, passerelle série/IP...)
    #[serde(default = "default_ingest_host")]
    pub host: String,

    /// Port TCP (10110 = port NMEA conventionnel)
    #[serde(default = "default_ingest_port")]
    pub port: u16,

    /// Rejeter les trames dont le checksum est absent ou faux
    #[serde(default = "default_false")]
    pub require_checksum: bool,

    /// Délai initial de reconnexion en secondes (doublé à chaque échec)
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Délai maximal de reconnexion en secondes
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,

    /// Une connexion muette pendant ce délai est recyclée
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct NtpConfig {
    /// Adresse d'écoute (ex: "0.0.0.0:123")
    #[serde(default = "default_ntp_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TimeProtocolConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,

    #[serde(default = "default_time_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct ClockConfig {
    /// Durée de validité d'un fix en secondes (absent = jusqu'au prochain fix invalide)
    pub holdover_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StatusConfig {
    /// Période du rapport d'état en secondes (0 = désactivé)
    #[serde(default = "default_status_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Activer les logs de chaque requête NTP (niveau debug)
    #[serde(default = "default_false")]
    pub log_requests: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WebServerConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Port du serveur web (interface de monitoring)
    #[serde(default = "default_web_port")]
    pub port: u16,

    /// Adresse d'écoute du serveur web
    #[serde(default = "default_web_bind_address")]
    pub bind_address: String,
}

// Fonctions par défaut pour serde
fn default_ingest_host() -> String { "127.0.0.1".to_string() }
fn default_ingest_port() -> u16 { 10110 }
fn default_reconnect_delay() -> u64 { 5 }
fn default_max_reconnect_delay() -> u64 { 60 }
fn default_idle_timeout() -> u64 { 10 }
fn default_ntp_bind_address() -> String { "0.0.0.0:123".to_string() }
fn default_time_bind_address() -> String { "0.0.0.0:37".to_string() }
fn default_status_interval() -> u64 { 60 }
fn default_false() -> bool { false }
fn default_web_port() -> u16 { 8080 }
fn default_web_bind_address() -> String { "127.0.0.1".to_string() }

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            host: default_ingest_host(),
            port: default_ingest_port(),
            require_checksum: false,
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_delay_secs: default_max_reconnect_delay(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for NtpConfig {
    fn default() -> Self {
        NtpConfig {
            bind_address: default_ntp_bind_address(),
        }
    }
}

impl Default for TimeProtocolConfig {
    fn default() -> Self {
        TimeProtocolConfig {
            enabled: false,
            bind_address: default_time_bind_address(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig {
            interval_secs: default_status_interval(),
        }
    }
}

impl Default for WebServerConfig {
    fn default() -> Self {
        WebServerConfig {
            enabled: false,
            port: default_web_port(),
            bind_address: default_web_bind_address(),
        }
    }
}

impl IngestConfig {
    /// Adresse "hôte:port" du flux NMEA
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ClockConfig {
    pub fn holdover(&self) -> Option<Duration> {
        self.holdover_secs.map(Duration::from_secs)
    }
}

impl WebServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl Config {
    /// Charge la configuration depuis un fichier TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Sauvegarde la configuration dans un fichier TOML
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path.as_ref(), content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Valide la configuration
    fn validate(&self) -> Result<()> {
        if self.ingest.host.trim().is_empty() {
            anyhow::bail!("Invalid ingest host: must not be empty");
        }

        if self.ingest.port == 0 {
            anyhow::bail!("Invalid ingest port: must not be 0");
        }

        if self.ingest.reconnect_delay_secs == 0
            || self.ingest.reconnect_delay_secs > self.ingest.max_reconnect_delay_secs
        {
            anyhow::bail!(
                "Invalid reconnect delays: need 0 < reconnect_delay_secs <= max_reconnect_delay_secs"
            );
        }

        if self.ingest.idle_timeout_secs == 0 {
            anyhow::bail!("Invalid idle timeout: must be at least 1 second");
        }

        parse_socket_addr("ntp.bind_address", &self.ntp.bind_address)?;

        if self.time_protocol.enabled {
            parse_socket_addr("time_protocol.bind_address", &self.time_protocol.bind_address)?;
        }

        if self.webserver.enabled {
            parse_socket_addr("webserver", &self.webserver.address())?;
        }

        Ok(())
    }

    /// Crée un fichier de configuration exemple
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let example_config = Config {
            ingest: IngestConfig {
                host: "192.168.1.50".to_string(),
                ..IngestConfig::default()
            },
            time_protocol: TimeProtocolConfig {
                enabled: true,
                ..TimeProtocolConfig::default()
            },
            clock: ClockConfig {
                holdover_secs: Some(30),
            },
            ..Config::default()
        };

        example_config.to_file(path)
    }
}

fn parse_socket_addr(name: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("Invalid {} address: {}", name, value))
}
