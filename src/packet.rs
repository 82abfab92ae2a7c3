use chrono::{DateTime, Utc};
use thiserror::Error;

/// Différence entre l'epoch NTP (1900-01-01) et l'epoch Unix (1970-01-01) en secondes
pub const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// Erreurs liées aux paquets NTP
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NtpError {
    #[error("Request too short: expected at least {expected} bytes, got {actual}")]
    RequestTooShort { expected: usize, actual: usize },
}

/// Leap Indicator values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapIndicator {
    NoWarning = 0,
    LastMinute61Seconds = 1,
    LastMinute59Seconds = 2,
    /// Horloge non synchronisée
    AlarmCondition = 3,
}

impl From<u8> for LeapIndicator {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0 => LeapIndicator::NoWarning,
            1 => LeapIndicator::LastMinute61Seconds,
            2 => LeapIndicator::LastMinute59Seconds,
            _ => LeapIndicator::AlarmCondition,
        }
    }
}

/// NTP Mode values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtpMode {
    Reserved = 0,
    SymmetricActive = 1,
    SymmetricPassive = 2,
    Client = 3,
    Server = 4,
    Broadcast = 5,
    NtpControlMessage = 6,
    ReservedPrivate = 7,
}

impl From<u8> for NtpMode {
    fn from(value: u8) -> Self {
        match value & 0x07 {
            0 => NtpMode::Reserved,
            1 => NtpMode::SymmetricActive,
            2 => NtpMode::SymmetricPassive,
            3 => NtpMode::Client,
            4 => NtpMode::Server,
            5 => NtpMode::Broadcast,
            6 => NtpMode::NtpControlMessage,
            _ => NtpMode::ReservedPrivate,
        }
    }
}

/// Timestamp NTP 64 bits : 32 bits de secondes depuis 1900 + 32 bits de fraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Convertit un instant UTC, fraction = round(fraction_secondes × 2^32)
    ///
    /// Les secondes sont réduites modulo 2^32 (ères NTP, RFC 5905).
    pub fn from_datetime(instant: DateTime<Utc>) -> Self {
        let seconds = (instant.timestamp() + NTP_UNIX_OFFSET).rem_euclid(1 << 32) as u64;

        // Une seconde intercalaire chrono est représentée par nanos >= 10^9
        let nanos = instant.timestamp_subsec_nanos().min(999_999_999) as u64;
        let fraction = ((nanos << 32) + 500_000_000) / 1_000_000_000;

        NtpTimestamp((seconds << 32) | fraction)
    }

    /// Instant UTC correspondant, en supposant l'ère 0 (1900-2036)
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let unix_seconds = self.seconds() as i64 - NTP_UNIX_OFFSET;
        let nanos = ((self.fraction() as u64 * 1_000_000_000) + (1 << 31)) >> 32;
        DateTime::from_timestamp(unix_seconds, nanos as u32)
    }

    /// Retourne la partie secondes du timestamp
    pub fn seconds(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Retourne la partie fraction du timestamp
    pub fn fraction(&self) -> u32 {
        self.0 as u32
    }
}

/// Structure du paquet NTP (48 octets)
/// Tous les champs multi-octets sont en big-endian (network byte order)
#[derive(Debug, Clone, Copy)]
pub struct NtpPacket {
    // Octet 0
    pub leap_indicator: LeapIndicator,
    pub version: u8,
    pub mode: NtpMode,

    // Octet 1-3
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,

    // Octets 4-7 (16.16 virgule fixe)
    pub root_delay: u32,

    // Octets 8-11 (16.16 virgule fixe)
    pub root_dispersion: u32,

    // Octets 12-15
    pub reference_identifier: [u8; 4],

    // Octets 16-23
    pub reference_timestamp: NtpTimestamp,

    // Octets 24-31
    pub originate_timestamp: NtpTimestamp,

    // Octets 32-39
    pub receive_timestamp: NtpTimestamp,

    // Octets 40-47
    pub transmit_timestamp: NtpTimestamp,
}

impl NtpPacket {
    /// Taille du paquet NTP en octets
    pub const SIZE: usize = 48;

    /// Parse l'en-tête de 48 octets ; les octets suivants (extensions) sont ignorés
    ///
    /// Aucun champ n'est validé : seul le serveur décide quoi faire de la version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NtpError> {
        if bytes.len() < Self::SIZE {
            return Err(NtpError::RequestTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }

        // Octet 0: LI (2 bits) + VN (3 bits) + Mode (3 bits)
        let li_vn_mode = bytes[0];

        Ok(NtpPacket {
            leap_indicator: LeapIndicator::from(li_vn_mode >> 6),
            version: (li_vn_mode >> 3) & 0x07,
            mode: NtpMode::from(li_vn_mode),
            stratum: bytes[1],
            poll: bytes[2] as i8,
            precision: bytes[3] as i8,
            root_delay: read_u32(bytes, 4),
            root_dispersion: read_u32(bytes, 8),
            reference_identifier: [bytes[12], bytes[13], bytes[14], bytes[15]],
            reference_timestamp: NtpTimestamp(read_u64(bytes, 16)),
            originate_timestamp: NtpTimestamp(read_u64(bytes, 24)),
            receive_timestamp: NtpTimestamp(read_u64(bytes, 32)),
            transmit_timestamp: NtpTimestamp(read_u64(bytes, 40)),
        })
    }

    /// Convertit le paquet en bytes pour transmission (big-endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];

        bytes[0] = ((self.leap_indicator as u8) << 6)
            | ((self.version & 0x07) << 3)
            | (self.mode as u8 & 0x07);
        bytes[1] = self.stratum;
        bytes[2] = self.poll as u8;
        bytes[3] = self.precision as u8;

        bytes[4..8].copy_from_slice(&self.root_delay.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.root_dispersion.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.reference_identifier);
        bytes[16..24].copy_from_slice(&self.reference_timestamp.0.to_be_bytes());
        bytes[24..32].copy_from_slice(&self.originate_timestamp.0.to_be_bytes());
        bytes[32..40].copy_from_slice(&self.receive_timestamp.0.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.transmit_timestamp.0.to_be_bytes());

        bytes
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(word)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_be_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_from_datetime() {
        let unix_epoch = Utc.timestamp_opt(0, 0).unwrap();
        let ts = NtpTimestamp::from_datetime(unix_epoch);
        assert_eq!(ts.seconds(), 2_208_988_800);
        assert_eq!(ts.fraction(), 0);

        let half = Utc.timestamp_opt(0, 500_000_000).unwrap();
        assert_eq!(NtpTimestamp::from_datetime(half).fraction(), 1 << 31);

        // 1 µs = 4294.967296 → arrondi à 4295
        let micro = Utc.timestamp_opt(0, 1_000).unwrap();
        assert_eq!(NtpTimestamp::from_datetime(micro).fraction(), 4295);

        let last_nano = Utc.timestamp_opt(0, 999_999_999).unwrap();
        assert_eq!(NtpTimestamp::from_datetime(last_nano).seconds(), 2_208_988_800);
    }

    #[test]
    fn test_timestamp_era_wrap() {
        // 2036-02-07T06:28:16Z = début de l'ère 1
        let era_one = Utc.with_ymd_and_hms(2036, 2, 7, 6, 28, 16).unwrap();
        assert_eq!(NtpTimestamp::from_datetime(era_one).seconds(), 0);

        let ntp_epoch = Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(NtpTimestamp::from_datetime(ntp_epoch).0, 0);
    }

    #[test]
    fn test_timestamp_to_datetime() {
        let instant = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
            + chrono::TimeDelta::microseconds(250_123);
        let ts = NtpTimestamp::from_datetime(instant);
        assert_eq!(ts.to_datetime(), Some(instant));
    }

    #[test]
    fn test_packet_layout() {
        let packet = NtpPacket {
            leap_indicator: LeapIndicator::AlarmCondition,
            version: 3,
            mode: NtpMode::Server,
            stratum: 16,
            poll: 6,
            precision: -20,
            root_delay: 0,
            root_dispersion: 0x21,
            reference_identifier: *b"GPS\0",
            reference_timestamp: NtpTimestamp(1),
            originate_timestamp: NtpTimestamp(2),
            receive_timestamp: NtpTimestamp(3),
            transmit_timestamp: NtpTimestamp(0x0102_0304_0506_0708),
        };
        let bytes = packet.to_bytes();

        assert_eq!(bytes[0], 0b11_011_100);
        assert_eq!(bytes[1], 16);
        assert_eq!(bytes[3], 0xEC);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0x21]);
        assert_eq!(&bytes[12..16], b"GPS\0");
        assert_eq!(&bytes[40..48], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let parsed = NtpPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.leap_indicator, LeapIndicator::AlarmCondition);
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.mode, NtpMode::Server);
        assert_eq!(parsed.precision, -20);
        assert_eq!(parsed.transmit_timestamp, packet.transmit_timestamp);
    }

    #[test]
    fn test_packet_too_short() {
        assert_eq!(
            NtpPacket::from_bytes(&[0u8; 47]).unwrap_err(),
            NtpError::RequestTooShort { expected: 48, actual: 47 }
        );
    }
}
