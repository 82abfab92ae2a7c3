use crate::clock::ClockSource;
use crate::packet::{LeapIndicator, NtpError, NtpMode, NtpPacket, NtpTimestamp};
use chrono::{DateTime, Utc};

/// Poll annoncé si la requête n'en fournit pas (log2 secondes)
pub const DEFAULT_POLL: i8 = 6;

/// Précision annoncée : 2^-20 s ≈ 1 µs
pub const PRECISION: i8 = -20;

/// Root dispersion ≈ 0.5 ms en virgule fixe 16.16 (0.0005 × 65536 arrondi)
pub const ROOT_DISPERSION: u32 = 33;

/// Identifiant de référence d'une source GPS (stratum 1)
pub const REFERENCE_ID: [u8; 4] = *b"GPS\0";

const STRATUM_SYNCED: u8 = 1;
const STRATUM_UNSYNCHRONIZED: u8 = 16;

/// Construit la réponse serveur à une requête NTP
///
/// `received_at` doit être capturé au moment de la lecture du socket.
/// Une requête de moins de 48 octets ne reçoit aucune réponse : l'appelant
/// abandonne silencieusement.
pub fn build_response<C: ClockSource + ?Sized>(
    request: &[u8],
    received_at: DateTime<Utc>,
    clock: &C,
) -> Result<[u8; NtpPacket::SIZE], NtpError> {
    let parsed = NtpPacket::from_bytes(request)?;
    let snapshot = clock.snapshot();

    // Versions inconnues : on répond en NTPv4
    let version = match parsed.version {
        3 | 4 => parsed.version,
        _ => 4,
    };

    let (leap_indicator, stratum) = if snapshot.valid {
        (LeapIndicator::NoWarning, STRATUM_SYNCED)
    } else {
        (LeapIndicator::AlarmCondition, STRATUM_UNSYNCHRONIZED)
    };

    let mut response = NtpPacket {
        leap_indicator,
        version,
        mode: NtpMode::Server,
        stratum,
        poll: request.get(2).map_or(DEFAULT_POLL, |&poll| poll as i8),
        precision: PRECISION,
        root_delay: 0,
        root_dispersion: ROOT_DISPERSION,
        reference_identifier: REFERENCE_ID,
        reference_timestamp: NtpTimestamp::from_datetime(snapshot.last_fix.unwrap_or(snapshot.now)),
        // T1 : transmit timestamp du client, recopié tel quel
        originate_timestamp: parsed.transmit_timestamp,
        // T2
        receive_timestamp: NtpTimestamp::from_datetime(received_at),
        transmit_timestamp: NtpTimestamp::default(),
    };

    // T3 : lu le plus tard possible avant l'envoi
    response.transmit_timestamp = NtpTimestamp::from_datetime(clock.now());

    Ok(response.to_bytes())
}
