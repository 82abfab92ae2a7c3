/*!
Décodage des trames NMEA 0183 porteuses de temps

Seules deux trames alimentent l'horloge :
- **RMC** : Recommended Minimum data (heure, statut A/V, date `ddmmyy`)
- **ZDA** : Date & Time (heure, jour, mois, année sur 4 chiffres)

Le talker ID n'est pas vérifié (`$GPRMC`, `$GNRMC`, `$GLZDA`... sont tous acceptés).
Le flux TCP peut multiplexer du trafic AIS (`!AIVDM`, `$--VDM`, `$--VDO`) :
ces trames ressemblent aux trames de temps mais sont écartées dès la classification.

Format typique d'une trame RMC :
```text
$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A
       hhmmss status                                  ddmmyy
```

Toutes les fonctions sont pures : la configuration (`require_checksum`) est passée
explicitement à chaque appel.
*/

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

/// Nombre minimal de champs d'une trame RMC (jusqu'à la date incluse)
const RMC_MIN_FIELDS: usize = 10;

/// Nombre minimal de champs d'une trame ZDA (jusqu'à l'année incluse)
const ZDA_MIN_FIELDS: usize = 5;

/// Résolution de la partie fractionnaire des secondes (microsecondes)
const FRACTION_DIGITS: usize = 6;

/// Erreurs de décodage d'une trame de temps
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Not a time-bearing sentence")]
    NotTimeSentence,

    #[error("Checksum missing or mismatched")]
    ChecksumMismatch,

    #[error("Not enough fields: expected at least {expected}, got {actual}")]
    FieldCountInsufficient { expected: usize, actual: usize },

    #[error("Malformed time field: {0:?}")]
    TimeFieldMalformed(String),

    #[error("Malformed date field: {0:?}")]
    DateFieldMalformed(String),

    #[error("Calendar value out of range")]
    CalendarConstructionFailed,
}

/// Type de trame déterminé par `classify`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceKind {
    Rmc,
    Zda,
    /// Ligne vide ou trafic AIS
    Ignored,
    Unrecognized,
}

/// Résultat d'une trame de temps décodée
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFix {
    /// Instant UTC porté par la trame (résolution microseconde)
    pub utc: DateTime<Utc>,

    /// Statut `A` pour RMC ; toujours vrai pour ZDA
    pub valid: bool,

    /// Checksum présent et correct (signal faible, compté par l'appelant)
    pub checksum_ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimeOfDay {
    hour: u32,
    minute: u32,
    second: u32,
    micros: u32,
}

/// Retire le bruit éventuel précédant le marqueur `$` ou `!`
pub fn strip_noise(line: &str) -> &str {
    match line.find(|c: char| c == '$' || c == '!') {
        Some(pos) => &line[pos..],
        None => line,
    }
}

/// Classe une ligne brute sans jamais échouer
pub fn classify(line: &str) -> SentenceKind {
    let bytes = line.trim().as_bytes();

    if bytes.is_empty() {
        return SentenceKind::Ignored;
    }

    if starts_with_ignore_case(bytes, b"!AIVDM") || starts_with_ignore_case(bytes, b"!AIVDO") {
        return SentenceKind::Ignored;
    }

    if bytes[0] != b'$' {
        return SentenceKind::Unrecognized;
    }

    // Caractères 4 à 6 : code de la trame, après le talker ID
    let Some(code) = bytes.get(3..6) else {
        return SentenceKind::Unrecognized;
    };

    if code.eq_ignore_ascii_case(b"VDM") || code.eq_ignore_ascii_case(b"VDO") {
        return SentenceKind::Ignored;
    }

    if bytes.get(6) != Some(&b',') {
        return SentenceKind::Unrecognized;
    }

    if code.eq_ignore_ascii_case(b"RMC") {
        SentenceKind::Rmc
    } else if code.eq_ignore_ascii_case(b"ZDA") {
        SentenceKind::Zda
    } else {
        SentenceKind::Unrecognized
    }
}

/// XOR de tous les octets de la charge utile
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, byte| acc ^ byte)
}

/// Vérifie le checksum `*hh` entre le premier marqueur et le dernier `*`
///
/// Le texte qui précède le marqueur est ignoré. Un checksum absent est un échec.
pub fn checksum_ok(line: &str) -> bool {
    let bytes = line.as_bytes();

    let Some(start) = bytes.iter().position(|&b| b == b'$' || b == b'!') else {
        return false;
    };
    let Some(star) = bytes.iter().rposition(|&b| b == b'*') else {
        return false;
    };
    if star <= start {
        return false;
    }

    match bytes.get(star + 1..star + 3).and_then(parse_hex_byte) {
        Some(expected) => checksum(&bytes[start + 1..star]) == expected,
        None => false,
    }
}

/// Décode une trame RMC ou ZDA en instant UTC
///
/// ZDA n'a pas de champ de statut : le fix est toujours marqué valide, même si
/// le récepteur n'a pas encore de position. À borner via `clock.holdover_secs`.
pub fn decode(line: &str, require_checksum: bool) -> Result<DecodedFix, DecodeError> {
    let sentence = strip_noise(line.trim());
    let kind = classify(sentence);

    if !matches!(kind, SentenceKind::Rmc | SentenceKind::Zda) {
        return Err(DecodeError::NotTimeSentence);
    }

    let checksum_ok = checksum_ok(sentence);
    if require_checksum && !checksum_ok {
        return Err(DecodeError::ChecksumMismatch);
    }

    let body = match sentence.find('*') {
        Some(pos) => &sentence[..pos],
        None => sentence,
    };
    let fields: Vec<&str> = body.split(',').map(str::trim).collect();

    let (utc, valid) = match kind {
        SentenceKind::Rmc => decode_rmc(&fields)?,
        SentenceKind::Zda => decode_zda(&fields)?,
        SentenceKind::Ignored | SentenceKind::Unrecognized => {
            return Err(DecodeError::NotTimeSentence)
        }
    };

    Ok(DecodedFix {
        utc,
        valid,
        checksum_ok,
    })
}

/// Pivot des années RMC sur 2 chiffres : 00-79 → 20xx, 80-99 → 19xx
pub fn expand_two_digit_year(yy: u32) -> i32 {
    if yy <= 79 {
        2000 + yy as i32
    } else {
        1900 + yy as i32
    }
}

fn decode_rmc(fields: &[&str]) -> Result<(DateTime<Utc>, bool), DecodeError> {
    require_fields(fields, RMC_MIN_FIELDS)?;

    let time = parse_time(fields[1])?;
    let valid = fields[2].eq_ignore_ascii_case("A");

    let date = fields[9];
    let malformed = || DecodeError::DateFieldMalformed(date.to_string());
    let digits = date.as_bytes();
    if digits.len() != 6 {
        return Err(malformed());
    }
    let day = two_digits(&digits[0..2]).ok_or_else(malformed)?;
    let month = two_digits(&digits[2..4]).ok_or_else(malformed)?;
    let year = expand_two_digit_year(two_digits(&digits[4..6]).ok_or_else(malformed)?);

    Ok((build_instant(year, month, day, time)?, valid))
}

// ZDA n'a pas de champ de statut : la trame est toujours considérée valide.
fn decode_zda(fields: &[&str]) -> Result<(DateTime<Utc>, bool), DecodeError> {
    require_fields(fields, ZDA_MIN_FIELDS)?;

    let time = parse_time(fields[1])?;
    let day = parse_number(fields[2], 1..=2)?;
    let month = parse_number(fields[3], 1..=2)?;
    let year = parse_number(fields[4], 4..=4)? as i32;

    Ok((build_instant(year, month, day, time)?, true))
}

fn require_fields(fields: &[&str], expected: usize) -> Result<(), DecodeError> {
    if fields.len() < expected {
        return Err(DecodeError::FieldCountInsufficient {
            expected,
            actual: fields.len(),
        });
    }
    Ok(())
}

/// Parse `hhmmss[.fraction]`, fraction tronquée ou complétée à 6 chiffres
fn parse_time(field: &str) -> Result<TimeOfDay, DecodeError> {
    let malformed = || DecodeError::TimeFieldMalformed(field.to_string());
    let bytes = field.as_bytes();

    if bytes.len() < 6 {
        return Err(malformed());
    }

    let hour = two_digits(&bytes[0..2]).ok_or_else(malformed)?;
    let minute = two_digits(&bytes[2..4]).ok_or_else(malformed)?;
    let second = two_digits(&bytes[4..6]).ok_or_else(malformed)?;

    let micros = match &bytes[6..] {
        [] => 0,
        [b'.', fraction @ ..] => {
            if !fraction.iter().all(u8::is_ascii_digit) {
                return Err(malformed());
            }
            (0..FRACTION_DIGITS).fold(0u32, |acc, i| {
                let digit = fraction.get(i).map_or(0, |d| (d - b'0') as u32);
                acc * 10 + digit
            })
        }
        _ => return Err(malformed()),
    };

    Ok(TimeOfDay {
        hour,
        minute,
        second,
        micros,
    })
}

fn parse_number(field: &str, len: std::ops::RangeInclusive<usize>) -> Result<u32, DecodeError> {
    let malformed = || DecodeError::DateFieldMalformed(field.to_string());
    if !len.contains(&field.len()) || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    field.parse().map_err(|_| malformed())
}

fn build_instant(
    year: i32,
    month: u32,
    day: u32,
    time: TimeOfDay,
) -> Result<DateTime<Utc>, DecodeError> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| {
            date.and_hms_micro_opt(time.hour, time.minute, time.second, time.micros)
        })
        .map(|naive| naive.and_utc())
        .ok_or(DecodeError::CalendarConstructionFailed)
}

fn two_digits(bytes: &[u8]) -> Option<u32> {
    match bytes {
        [tens, units] if tens.is_ascii_digit() && units.is_ascii_digit() => {
            Some(((tens - b'0') * 10 + (units - b'0')) as u32)
        }
        _ => None,
    }
}

fn parse_hex_byte(digits: &[u8]) -> Option<u8> {
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u8::from_str_radix(std::str::from_utf8(digits).ok()?, 16).ok()
}

fn starts_with_ignore_case(bytes: &[u8], prefix: &[u8]) -> bool {
    bytes
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
