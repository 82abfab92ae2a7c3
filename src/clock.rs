use crate::nmea::DecodedFix;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Longueur maximale conservée pour la dernière trame (diagnostic)
const MAX_SENTENCE_CHARS: usize = 240;

/// Trait pour les sources d'horloge servies aux clients
pub trait ClockSource: Send + Sync {
    /// Lecture atomique de l'état complet + heure courante
    fn snapshot(&self) -> ClockSnapshot;

    /// Heure courante seule (chemin rapide, par paquet)
    fn now(&self) -> DateTime<Utc> {
        self.snapshot().now
    }
}

/// Base de temps : tick monotone + horloge murale de secours
pub trait TickSource: Send + Sync {
    /// Temps écoulé depuis une origine fixe, insensible aux sauts d'horloge
    fn monotonic(&self) -> Duration;

    /// Horloge système, utilisée tant qu'aucun fix n'a été accepté
    fn wall_clock(&self) -> DateTime<Utc>;
}

/// Ticks système : `Instant` pour le monotone, CLOCK_REALTIME pour l'horloge murale
pub struct SystemTicks {
    origin: Instant,
}

impl SystemTicks {
    pub fn new() -> Self {
        SystemTicks {
            origin: Instant::now(),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn precise_wall_clock() -> DateTime<Utc> {
        use libc::{clock_gettime, timespec, CLOCK_REALTIME};
        use std::mem::MaybeUninit;

        let mut ts = MaybeUninit::<timespec>::uninit();
        // SAFETY: clock_gettime initialise `ts` quand il retourne 0
        let now = unsafe {
            if clock_gettime(CLOCK_REALTIME, ts.as_mut_ptr()) == 0 {
                let ts = ts.assume_init();
                DateTime::from_timestamp(ts.tv_sec as i64, ts.tv_nsec as u32)
            } else {
                None
            }
        };

        now.unwrap_or_else(Utc::now)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn precise_wall_clock() -> DateTime<Utc> {
        Utc::now()
    }
}

impl Default for SystemTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SystemTicks {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Self::precise_wall_clock()
    }
}

/// Vue cohérente de l'horloge à un instant donné
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClockSnapshot {
    pub now: DateTime<Utc>,
    pub valid: bool,
    pub last_fix: Option<DateTime<Utc>>,
    pub last_sentence: Option<String>,
}

/// Ancrage GPS : présent si et seulement si un fix valide a été accepté
#[derive(Debug, Clone, Copy)]
struct Anchor {
    /// Instant UTC correspondant au tick monotone zéro (fix − tick)
    origin: DateTime<Utc>,

    /// Instant UTC du dernier fix accepté
    fix: DateTime<Utc>,

    /// Tick monotone au moment de l'acceptation
    fix_tick: Duration,
}

#[derive(Debug, Default)]
struct ClockState {
    anchor: Option<Anchor>,
    valid: bool,
    last_sentence: Option<String>,
}

/// Horloge disciplinée par les fix GPS
///
/// Entre deux fix, l'heure avance avec le tick monotone et non avec l'horloge
/// système : un saut ou une dérive de l'horloge locale ne déplace pas la
/// seconde GPS. Sans aucun fix, l'horloge suit l'horloge système.
///
/// Tout l'état vit sous un seul verrou : un lecteur voit l'état d'avant ou
/// d'après un `update`, jamais un mélange.
pub struct DisciplinedClock<T: TickSource = SystemTicks> {
    state: RwLock<ClockState>,
    ticks: T,
    holdover: Option<Duration>,
}

impl DisciplinedClock<SystemTicks> {
    pub fn new(holdover: Option<Duration>) -> Self {
        Self::with_ticks(SystemTicks::new(), holdover)
    }
}

impl<T: TickSource> DisciplinedClock<T> {
    pub fn with_ticks(ticks: T, holdover: Option<Duration>) -> Self {
        DisciplinedClock {
            state: RwLock::new(ClockState::default()),
            ticks,
            holdover,
        }
    }

    /// Applique un fix décodé
    ///
    /// Un fix valide ré-ancre l'horloge ; un fix invalide ne fait que lever la
    /// validité, l'horloge continue sur le dernier ancrage.
    pub fn update(&self, fix: &DecodedFix) {
        let mut state = self.write();

        if fix.valid {
            let fix_tick = self.ticks.monotonic();
            state.anchor = Some(Anchor {
                origin: fix.utc - tick_delta(fix_tick),
                fix: fix.utc,
                fix_tick,
            });
        }
        state.valid = fix.valid;
    }

    /// Conserve une copie tronquée de la dernière trame reçue
    pub fn note_sentence(&self, text: &str) {
        let truncated: String = text.chars().take(MAX_SENTENCE_CHARS).collect();
        self.write().last_sentence = Some(truncated);
    }

    fn current_time(&self, anchor: Option<&Anchor>, tick: Duration) -> DateTime<Utc> {
        anchor
            .and_then(|anchor| anchor.origin.checked_add_signed(tick_delta(tick)))
            .unwrap_or_else(|| self.ticks.wall_clock())
    }

    fn is_valid(&self, state: &ClockState, tick: Duration) -> bool {
        match (self.holdover, state.anchor.as_ref()) {
            (Some(holdover), Some(anchor)) => {
                state.valid && tick.saturating_sub(anchor.fix_tick) <= holdover
            }
            _ => state.valid,
        }
    }

    // Un verrou empoisonné contient toujours un état complet : on le récupère
    fn read(&self) -> RwLockReadGuard<'_, ClockState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ClockState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: TickSource> ClockSource for DisciplinedClock<T> {
    fn snapshot(&self) -> ClockSnapshot {
        let state = self.read();
        let tick = self.ticks.monotonic();

        ClockSnapshot {
            now: self.current_time(state.anchor.as_ref(), tick),
            valid: self.is_valid(&state, tick),
            last_fix: state.anchor.map(|anchor| anchor.fix),
            last_sentence: state.last_sentence.clone(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let state = self.read();
        self.current_time(state.anchor.as_ref(), self.ticks.monotonic())
    }
}

fn tick_delta(tick: Duration) -> TimeDelta {
    TimeDelta::nanoseconds(tick.as_nanos().min(i64::MAX as u128) as i64)
}
