//! Position acquisition: observations, failures and the cached fallback

use crate::storage::CachedPosition;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    get_timestamp, CACHED_POSITION_ACCURACY, CACHED_POSITION_MAX_AGE, MAX_ACCEPTABLE_ACCURACY,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// One position fix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub latitude: f64,
    pub longitude: f64,
    /// Radius of uncertainty in meters
    pub accuracy: f64,
    pub timestamp: u64,
}

impl Observation {
    /// Fixes worse than the sanity threshold are never shared
    pub fn is_acceptable(&self) -> bool {
        self.accuracy <= MAX_ACCEPTABLE_ACCURACY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PositionError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location unavailable")]
    Unavailable,
    #[error("location request timed out")]
    Timeout,
    #[error("unknown location error")]
    Unknown,
}

impl PositionError {
    /// Timeouts are expected now and then and are not worth a notice
    pub fn is_transient(&self) -> bool {
        matches!(self, PositionError::Timeout)
    }

    pub fn user_message(&self) -> String {
        let hint = match self {
            PositionError::PermissionDenied => {
                "Please enable location services and restart the client."
            }
            PositionError::Unavailable => {
                "Location information is unavailable. Try moving to an area with better GPS coverage."
            }
            PositionError::Timeout => {
                "Location request timed out. Try again or move to an area with better GPS signal."
            }
            PositionError::Unknown => "An unknown error occurred. Please restart and try again.",
        };
        format!("Unable to get your location. {}", hint)
    }
}

pub type PositionUpdate = Result<Observation, PositionError>;

/// Substitutes a cached position when live acquisition fails
///
/// Only caches younger than 24 hours qualify; the result carries a fixed,
/// pessimistic accuracy.
pub fn cached_fallback(cache: Option<&CachedPosition>, now: u64) -> Option<Observation> {
    let cache = cache?;
    let max_age = CACHED_POSITION_MAX_AGE.as_millis() as u64;
    if now.saturating_sub(cache.timestamp) >= max_age {
        return None;
    }

    Some(Observation {
        latitude: cache.latitude,
        longitude: cache.longitude,
        accuracy: CACHED_POSITION_ACCURACY,
        timestamp: now,
    })
}

/// Anything that can be asked for the next position fix
pub trait PositionSource: Send + 'static {
    fn next_update(&mut self) -> PositionUpdate;
}

/// Random walk around a starting point, with the occasional bad fix
pub struct SimulatedSource {
    latitude: f64,
    longitude: f64,
    rng: StdRng,
}

impl SimulatedSource {
    const STEP_DEGREES: f64 = 0.0001;
    const POOR_FIX_CHANCE: f64 = 0.05;
    const TIMEOUT_CHANCE: f64 = 0.02;

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self::with_rng(latitude, longitude, StdRng::from_entropy())
    }

    pub fn seeded(latitude: f64, longitude: f64, seed: u64) -> Self {
        Self::with_rng(latitude, longitude, StdRng::seed_from_u64(seed))
    }

    fn with_rng(latitude: f64, longitude: f64, rng: StdRng) -> Self {
        Self {
            latitude,
            longitude,
            rng,
        }
    }
}

impl PositionSource for SimulatedSource {
    fn next_update(&mut self) -> PositionUpdate {
        if self.rng.gen_bool(Self::TIMEOUT_CHANCE) {
            return Err(PositionError::Timeout);
        }

        self.latitude = (self.latitude
            + self.rng.gen_range(-Self::STEP_DEGREES..=Self::STEP_DEGREES))
        .clamp(-90.0, 90.0);
        self.longitude += self.rng.gen_range(-Self::STEP_DEGREES..=Self::STEP_DEGREES);
        if self.longitude > 180.0 {
            self.longitude -= 360.0;
        } else if self.longitude < -180.0 {
            self.longitude += 360.0;
        }

        let accuracy = if self.rng.gen_bool(Self::POOR_FIX_CHANCE) {
            self.rng.gen_range(1000.5..3000.0)
        } else {
            self.rng.gen_range(5.0..50.0)
        };

        Ok(Observation {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy,
            timestamp: get_timestamp(),
        })
    }
}

/// Polls `source` every `period` and pushes each result to the returned receiver
///
/// The first update is delivered immediately. The task ends once the receiver
/// is dropped, so tearing down the client stops all further observations.
pub fn spawn_watch<S: PositionSource>(
    mut source: S,
    period: Duration,
) -> (mpsc::UnboundedReceiver<PositionUpdate>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if tx.send(source.next_update()).is_err() {
                debug!("Position watcher stopped");
                break;
            }
        }
    });

    (rx, handle)
}
