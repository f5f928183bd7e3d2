//! Debounce window source
//!
//! The debounce window follows the platform animation duration, which the
//! user can scale at runtime. It is read on every use, never cached.

use std::time::Duration;
use tracing::warn;

/// Environment variable carrying the runtime animation scale
pub const ANIMATION_SCALE_ENV: &str = "BIOGATE_ANIMATION_SCALE";

/// Source of the debounce window
pub trait DebounceTiming: Send + Sync {
    /// Current debounce window
    fn debounce_window(&self) -> Duration;
}

/// Base animation duration scaled by the runtime animation scale
#[derive(Debug, Clone)]
pub struct AnimationTiming {
    base: Duration,
}

impl AnimationTiming {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }
}

impl DebounceTiming for AnimationTiming {
    fn debounce_window(&self) -> Duration {
        let raw = std::env::var(ANIMATION_SCALE_ENV).ok();
        scale_duration(self.base, raw.as_deref())
    }
}

/// Fixed window, for tests and hosts without an animation setting
#[derive(Debug, Clone, Copy)]
pub struct FixedTiming(pub Duration);

impl DebounceTiming for FixedTiming {
    fn debounce_window(&self) -> Duration {
        self.0
    }
}

/// Apply a textual scale factor; missing, negative, garbage or overflowing means 1.0
fn scale_duration(base: Duration, raw_scale: Option<&str>) -> Duration {
    let Some(raw) = raw_scale else {
        return base;
    };
    let scale = match raw.trim().parse::<f64>() {
        Ok(scale) if scale.is_finite() && scale >= 0.0 => scale,
        _ => {
            warn!("Ignoring invalid {} value {:?}", ANIMATION_SCALE_ENV, raw);
            return base;
        }
    };
    match Duration::try_from_secs_f64(base.as_secs_f64() * scale) {
        Ok(scaled) => scaled,
        Err(_) => {
            warn!("{} value {:?} overflows the debounce window", ANIMATION_SCALE_ENV, raw);
            base
        }
    }
}
