// src/clock.rs
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex, PoisonError};

pub trait Clock: Send + Sync {
    /// Current instant in the configured timezone.
    fn now(&self) -> DateTime<Tz>;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }
}

/// Manually driven clock for deterministic runs.
#[derive(Clone)]
pub struct TestClock {
    current_time: Arc<Mutex<DateTime<Tz>>>,
}

impl TestClock {
    pub fn new(start: DateTime<Tz>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set_time(&self, time: DateTime<Tz>) {
        *self.current_time.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }

    pub fn advance(&self, duration: Duration) {
        *self.current_time.lock().unwrap_or_else(PoisonError::into_inner) += duration;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Tz> {
        *self.current_time.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
