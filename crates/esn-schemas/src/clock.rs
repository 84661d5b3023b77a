//! Injected wall clock.
//!
//! Every time comparison in the core goes through this trait so tests can
//! drive a manual clock (see `esn-testkit`). All instants are UTC.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
