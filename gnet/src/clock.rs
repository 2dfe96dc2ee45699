// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Wall-clock time at second resolution, and periodic cadences.
//!
//! The event core is clocked externally: the embedder calls
//! [`crate::core::Core::tick`] once per second and passes the current
//! [`Timestamp`] into every time-dependent operation, which keeps the whole
//! core deterministic under test.

use std::{
    fmt::{self, Display},
    ops::{Add, Sub},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

/// On-disk timestamp format: `2021-07-23 14:53:02` (UTC).
const DATE_FORMAT: &str = "%F %T";

/// Seconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_unix(secs: i64) -> Self {
        Self(secs)
    }

    pub fn as_unix(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self(secs)
    }

    /// Render as a UTC date string in the host-file format.
    pub fn to_utc_string(self) -> String {
        time::OffsetDateTime::from_unix_timestamp(self.0).format(DATE_FORMAT)
    }

    /// Parse a UTC date string in the host-file format.
    pub fn parse_utc(s: &str) -> Result<Self, ParseTimestampError> {
        let dt = time::PrimitiveDateTime::parse(s, DATE_FORMAT)?;
        Ok(Self(dt.assume_utc().unix_timestamp()))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_utc_string())
    }
}

impl Add<i64> for Timestamp {
    type Output = Self;

    fn add(self, secs: i64) -> Self {
        Self(self.0.saturating_add(secs))
    }
}

impl Sub<i64> for Timestamp {
    type Output = Self;

    fn sub(self, secs: i64) -> Self {
        Self(self.0.saturating_sub(secs))
    }
}

impl Sub for Timestamp {
    type Output = i64;

    /// Seconds elapsed between `rhs` and `self`.
    fn sub(self, rhs: Self) -> i64 {
        self.0.saturating_sub(rhs.0)
    }
}

#[derive(Debug, Error)]
#[error("malformed timestamp")]
pub struct ParseTimestampError(#[from] time::ParseError);

/// A cadence over a one-second tick: fires every `period` calls.
#[derive(Clone, Copy, Debug)]
pub struct Every {
    period: u32,
    elapsed: u32,
}

impl Every {
    pub fn new(period: u32) -> Self {
        assert!(period > 0, "a cadence needs a non-zero period");
        Self { period, elapsed: 0 }
    }

    /// Advance by one tick; `true` when the period boundary is reached.
    pub fn ready(&mut self) -> bool {
        self.elapsed += 1;
        if self.elapsed >= self.period {
            self.elapsed = 0;
            true
        } else {
            false
        }
    }
}
