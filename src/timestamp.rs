// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fixed-point replica timestamps.
//!
//! Timestamps are stored as a count of 10µs ticks since the Unix epoch and
//! rendered in the internal `NNNNNNNNNN.NNNNN` form (ten integer digits, five
//! fractional digits). The fixed width keeps string and numeric ordering in
//! agreement, which matters because replicas compare timestamps as strings on
//! the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const TICKS_PER_SECOND: i64 = 100_000;

/// A replica timestamp with 10µs resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(i64);

impl Timestamp {
    /// The zero timestamp (`0000000000.00000`).
    pub const ZERO: Timestamp = Timestamp(0);

    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = chrono::Utc::now().timestamp_micros();
        Self(micros / 10)
    }

    /// Build from whole seconds.
    pub fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(TICKS_PER_SECOND))
    }

    /// Build from raw 10µs ticks.
    pub fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Raw 10µs ticks.
    pub fn ticks(&self) -> i64 {
        self.0
    }

    /// Whole seconds (truncated).
    pub fn as_secs(&self) -> i64 {
        self.0 / TICKS_PER_SECOND
    }

    /// Internal string form.
    pub fn internal(&self) -> String {
        format!(
            "{:010}.{:05}",
            self.0 / TICKS_PER_SECOND,
            self.0 % TICKS_PER_SECOND
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.internal())
    }
}

/// Error returned when a timestamp string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid timestamp: {0:?}")]
pub struct InvalidTimestamp(pub String);

impl FromStr for Timestamp {
    type Err = InvalidTimestamp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTimestamp(s.to_string());
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let secs: i64 = whole.parse().map_err(|_| invalid())?;

        // Pad or truncate the fraction to exactly five digits
        let mut digits: String = frac.chars().take(5).collect();
        while digits.len() < 5 {
            digits.push('0');
        }
        let frac_ticks: i64 = digits.parse().map_err(|_| invalid())?;

        secs.checked_mul(TICKS_PER_SECOND)
            .and_then(|t| t.checked_add(frac_ticks))
            .map(Timestamp)
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = InvalidTimestamp;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.internal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_format() {
        assert_eq!(Timestamp::ZERO.internal(), "0000000000.00000");
        assert_eq!(Timestamp::from_secs(1_700_000_000).internal(), "1700000000.00000");
        assert_eq!(Timestamp::from_ticks(170_000_000_012_345).internal(), "1700000000.12345");
    }

    #[test]
    fn test_parse_variants() {
        let cases = [
            ("1700000000.12345", 170_000_000_012_345),
            ("1700000000.1", 170_000_000_010_000),
            ("1700000000", 170_000_000_000_000),
            ("0000000001.00000", 100_000),
            ("12.123456789", 1_212_345),
        ];
        for (input, ticks) in cases {
            let ts: Timestamp = input.parse().unwrap();
            assert_eq!(ts.ticks(), ticks, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for input in ["", "abc", "-1.0", "1.2.3", ".5", "1e9"] {
            assert!(input.parse::<Timestamp>().is_err(), "accepted {:?}", input);
        }
    }

    #[test]
    fn test_ordering_matches_string_ordering() {
        let a = Timestamp::from_secs(5);
        let b = Timestamp::from_secs(1_000_000);
        assert!(a < b);
        assert!(a.internal() < b.internal());
    }

    #[test]
    fn test_serde_as_string() {
        let ts = Timestamp::from_secs(42);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"0000000042.00000\"");
        let parsed: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn test_now_is_after_2020() {
        assert!(Timestamp::now().as_secs() > 1_577_836_800);
    }
}
