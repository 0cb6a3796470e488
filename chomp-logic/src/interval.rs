use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Scheduling interval vocabulary. Tags follow ISO 8601 capitalization:
/// lowercase for sub-day units, uppercase for day and above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Interval {
    s2,
    s5,
    s10,
    s20,
    s30,
    m1,
    m2,
    m5,
    m10,
    m15,
    m30,
    h1,
    h4,
    h6,
    h12,
    D1,
    D2,
    D3,
    W1,
    M1,
    Y1,
}

pub const ALL_INTERVALS: [Interval; 21] = [
    Interval::s2,
    Interval::s5,
    Interval::s10,
    Interval::s20,
    Interval::s30,
    Interval::m1,
    Interval::m2,
    Interval::m5,
    Interval::m10,
    Interval::m15,
    Interval::m30,
    Interval::h1,
    Interval::h4,
    Interval::h6,
    Interval::h12,
    Interval::D1,
    Interval::D2,
    Interval::D3,
    Interval::W1,
    Interval::M1,
    Interval::Y1,
];

impl Interval {
    pub fn seconds(self) -> u64 {
        match self {
            Interval::s2 => 2,
            Interval::s5 => 5,
            Interval::s10 => 10,
            Interval::s20 => 20,
            Interval::s30 => 30,
            Interval::m1 => 60,
            Interval::m2 => 120,
            Interval::m5 => 300,
            Interval::m10 => 600,
            Interval::m15 => 900,
            Interval::m30 => 1800,
            Interval::h1 => 3600,
            Interval::h4 => 14400,
            Interval::h6 => 21600,
            Interval::h12 => 43200,
            Interval::D1 => 86400,
            Interval::D2 => 172800,
            Interval::D3 => 259200,
            Interval::W1 => 604800,
            Interval::M1 => 2592000,
            Interval::Y1 => 31536000,
        }
    }

    pub fn period(self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// Safety margin subtracted from the period for loader deadlines and
    /// claim TTLs, so a straggler never overlaps the next tick.
    pub fn safety_margin(self) -> Duration {
        let secs = self.seconds();
        Duration::from_millis((secs * 1000 / 10).clamp(200, 8000))
    }

    pub fn deadline(self) -> Duration {
        self.period() - self.safety_margin()
    }

    /// Largest wall-clock boundary `<= at`, aligned to multiples of the
    /// period from epoch 0. Every cluster member computes the same value.
    pub fn floor_tick(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.seconds() as i64;
        let epoch = at.timestamp();
        Utc.timestamp_opt(epoch - epoch.rem_euclid(secs), 0).unwrap()
    }

    /// Smallest wall-clock boundary strictly after `at`.
    pub fn next_tick(self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.floor_tick(at) + chrono::Duration::seconds(self.seconds() as i64)
    }

    /// Tick index of a boundary (seconds-since-epoch / period). Stored in
    /// claim records so stale claims can be recognized.
    pub fn tick_index(self, tick: DateTime<Utc>) -> i64 {
        tick.timestamp() / self.seconds() as i64
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Interval::s2 => "s2",
            Interval::s5 => "s5",
            Interval::s10 => "s10",
            Interval::s20 => "s20",
            Interval::s30 => "s30",
            Interval::m1 => "m1",
            Interval::m2 => "m2",
            Interval::m5 => "m5",
            Interval::m10 => "m10",
            Interval::m15 => "m15",
            Interval::m30 => "m30",
            Interval::h1 => "h1",
            Interval::h4 => "h4",
            Interval::h6 => "h6",
            Interval::h12 => "h12",
            Interval::D1 => "D1",
            Interval::D2 => "D2",
            Interval::D3 => "D3",
            Interval::W1 => "W1",
            Interval::M1 => "M1",
            Interval::Y1 => "Y1",
        };
        f.write_str(tag)
    }
}

impl FromStr for Interval {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_INTERVALS
            .iter()
            .find(|i| i.to_string() == s)
            .copied()
            .ok_or_else(|| ConfigError::InvalidInterval(s.to_string()))
    }
}

/// Stream of tick boundaries, one item per boundary, starting at the first
/// boundary after `now`. Sleeps until each boundary rather than a fixed
/// delay, so drift never accumulates.
pub fn tick_stream(interval: Interval) -> impl Stream<Item = DateTime<Utc>> {
    async_stream::stream! {
        let mut next = interval.next_tick(Utc::now());
        loop {
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            yield next;
            next = interval.next_tick(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_every_tag() {
        for i in ALL_INTERVALS {
            assert_eq!(i.to_string().parse::<Interval>().unwrap(), i);
        }
        assert!("s3".parse::<Interval>().is_err());
        assert!("1m".parse::<Interval>().is_err());
    }

    #[test]
    fn floor_is_epoch_aligned() {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 13, 37, 44).unwrap();
        let tick = Interval::s30.floor_tick(at);
        assert_eq!(tick, Utc.with_ymd_and_hms(2024, 5, 17, 13, 37, 30).unwrap());
        assert_eq!(tick.timestamp() % 30, 0);

        let tick = Interval::m5.floor_tick(at);
        assert_eq!(tick, Utc.with_ymd_and_hms(2024, 5, 17, 13, 35, 0).unwrap());
    }

    #[test]
    fn floor_at_boundary_is_identity() {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 13, 35, 0).unwrap();
        assert_eq!(Interval::m5.floor_tick(at), at);
        assert_eq!(
            Interval::m5.next_tick(at),
            Utc.with_ymd_and_hms(2024, 5, 17, 13, 40, 0).unwrap()
        );
    }

    #[test]
    fn members_agree_on_boundaries() {
        // Two "processes" flooring at different instants inside the same
        // period must land on the same tick.
        let a = Utc.with_ymd_and_hms(2024, 5, 17, 13, 37, 31).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 5, 17, 13, 37, 59).unwrap();
        assert_eq!(Interval::s30.floor_tick(a), Interval::s30.floor_tick(b));
        assert_eq!(Interval::s30.tick_index(a), Interval::s30.tick_index(b));
    }

    #[test]
    fn deadline_below_period() {
        for i in ALL_INTERVALS {
            assert!(i.deadline() < i.period());
            assert!(i.safety_margin() >= Duration::from_millis(200));
        }
    }
}
