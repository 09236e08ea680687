//! Read-time lifecycle status derived from an IPO's timeline.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

/// Indian market time, UTC+05:30. Timeline dates are calendar days there.
const MARKET_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpoStatus {
    Upcoming,
    #[serde(alias = "LIVE")]
    Active,
    Closed,
    Listed,
    Unknown,
}

impl IpoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upcoming => "UPCOMING",
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
            Self::Listed => "LISTED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UPCOMING" => Some(Self::Upcoming),
            "ACTIVE" | "LIVE" | "OPEN" => Some(Self::Active),
            "CLOSED" => Some(Self::Closed),
            "LISTED" => Some(Self::Listed),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for IpoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn market_date(now: DateTime<Utc>) -> NaiveDate {
    let offset = FixedOffset::east_opt(MARKET_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix());
    now.with_timezone(&offset).date_naive()
}

/// First matching rule wins:
/// listed once the listing day arrives, closed after the close day,
/// active from the open day, upcoming before it, unknown otherwise.
pub fn compute_status(
    open_date: Option<NaiveDate>,
    close_date: Option<NaiveDate>,
    listing_date: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> IpoStatus {
    let today = market_date(now);

    if listing_date.is_some_and(|d| today >= d) {
        return IpoStatus::Listed;
    }
    if close_date.is_some_and(|d| today > d) {
        return IpoStatus::Closed;
    }
    match open_date {
        Some(d) if today >= d => IpoStatus::Active,
        Some(_) => IpoStatus::Upcoming,
        None => IpoStatus::Unknown,
    }
}

/// Source of "now" for everything time-dependent.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    // 10:00 IST on the given day.
    fn at(date: NaiveDate) -> DateTime<Utc> {
        Utc.from_utc_datetime(&date.and_hms_opt(4, 30, 0).unwrap())
    }

    #[test]
    fn open_yesterday_close_tomorrow_is_active() {
        let today = d(2025, 6, 11);
        let status = compute_status(
            Some(today - Duration::days(1)),
            Some(today + Duration::days(1)),
            None,
            at(today),
        );
        assert_eq!(status, IpoStatus::Active);
    }

    #[test]
    fn rules_apply_in_priority_order() {
        let today = d(2025, 6, 11);
        let now = at(today);
        assert_eq!(compute_status(None, None, Some(d(2025, 6, 1)), now), IpoStatus::Listed);
        assert_eq!(
            compute_status(Some(d(2025, 6, 2)), Some(d(2025, 6, 4)), Some(d(2025, 6, 20)), now),
            IpoStatus::Closed
        );
        assert_eq!(compute_status(Some(d(2025, 6, 11)), None, None, now), IpoStatus::Active);
        assert_eq!(compute_status(Some(d(2025, 6, 12)), None, None, now), IpoStatus::Upcoming);
        assert_eq!(compute_status(None, Some(d(2025, 6, 30)), None, now), IpoStatus::Unknown);
    }

    #[test]
    fn close_day_itself_is_still_active() {
        let today = d(2025, 6, 11);
        assert_eq!(
            compute_status(Some(d(2025, 6, 9)), Some(today), None, at(today)),
            IpoStatus::Active
        );
    }

    #[test]
    fn market_day_rolls_over_at_ist_midnight() {
        // 19:00 UTC on the 10th is already the 11th in IST.
        let now = Utc.with_ymd_and_hms(2025, 6, 10, 19, 0, 0).single().unwrap();
        assert_eq!(market_date(now), d(2025, 6, 11));
        assert_eq!(compute_status(Some(d(2025, 6, 11)), None, None, now), IpoStatus::Active);
    }

    #[test]
    fn every_date_combination_yields_a_status() {
        let now = at(d(2025, 6, 11));
        let choices = [None, Some(d(2025, 6, 1)), Some(d(2025, 6, 11)), Some(d(2025, 7, 1))];
        for open in choices {
            for close in choices {
                for listing in choices {
                    let status = compute_status(open, close, listing, now);
                    assert!(IpoStatus::parse(status.as_str()) == Some(status));
                }
            }
        }
    }

    fn rank(status: IpoStatus) -> u8 {
        match status {
            IpoStatus::Unknown | IpoStatus::Upcoming => 0,
            IpoStatus::Active => 1,
            IpoStatus::Closed => 2,
            IpoStatus::Listed => 3,
        }
    }

    #[test]
    fn status_never_regresses_as_time_advances() {
        let timelines = [
            (Some(d(2025, 6, 5)), Some(d(2025, 6, 9)), Some(d(2025, 6, 12))),
            (Some(d(2025, 6, 5)), None, Some(d(2025, 6, 12))),
            (None, Some(d(2025, 6, 9)), None),
            (Some(d(2025, 6, 5)), Some(d(2025, 6, 4)), None),
            (None, None, None),
        ];
        for (open, close, listing) in timelines {
            let mut previous = 0;
            let mut now = at(d(2025, 5, 25));
            while now < at(d(2025, 6, 30)) {
                let r = rank(compute_status(open, close, listing, now));
                assert!(r >= previous, "regressed for {open:?} {close:?} {listing:?} at {now}");
                previous = r;
                now += Duration::hours(7);
            }
        }
    }

    #[test]
    fn live_alias_deserializes_to_active() {
        let status: IpoStatus = serde_json::from_str("\"LIVE\"").unwrap();
        assert_eq!(status, IpoStatus::Active);
        assert_eq!(serde_json::to_string(&IpoStatus::Active).unwrap(), "\"ACTIVE\"");
    }

    #[test]
    fn fixed_clock_returns_its_instant() {
        let instant = at(d(2025, 1, 1));
        assert_eq!(FixedClock(instant).now(), instant);
    }
}
