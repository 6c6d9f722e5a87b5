//! Daily-routine reset: once per local boundary (05:00 by default) the
//! done-today markers on daily fair-share tasks are cleared.
//!
//! The sweep works from the most recent boundary instant rather than from the
//! current minute, so it fires once per crossing no matter how often it is
//! polled, and catches up after the process was down across a boundary.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct DailyReset {
    boundary: NaiveTime,
    tz: Tz,
    last_fired: Option<DateTime<Utc>>,
}

impl DailyReset {
    pub fn new(boundary: NaiveTime, tz: Tz) -> Self {
        Self {
            boundary,
            tz,
            last_fired: None,
        }
    }

    pub fn boundary(&self) -> NaiveTime {
        self.boundary
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Latest boundary instant at or before `now`.
    pub fn most_recent_boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = now.with_timezone(&self.tz);
        let mut day = local.date_naive();
        if local.time() < self.boundary {
            day = day.pred_opt()?;
        }

        let naive = day.and_time(self.boundary);
        // A boundary inside a DST gap moves to the first valid instant after it.
        let local_boundary = self
            .tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| self.tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())?;

        Some(local_boundary.with_timezone(&Utc))
    }

    /// Returns the boundary to sweep against the first time a given boundary
    /// is observed, `None` on every later poll before the next one.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let boundary = self.most_recent_boundary(now)?;
        if self.last_fired == Some(boundary) {
            return None;
        }
        self.last_fired = Some(boundary);
        Some(boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five() -> NaiveTime {
        NaiveTime::from_hms_opt(5, 0, 0).unwrap()
    }

    #[test]
    fn boundary_before_five_is_yesterday() {
        let r = DailyReset::new(five(), Tz::UTC);
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 4, 59, 0).unwrap();
        assert_eq!(
            r.most_recent_boundary(now),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 5, 0, 0).unwrap())
        );

        let now = Utc.with_ymd_and_hms(2026, 3, 2, 5, 0, 0).unwrap();
        assert_eq!(r.most_recent_boundary(now), Some(now));
    }

    #[test]
    fn fires_once_per_boundary() {
        let mut r = DailyReset::new(five(), Tz::UTC);
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 5, 0, 0).unwrap();

        assert_eq!(r.poll(at), Some(at));
        assert_eq!(r.poll(at + Duration::seconds(30)), None);
        assert_eq!(r.poll(at + Duration::hours(12)), None);
        assert_eq!(r.poll(at + Duration::days(1)), Some(at + Duration::days(1)));
    }

    #[test]
    fn boundary_uses_local_time() {
        // March 2 is CST (UTC-6), so 05:00 local is 11:00 UTC.
        let r = DailyReset::new(five(), chrono_tz::America::Chicago);
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        assert_eq!(
            r.most_recent_boundary(now),
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap())
        );
    }
}
