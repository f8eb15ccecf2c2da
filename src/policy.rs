//! Access gate: time windows and share expiry.
//!
//! Evaluated once when a session is created and again on every policy tick
//! of the control loop.

use chrono::{DateTime, Datelike, Local, TimeZone, Utc};

use crate::model::AccessAuth;

/// Whether `auth` admits a connection now, in server local time.
pub fn check_time(auth: &AccessAuth) -> bool {
    check_time_at(auth, &Local::now())
}

/// Whether `auth` admits a connection at `now`.
///
/// Ranges are matched against the weekday and `HH:MM` of `now` in its own
/// timezone; a range's `week` counts from Monday = 0.
pub fn check_time_at<Tz: TimeZone>(auth: &AccessAuth, now: &DateTime<Tz>) -> bool
where
    Tz::Offset: std::fmt::Display,
{
    let utc = now.with_timezone(&Utc);
    if auth.start.is_some_and(|start| utc < start) || auth.end.is_some_and(|end| utc > end) {
        return false;
    }

    let weekday = now.weekday().num_days_from_sunday();
    let hm = now.format("%H:%M").to_string();
    let mut has = false;
    let mut inside = false;
    for range in &auth.ranges {
        has = has || !range.times.is_empty();
        if (range.week + 1) % 7 != weekday {
            continue;
        }
        for span in &range.times {
            if let Some((from, to)) = span.split_once('~') {
                inside = inside || (hm.as_str() >= from && hm.as_str() <= to);
            }
        }
    }
    !has || inside == auth.allow
}

/// A share link is usable while `share_end` lies in the future.
pub fn share_active(share_end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    share_end.map_or(true, |end| now < end)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, FixedOffset};

    use super::*;
    use crate::model::TimeRange;

    // 2024-06-05 is a Wednesday (week index 2).
    fn wednesday(h: u32, m: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 5, h, m, 0)
            .unwrap()
    }

    fn ranges(week: u32, times: &[&str], allow: bool) -> AccessAuth {
        AccessAuth {
            ranges: vec![TimeRange {
                week,
                times: times.iter().map(ToString::to_string).collect(),
            }],
            allow,
            ..AccessAuth::default()
        }
    }

    #[test]
    fn test_no_rules_passes() {
        assert!(check_time_at(&AccessAuth::default(), &wednesday(3, 0)));
    }

    #[test]
    fn test_allow_window() {
        let auth = ranges(2, &["09:00~18:00"], true);
        assert!(check_time_at(&auth, &wednesday(9, 0)));
        assert!(check_time_at(&auth, &wednesday(18, 0)));
        assert!(!check_time_at(&auth, &wednesday(18, 1)));
        assert!(!check_time_at(&auth, &wednesday(8, 59)));
    }

    #[test]
    fn test_other_day_is_outside() {
        let auth = ranges(3, &["00:00~23:59"], true);
        assert!(!check_time_at(&auth, &wednesday(12, 0)));
    }

    #[test]
    fn test_deny_window() {
        let auth = ranges(2, &["12:00~13:00"], false);
        assert!(!check_time_at(&auth, &wednesday(12, 30)));
        assert!(check_time_at(&auth, &wednesday(14, 0)));
    }

    #[test]
    fn test_empty_times_are_ignored() {
        let auth = ranges(2, &[], true);
        assert!(check_time_at(&auth, &wednesday(1, 0)));
    }

    #[test]
    fn test_start_and_end() {
        let now = wednesday(12, 0);
        let utc = now.with_timezone(&Utc);
        let auth = AccessAuth {
            start: Some(utc + Duration::hours(1)),
            ..AccessAuth::default()
        };
        assert!(!check_time_at(&auth, &now));
        let auth = AccessAuth {
            end: Some(utc - Duration::hours(1)),
            ..AccessAuth::default()
        };
        assert!(!check_time_at(&auth, &now));
        let auth = AccessAuth {
            start: Some(utc - Duration::hours(1)),
            end: Some(utc + Duration::hours(1)),
            ..AccessAuth::default()
        };
        assert!(check_time_at(&auth, &now));
    }

    #[test]
    fn test_share_active() {
        let now = Utc::now();
        assert!(share_active(None, now));
        assert!(share_active(Some(now + Duration::seconds(5)), now));
        assert!(!share_active(Some(now - Duration::seconds(5)), now));
    }
}
