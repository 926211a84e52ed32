//! Timestamp utilities

use chrono::{DateTime, Local, NaiveDateTime, Timelike, Utc};

/// Format used in backup file suffixes (`YYYYMMDD_HHMMSS`)
pub const BACKUP_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Format used for record annotation timestamps
pub const ANNOTATION_STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current local wall-clock time truncated to whole seconds
///
/// Store annotations and backup names carry second precision only, so
/// values are truncated here to keep them comparable after a round trip.
pub fn local_now_seconds() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Render a backup suffix stamp
pub fn backup_stamp(at: NaiveDateTime) -> String {
    at.format(BACKUP_STAMP_FORMAT).to_string()
}

/// Parse a backup suffix stamp, `None` if it does not follow the fixed format
pub fn parse_backup_stamp(stamp: &str) -> Option<NaiveDateTime> {
    if stamp.len() != 15 {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, BACKUP_STAMP_FORMAT).ok()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Duration;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        // Should be a reasonable timestamp (after year 2000)
        assert!(timestamp.timestamp() > 946_684_800);
    }

    #[test]
    fn test_local_now_has_no_subseconds() {
        assert_eq!(local_now_seconds().nanosecond(), 0);
    }

    #[test]
    fn test_backup_stamp_format() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 1)
            .unwrap();
        assert_eq!(backup_stamp(at), "20240307_090501");
    }

    #[test]
    fn test_backup_stamp_parses_back() {
        let at = NaiveDate::from_ymd_opt(2023, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 59)
            .unwrap();
        assert_eq!(parse_backup_stamp(&backup_stamp(at)), Some(at));
    }

    #[test]
    fn test_parse_backup_stamp_rejects_other_shapes() {
        assert_eq!(parse_backup_stamp("20240307"), None);
        assert_eq!(parse_backup_stamp("2024-03-07_0905"), None);
        assert_eq!(parse_backup_stamp("20241307_090501"), None);
    }

    #[test]
    fn test_millis_to_duration_one_second() {
        let duration = millis_to_duration(1000);
        assert_eq!(duration, Duration::from_secs(1));
    }
}
