use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::constants::{DEFAULT_RATE_LIMIT_BACKOFF_SECS, MIN_RETRY_AFTER_SECS, RATE_LIMIT_PHRASES};

lazy_static! {
    // "resets 5pm (Europe/Berlin)", "resets 11:30am (UTC)"
    static ref RESET_AT_REGEX: Regex =
        Regex::new(r"(?i)resets\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)\s*\(([^)]+)\)")
            .expect("Invalid reset-at regex");
    // "try again in 15 minutes", "resets in 2 hours"
    static ref RESET_IN_REGEX: Regex =
        Regex::new(r"(?i)(?:try again|resets?|retry)\s+(?:in|after)\s+(\d+)\s*(second|sec|minute|min|hour|hr)s?")
            .expect("Invalid reset-in regex");
}

/// Returns the rate-limit phrase found in `text`, if any.
pub fn detect(text: &str) -> Option<&'static str> {
    crate::str_utils::find_phrase(text, RATE_LIMIT_PHRASES)
}

/// Extracts the reset time from a free-text rate-limit notice.
///
/// Never fails: anything unparseable falls back to one hour from `now`.
pub fn parse_reset_time(message: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(reset) = parse_reset_at(message, now) {
        return reset;
    }
    if let Some(reset) = parse_reset_in(message, now) {
        return reset;
    }
    tracing::debug!("No reset time in rate-limit notice, assuming default backoff");
    now + Duration::seconds(DEFAULT_RATE_LIMIT_BACKOFF_SECS)
}

fn parse_reset_at(message: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = RESET_AT_REGEX.captures(message)?;
    let hour12: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    if !(1..=12).contains(&hour12) || minute > 59 {
        return None;
    }
    let is_pm = caps.get(3)?.as_str().eq_ignore_ascii_case("pm");
    let hour = match (hour12, is_pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, true) => h + 12,
        (h, false) => h,
    };

    let tz_name = caps.get(4)?.as_str().trim();
    let tz: chrono_tz::Tz = match tz_name.parse() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!("Unknown timezone '{}' in rate-limit notice", tz_name);
            return None;
        }
    };

    let local_now = now.with_timezone(&tz);
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let mut date = local_now.date_naive();
    // Roll to tomorrow when the wall-clock time already passed today.
    for _ in 0..2 {
        let candidate = tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc));
        if let Some(reset) = candidate {
            if reset > now {
                return Some(reset);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

fn parse_reset_in(message: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = RESET_IN_REGEX.captures(message)?;
    let amount: i64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_lowercase();
    let delta = match unit.as_str() {
        "second" | "sec" => Duration::seconds(amount),
        "minute" | "min" => Duration::minutes(amount),
        _ => Duration::hours(amount),
    };
    Some(now + delta)
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitRecord {
    pub worker_id: String,
    pub reset_time: DateTime<Utc>,
    pub retry_after_seconds: u64,
}

/// Per-worker rate-limit state.
#[derive(Default)]
pub struct RateLimitTracker {
    records: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_rate_limited(&self, worker_id: &str, message: &str) -> DateTime<Utc> {
        let reset = parse_reset_time(message, Utc::now());
        self.record_reset(worker_id, reset);
        tracing::warn!(
            worker = %worker_id,
            reset_time = %reset,
            "Worker marked rate-limited"
        );
        reset
    }

    pub fn record_reset(&self, worker_id: &str, reset_time: DateTime<Utc>) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(worker_id.to_string(), reset_time);
    }

    pub fn is_rate_limited(&self, worker_id: &str) -> bool {
        self.active_reset(worker_id).is_some()
    }

    /// Seconds until the worker may be retried, floored at 60.
    pub fn retry_after_seconds(&self, worker_id: &str) -> Option<u64> {
        let reset = self.active_reset(worker_id)?;
        Some(retry_after_from(reset, Utc::now()))
    }

    pub fn snapshot(&self) -> Vec<RateLimitRecord> {
        let now = Utc::now();
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.retain(|_, reset| *reset > now);
        let mut out: Vec<RateLimitRecord> = records
            .iter()
            .map(|(worker, reset)| RateLimitRecord {
                worker_id: worker.clone(),
                reset_time: *reset,
                retry_after_seconds: retry_after_from(*reset, now),
            })
            .collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }

    fn active_reset(&self, worker_id: &str) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        {
            let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
            match records.get(worker_id) {
                None => return None,
                Some(reset) if *reset > now => return Some(*reset),
                Some(_) => {}
            }
        }
        // Expired: purge lazily.
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.get(worker_id).is_some_and(|reset| *reset <= now) {
            records.remove(worker_id);
            tracing::info!(worker = %worker_id, "Rate limit expired");
        }
        None
    }
}

fn retry_after_from(reset: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let secs = (reset - now).num_seconds().max(0) as u64;
    secs.max(MIN_RETRY_AFTER_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_detects_phrases_case_insensitively() {
        assert_eq!(detect("You've hit your limit · resets 5pm"), Some("you've hit your limit"));
        assert_eq!(detect("Servers are at CAPACITY"), Some("capacity"));
        assert_eq!(detect("Here is your answer"), None);
    }

    #[test]
    fn test_parse_reset_pm_in_named_zone() {
        let now = at("2025-01-15T10:00:00Z");
        let reset = parse_reset_time("You've hit your limit · resets 5pm (UTC)", now);
        assert_eq!(reset, at("2025-01-15T17:00:00Z"));
    }

    #[test]
    fn test_parse_reset_rolls_to_tomorrow() {
        let now = at("2025-01-15T18:00:00Z");
        let reset = parse_reset_time("resets 5pm (UTC)", now);
        assert_eq!(reset, at("2025-01-16T17:00:00Z"));
    }

    #[test]
    fn test_parse_reset_respects_offset() {
        // Berlin is UTC+1 in January.
        let now = at("2025-01-15T10:00:00Z");
        let reset = parse_reset_time("resets 12am (Europe/Berlin)", now);
        assert_eq!(reset, at("2025-01-15T23:00:00Z"));
    }

    #[test]
    fn test_parse_relative_reset() {
        let now = at("2025-01-15T10:00:00Z");
        let reset = parse_reset_time("Too many requests, try again in 15 minutes", now);
        assert_eq!(reset, at("2025-01-15T10:15:00Z"));
    }

    #[test]
    fn test_unparseable_defaults_to_one_hour() {
        let now = at("2025-01-15T10:00:00Z");
        assert_eq!(parse_reset_time("usage limit reached", now), at("2025-01-15T11:00:00Z"));
        assert_eq!(parse_reset_time("resets 5pm (Mars/Olympus)", now), at("2025-01-15T11:00:00Z"));
        assert_eq!(parse_reset_time("resets 13pm (UTC)", now), at("2025-01-15T11:00:00Z"));
    }

    #[test]
    fn test_tracker_marks_and_floors_retry_after() {
        let tracker = RateLimitTracker::new();
        assert!(!tracker.is_rate_limited("w1"));
        tracker.record_reset("w1", Utc::now() + Duration::seconds(5));
        assert!(tracker.is_rate_limited("w1"));
        assert_eq!(tracker.retry_after_seconds("w1"), Some(60));
        assert!(!tracker.is_rate_limited("w2"));
    }

    #[test]
    fn test_expired_records_are_purged() {
        let tracker = RateLimitTracker::new();
        tracker.record_reset("w1", Utc::now() - Duration::seconds(1));
        assert!(!tracker.is_rate_limited("w1"));
        assert_eq!(tracker.retry_after_seconds("w1"), None);
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn test_mark_rate_limited_defaults_to_an_hour() {
        let tracker = RateLimitTracker::new();
        let reset = tracker.mark_rate_limited("w1", "quota exceeded");
        let secs = tracker.retry_after_seconds("w1").unwrap();
        assert!(secs > 3500 && secs <= 3600, "got {}", secs);
        assert!(reset > Utc::now());
    }
}
