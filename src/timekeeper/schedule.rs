//! Cron schedules: model, parsing and due-time evaluation.

use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::job::{JobGroup, SendOptions};

/// A schedule fires if its latest trigger time is at most this far behind now.
pub const SEND_WINDOW_SECONDS: i64 = 60;

/// Job options applied to every job a schedule produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    /// IANA timezone the cron expression is evaluated in. Defaults to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    /// Distinguishes several schedules on one queue. Defaults to "".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_in_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<JobGroup>,
}

/// A persisted schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    pub key: String,
    pub cron: String,
    pub timezone: String,
    pub data: Option<serde_json::Value>,
    pub options: ScheduleOptions,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

impl Schedule {
    /// Singleton key of the jobs this schedule sends.
    pub fn singleton_key(&self) -> String {
        format!("{}__{}", self.name, self.key)
    }

    /// Send options for one firing: deduplicated per schedule over a 60s slot.
    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            priority: self.options.priority,
            singleton_key: Some(self.singleton_key()),
            singleton_seconds: Some(SEND_WINDOW_SECONDS as u64),
            retry_limit: self.options.retry_limit,
            retry_delay_seconds: self.options.retry_delay_seconds,
            retry_backoff: self.options.retry_backoff,
            expire_in_seconds: self.options.expire_in_seconds,
            dead_letter: self.options.dead_letter.clone(),
            group: self.options.group.clone(),
            ..SendOptions::default()
        }
    }

    /// Latest trigger time within the send window of `now`, if any.
    pub fn due_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ValidationError> {
        let cron = parse_cron(&self.cron)?;
        let tz = parse_timezone(&self.timezone)?;
        Ok(last_fired_within(&cron, tz, now, SEND_WINDOW_SECONDS))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> Result<bool, ValidationError> {
        Ok(self.due_at(now)?.is_some())
    }
}

/// Parse a cron expression. Five-field expressions (minute resolution) get a
/// leading seconds field of `0`.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, ValidationError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ValidationError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_timezone(name: &str) -> Result<Tz, ValidationError> {
    name.parse::<Tz>()
        .map_err(|_| ValidationError::InvalidTimezone(name.to_string()))
}

/// Latest occurrence of `cron` in `[now - window, now]`.
fn last_fired_within(
    cron: &cron::Schedule,
    tz: Tz,
    now: DateTime<Utc>,
    window_seconds: i64,
) -> Option<DateTime<Utc>> {
    let window_start = (now - ChronoDuration::seconds(window_seconds)).with_timezone(&tz);
    let window_start = window_start - ChronoDuration::milliseconds(1);
    cron.after(&window_start)
        .map(|fire| fire.with_timezone(&Utc))
        .take_while(|fire| *fire <= now)
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(cron: &str, tz: &str) -> Schedule {
        Schedule {
            name: "reports".into(),
            key: String::new(),
            cron: cron.into(),
            timezone: tz.into(),
            data: None,
            options: ScheduleOptions::default(),
            created_on: Utc::now(),
            updated_on: Utc::now(),
        }
    }

    #[test]
    fn five_field_cron_is_accepted() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        let err = parse_cron("not a cron").unwrap_err();
        assert!(err.to_string().contains("not a cron"));
    }

    #[test]
    fn timezone_must_be_iana() {
        assert!(parse_timezone("UTC").is_ok());
        assert!(parse_timezone("America/Chicago").is_ok());
        assert!(parse_timezone("Mars/Olympus").is_err());
    }

    #[test]
    fn due_within_a_minute_of_trigger() {
        let hourly = schedule("0 * * * *", "UTC");
        let on_the_hour = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        assert!(hourly.is_due(on_the_hour).unwrap());
        assert!(hourly.is_due(on_the_hour + ChronoDuration::seconds(59)).unwrap());
        assert!(!hourly.is_due(on_the_hour + ChronoDuration::seconds(61)).unwrap());
        assert!(!hourly.is_due(on_the_hour - ChronoDuration::seconds(1)).unwrap());
    }

    #[test]
    fn due_at_reports_trigger_time() {
        let every_minute = schedule("* * * * *", "UTC");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 3, 20).unwrap();
        let fired = every_minute.due_at(now).unwrap().unwrap();
        assert_eq!(fired, Utc.with_ymd_and_hms(2024, 5, 1, 10, 3, 0).unwrap());
    }

    #[test]
    fn timezone_shifts_trigger() {
        // 09:00 in Tokyo is 00:00 UTC.
        let morning = schedule("0 9 * * *", "Asia/Tokyo");
        let midnight_utc = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 30).unwrap();
        assert!(morning.is_due(midnight_utc).unwrap());

        let utc_morning = schedule("0 9 * * *", "UTC");
        assert!(!utc_morning.is_due(midnight_utc).unwrap());
    }

    #[test]
    fn send_options_dedupe_per_schedule() {
        let mut nightly = schedule("0 0 * * *", "UTC");
        nightly.key = "eu".into();
        let options = nightly.send_options();
        assert_eq!(options.singleton_key.as_deref(), Some("reports__eu"));
        assert_eq!(options.singleton_seconds, Some(60));
    }
}
