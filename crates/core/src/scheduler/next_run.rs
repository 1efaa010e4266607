// crates/core/src/scheduler/next_run.rs
//! Schedule definitions and next-run computation.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Recurrence kind. Authoritative: there is no separate "scheduled" flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    #[default]
    Daily,
    Weekly,
    Monthly,
    Interval,
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Once => write!(f, "once"),
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
            Self::Interval => write!(f, "interval"),
        }
    }
}

fn default_hour() -> u32 {
    2
}

fn default_day_of_month() -> u32 {
    1
}

/// When a VM's backup recurs. Wall-clock fields are interpreted in the
/// timezone of the `now` passed to [`calculate_next_run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default)]
    pub schedule_type: ScheduleType,
    #[serde(default = "default_hour")]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
    /// 0 = Sunday.
    #[serde(default)]
    pub day_of_week: u32,
    /// Clamped to the length of shorter months.
    #[serde(default = "default_day_of_month")]
    pub day_of_month: u32,
    #[serde(default)]
    pub interval_minutes: u32,
    /// Absolute time for `once`, anchor for `interval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            schedule_type: ScheduleType::Daily,
            hour: default_hour(),
            minute: 0,
            day_of_week: 0,
            day_of_month: default_day_of_month(),
            interval_minutes: 0,
            start_at: None,
        }
    }
}

impl ScheduleSpec {
    pub fn daily(hour: u32, minute: u32) -> Self {
        Self {
            hour,
            minute,
            ..Self::default()
        }
    }

    pub fn weekly(day_of_week: u32, hour: u32, minute: u32) -> Self {
        Self {
            schedule_type: ScheduleType::Weekly,
            day_of_week,
            ..Self::daily(hour, minute)
        }
    }

    pub fn monthly(day_of_month: u32, hour: u32, minute: u32) -> Self {
        Self {
            schedule_type: ScheduleType::Monthly,
            day_of_month,
            ..Self::daily(hour, minute)
        }
    }

    pub fn interval(minutes: u32, start_at: Option<DateTime<Utc>>) -> Self {
        Self {
            schedule_type: ScheduleType::Interval,
            interval_minutes: minutes,
            start_at,
            ..Self::default()
        }
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Self {
            schedule_type: ScheduleType::Once,
            start_at: Some(at),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.hour > 23 {
            return Err(format!("hour must be 0-23, got {}", self.hour));
        }
        if self.minute > 59 {
            return Err(format!("minute must be 0-59, got {}", self.minute));
        }
        match self.schedule_type {
            ScheduleType::Weekly if self.day_of_week > 6 => Err(format!(
                "day_of_week must be 0 (Sunday) to 6, got {}",
                self.day_of_week
            )),
            ScheduleType::Monthly if !(1..=31).contains(&self.day_of_month) => Err(format!(
                "day_of_month must be 1-31, got {}",
                self.day_of_month
            )),
            ScheduleType::Interval if self.interval_minutes == 0 => {
                Err("interval_minutes must be positive for interval schedules".into())
            }
            _ => Ok(()),
        }
    }
}

/// Next trigger strictly after `now`, or `None` if the schedule can never fire.
///
/// Pure in `spec` and `now`:
/// - `once`: `start_at` if still ahead, else the next `hour:minute`
/// - `daily`/`weekly`/`monthly`: next matching wall-clock time
/// - `interval`: `start_at` advanced by whole intervals past `now`, or
///   `now + interval` without an anchor
pub fn calculate_next_run<Tz: TimeZone>(
    spec: &ScheduleSpec,
    now: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    match spec.schedule_type {
        ScheduleType::Once => match &spec.start_at {
            Some(at) if at.with_timezone(&now.timezone()) > *now => {
                Some(at.with_timezone(&now.timezone()))
            }
            _ => next_wall_clock(spec, now, |_| true),
        },
        ScheduleType::Daily => next_wall_clock(spec, now, |_| true),
        ScheduleType::Weekly => next_wall_clock(spec, now, |d| {
            d.weekday().num_days_from_sunday() == spec.day_of_week
        }),
        ScheduleType::Monthly => next_wall_clock(spec, now, |d| {
            d.day() == spec.day_of_month.min(days_in_month(d.year(), d.month()))
        }),
        ScheduleType::Interval => {
            let anchor = spec
                .start_at
                .as_ref()
                .map(|a| a.with_timezone(&now.timezone()))
                .unwrap_or_else(|| now.clone());
            advance_by_interval(&anchor, spec.interval_minutes, now)
        }
    }
}

/// First `anchor + k * interval` (k >= 0) strictly after `now`. Missed
/// firings collapse into one.
pub fn advance_by_interval<Tz: TimeZone>(
    anchor: &DateTime<Tz>,
    interval_minutes: u32,
    now: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    if interval_minutes == 0 {
        return None;
    }
    if anchor > now {
        return Some(anchor.clone());
    }
    let interval_secs = i64::from(interval_minutes) * 60;
    let elapsed = now.clone().signed_duration_since(anchor.clone());
    let steps = elapsed.num_seconds() / interval_secs + 1;
    Some(anchor.clone() + Duration::seconds(interval_secs * steps))
}

/// Earliest `hour:minute` on a day accepted by `matches`, after `now`.
fn next_wall_clock<Tz: TimeZone>(
    spec: &ScheduleSpec,
    now: &DateTime<Tz>,
    matches: impl Fn(NaiveDate) -> bool,
) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let today = now.date_naive();
    // 13 months covers every monthly and weekly pattern.
    (0..=400)
        .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
        .filter(|d| matches(*d))
        .filter_map(|d| local_time(&tz, d, spec.hour, spec.minute))
        .find(|candidate| candidate > now)
}

/// `date hour:minute` in `tz`. A time skipped by a DST jump resolves to the
/// first valid instant after it; an ambiguous one to the earlier instant.
fn local_time<Tz: TimeZone>(tz: &Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Tz>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    tz.from_local_datetime(&naive).earliest().or_else(|| {
        (1..=4)
            .map(|quarter| naive + Duration::minutes(15 * quarter))
            .find_map(|shifted| tz.from_local_datetime(&shifted).earliest())
    })
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}
