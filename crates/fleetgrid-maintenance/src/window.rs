use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, FixedOffset, Utc};
use cron::Schedule;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("invalid maintenance schedule '{expression}': {reason}")]
    Schedule { expression: String, reason: String },

    #[error(transparent)]
    Duration(#[from] fleet_core::DurationError),

    #[error("maintenance window duration must be positive")]
    EmptyDuration,

    #[error("invalid time zone offset '{0}', expected e.g. +02:00")]
    TimeZone(String),

    #[error("maintenance schedule has no future windows")]
    Lapsed,
}

/// A parsed maintenance schedule.
#[derive(Debug, Clone)]
pub struct MaintenanceWindow {
    schedule: Schedule,
    duration: Duration,
    offset: FixedOffset,
}

impl MaintenanceWindow {
    /// Parse a cron expression, a duration (`HH:mm:ss` or ISO-8601) and a
    /// fixed offset such as `+02:00`.
    pub fn parse(schedule: &str, duration: &str, timezone: &str) -> Result<Self, WindowError> {
        let fields = schedule.split_whitespace().count();
        if !(6..=7).contains(&fields) {
            return Err(WindowError::Schedule {
                expression: schedule.to_string(),
                reason: format!("expected 6 or 7 fields, got {fields}"),
            });
        }
        let parsed = Schedule::from_str(schedule).map_err(|e| WindowError::Schedule {
            expression: schedule.to_string(),
            reason: e.to_string(),
        })?;

        let std_duration = fleet_core::duration::parse_flexible(duration)?;
        if std_duration.is_zero() {
            return Err(WindowError::EmptyDuration);
        }
        let duration = Duration::from_std(std_duration).map_err(|_| WindowError::EmptyDuration)?;

        Ok(Self {
            schedule: parsed,
            duration,
            offset: parse_offset(timezone)?,
        })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Earliest window start at or after `after`.
    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Cron fires on whole seconds; search strictly after the second
        // preceding the first whole second not before `after`.
        let floor = floor_seconds(after);
        let ceil = if floor == after {
            floor
        } else {
            floor + Duration::seconds(1)
        };
        self.first_after(ceil - Duration::seconds(1))
    }

    /// Start of the window that is currently open, or of the next one.
    ///
    /// The search is anchored at `now - duration`, so a window that opened
    /// earlier but has not ended yet is returned in preference to a future one.
    pub fn window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.first_after(floor_seconds(now - self.duration))
    }

    /// End of the window returned by [`window_start`](Self::window_start).
    pub fn window_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window_start(now).map(|start| start + self.duration)
    }

    /// True when no window can still end in the future.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.window_start(now).is_none()
    }

    /// True iff `now` lies within `[start, end)` of the current window.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.window_start(now) {
            Some(start) => start <= now && now < start + self.duration,
            None => false,
        }
    }

    fn first_after(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = instant.with_timezone(&self.offset);
        self.schedule
            .after(&local)
            .next()
            .map(|start| start.with_timezone(&Utc))
    }
}

/// Evaluates an optional maintenance schedule.
///
/// With no schedule configured every question has the permissive answer:
/// the window is always available and never lapsed.
#[derive(Debug, Clone, Default)]
pub struct WindowEvaluator {
    window: Option<MaintenanceWindow>,
}

impl WindowEvaluator {
    pub fn none() -> Self {
        Self { window: None }
    }

    pub fn new(window: MaintenanceWindow) -> Self {
        Self {
            window: Some(window),
        }
    }

    /// Parse all three parts, or none at all.
    pub fn parse(
        schedule: Option<&str>,
        duration: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<Self, WindowError> {
        match (schedule, duration, timezone) {
            (None, None, None) => Ok(Self::none()),
            (Some(s), Some(d), Some(tz)) => Ok(Self::new(MaintenanceWindow::parse(s, d, tz)?)),
            (None, _, _) => Err(WindowError::Schedule {
                expression: String::new(),
                reason: "duration or time zone given without a schedule".to_string(),
            }),
            (Some(s), _, _) => Err(WindowError::Schedule {
                expression: s.to_string(),
                reason: "schedule requires both a duration and a time zone".to_string(),
            }),
        }
    }

    /// Parse and additionally reject schedules that have already lapsed.
    pub fn validate_new(
        schedule: &str,
        duration: &str,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, WindowError> {
        let window = MaintenanceWindow::parse(schedule, duration, timezone)?;
        if window.is_lapsed(now) {
            return Err(WindowError::Lapsed);
        }
        Ok(Self::new(window))
    }

    pub fn has_maintenance_schedule(&self) -> bool {
        self.window.is_some()
    }

    pub fn window(&self) -> Option<&MaintenanceWindow> {
        self.window.as_ref()
    }

    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window.as_ref().and_then(|w| w.next_execution(after))
    }

    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.window.as_ref().is_some_and(|w| w.is_lapsed(now))
    }

    pub fn window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window.as_ref().and_then(|w| w.window_start(now))
    }

    pub fn window_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window.as_ref().and_then(|w| w.window_end(now))
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match &self.window {
            None => true,
            Some(w) => w.is_available(now),
        }
    }

    /// Time left until the next window opens; `None` when there is no
    /// schedule, it has lapsed, or a window is open right now.
    pub fn time_until_start(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.window_start(now)?;
        (start > now).then(|| start - now)
    }
}

fn floor_seconds(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .duration_trunc(Duration::seconds(1))
        .unwrap_or(instant)
}

fn parse_offset(raw: &str) -> Result<FixedOffset, WindowError> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| WindowError::TimeZone(raw.to_string()));
    }
    let (sign, rest) = match trimmed.as_bytes().first() {
        Some(b'+') => (1, &trimmed[1..]),
        Some(b'-') => (-1, &trimmed[1..]),
        _ => return Err(WindowError::TimeZone(raw.to_string())),
    };
    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| WindowError::TimeZone(raw.to_string()))?;
    let hours: i32 = hours
        .parse()
        .map_err(|_| WindowError::TimeZone(raw.to_string()))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| WindowError::TimeZone(raw.to_string()))?;
    if hours > 18 || !(0..60).contains(&minutes) {
        return Err(WindowError::TimeZone(raw.to_string()));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| WindowError::TimeZone(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn noon_window() -> MaintenanceWindow {
        MaintenanceWindow::parse("0 0 12 * * *", "01:00:00", "+00:00").unwrap()
    }

    #[test]
    fn no_schedule_is_always_available() {
        let eval = WindowEvaluator::none();
        assert!(!eval.has_maintenance_schedule());
        assert!(eval.is_available(at(3, 0, 0)));
        assert!(!eval.is_lapsed(at(3, 0, 0)));
        assert!(eval.time_until_start(at(3, 0, 0)).is_none());
    }

    #[test]
    fn window_ahead_is_unavailable() {
        let window = noon_window();
        let now = at(11, 44, 0);
        assert_eq!(window.window_start(now), Some(at(12, 0, 0)));
        assert_eq!(window.window_end(now), Some(at(13, 0, 0)));
        assert!(!window.is_available(now));
        assert!(!window.is_lapsed(now));
    }

    #[test]
    fn open_window_is_returned_over_future_one() {
        let window = noon_window();
        let now = at(12, 30, 0);
        assert_eq!(window.window_start(now), Some(at(12, 0, 0)));
        assert!(window.is_available(now));
        // next_execution looks forward only.
        assert_eq!(
            window.next_execution(now),
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn window_bounds_are_half_open() {
        let window = noon_window();
        assert!(window.is_available(at(12, 0, 0)));
        assert!(!window.is_available(at(13, 0, 0)));
    }

    #[test]
    fn back_to_back_windows_stay_available() {
        let window = MaintenanceWindow::parse("0 0 * * * *", "PT1H", "+00:00").unwrap();
        assert!(window.is_available(at(13, 0, 0)));
        assert_eq!(window.window_start(at(13, 0, 0)), Some(at(13, 0, 0)));
    }

    #[test]
    fn next_execution_includes_exact_instant() {
        let window = noon_window();
        assert_eq!(window.next_execution(at(12, 0, 0)), Some(at(12, 0, 0)));
        let just_after = at(12, 0, 0) + Duration::milliseconds(1);
        assert_eq!(
            window.next_execution(just_after),
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn year_field_lapses() {
        let window = MaintenanceWindow::parse("0 0 2 1 1 * 2020", "PT1H", "+00:00").unwrap();
        assert!(window.is_lapsed(at(0, 0, 0)));
        assert!(!window.is_available(at(0, 0, 0)));
        assert!(window.next_execution(at(0, 0, 0)).is_none());

        let eval = WindowEvaluator::new(window);
        assert!(eval.is_lapsed(at(0, 0, 0)));
        assert!(!eval.is_available(at(0, 0, 0)));
        assert!(eval.time_until_start(at(0, 0, 0)).is_none());
    }

    #[test]
    fn schedule_interpreted_in_offset() {
        let window = MaintenanceWindow::parse("0 0 2 * * *", "00:30:00", "+02:00").unwrap();
        assert_eq!(window.window_start(at(0, 0, 0) - Duration::hours(1)), Some(at(0, 0, 0)));
        assert!(window.is_available(at(0, 15, 0)));
    }

    #[test]
    fn time_until_start_counts_down() {
        let eval = WindowEvaluator::new(noon_window());
        assert_eq!(eval.time_until_start(at(11, 44, 0)), Some(Duration::minutes(16)));
        assert_eq!(eval.time_until_start(at(12, 10, 0)), None);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(matches!(
            MaintenanceWindow::parse("0 12 * * *", "PT1H", "+00:00"),
            Err(WindowError::Schedule { .. })
        ));
        assert!(matches!(
            MaintenanceWindow::parse("0 0 12 * * *", "an hour", "+00:00"),
            Err(WindowError::Duration(_))
        ));
        assert!(matches!(
            MaintenanceWindow::parse("0 0 12 * * *", "00:00:00", "+00:00"),
            Err(WindowError::EmptyDuration)
        ));
        assert!(matches!(
            MaintenanceWindow::parse("0 0 12 * * *", "PT1H", "Europe/Berlin"),
            Err(WindowError::TimeZone(_))
        ));
    }

    #[test]
    fn partial_schedule_is_rejected() {
        assert!(WindowEvaluator::parse(Some("0 0 12 * * *"), None, Some("+00:00")).is_err());
        assert!(WindowEvaluator::parse(None, Some("PT1H"), None).is_err());
        assert!(!WindowEvaluator::parse(None, None, None).unwrap().has_maintenance_schedule());
    }

    #[test]
    fn validate_new_rejects_lapsed() {
        let err = WindowEvaluator::validate_new("0 0 2 1 1 * 2020", "PT1H", "+00:00", at(0, 0, 0));
        assert!(matches!(err, Err(WindowError::Lapsed)));
        assert!(WindowEvaluator::validate_new("0 0 12 * * *", "PT1H", "-05:30", at(0, 0, 0)).is_ok());
    }
}
