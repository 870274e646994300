//! Download/update directives and poll interval computation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::TenantConfig;
use fleetgrid_maintenance::WindowEvaluator;
use fleetgrid_state::{ActionType, Deployment};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How a device should treat the download or the installation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlingType {
    Skip,
    Attempt,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceWindowStatus {
    Available,
    Unavailable,
}

/// Evaluator for the deployment's maintenance schedule.
///
/// Schedules are validated on assignment; one that no longer parses is
/// treated as absent.
pub fn window_of(deployment: &Deployment) -> WindowEvaluator {
    let Some(m) = &deployment.maintenance else {
        return WindowEvaluator::none();
    };
    match WindowEvaluator::parse(Some(&m.schedule), Some(&m.duration), Some(&m.timezone)) {
        Ok(eval) => eval,
        Err(e) => {
            warn!(schedule = %m.schedule, error = %e, "ignoring unparseable maintenance schedule");
            WindowEvaluator::none()
        }
    }
}

fn is_forced(deployment: &Deployment, now: DateTime<Utc>) -> bool {
    match deployment.action_type {
        ActionType::Forced | ActionType::DownloadOnly => true,
        ActionType::TimeForced => deployment.forced_time.is_some_and(|at| at <= now),
        ActionType::Soft => false,
    }
}

/// Downloads are never gated by the maintenance window.
pub fn download_handling(deployment: &Deployment, now: DateTime<Utc>) -> HandlingType {
    if is_forced(deployment, now) {
        HandlingType::Forced
    } else {
        HandlingType::Attempt
    }
}

pub fn update_handling(
    deployment: &Deployment,
    window: &WindowEvaluator,
    now: DateTime<Utc>,
) -> HandlingType {
    if deployment.action_type == ActionType::DownloadOnly {
        return HandlingType::Skip;
    }
    if window.has_maintenance_schedule() && !window.is_available(now) {
        return HandlingType::Skip;
    }
    download_handling(deployment, now)
}

/// `Some` only when a schedule is configured.
pub fn window_status(window: &WindowEvaluator, now: DateTime<Utc>) -> Option<MaintenanceWindowStatus> {
    if !window.has_maintenance_schedule() {
        return None;
    }
    Some(if window.is_available(now) {
        MaintenanceWindowStatus::Available
    } else {
        MaintenanceWindowStatus::Unavailable
    })
}

/// Sleep interval handed to a polling device.
///
/// While a maintenance window lies ahead, the device is asked to poll
/// `maintenance_window_poll_count` times before it opens, never more often
/// than `min_polling_time` and never less often than `polling_time`.
pub fn poll_sleep(config: &TenantConfig, window: &WindowEvaluator, now: DateTime<Utc>) -> Duration {
    let polling = config.effective_polling_time();
    let Some(until_start) = window.time_until_start(now) else {
        return polling;
    };
    let Ok(until_start) = until_start.to_std() else {
        return polling;
    };
    let per_poll = until_start / config.maintenance_window_poll_count.max(1);
    per_poll.clamp(config.min_polling_time.min(polling), polling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleetgrid_maintenance::MaintenanceWindow;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn deployment(action_type: ActionType) -> Deployment {
        Deployment {
            distribution_set: 1,
            action_type,
            forced_time: None,
            weight: None,
            maintenance: None,
        }
    }

    fn noon() -> WindowEvaluator {
        WindowEvaluator::new(MaintenanceWindow::parse("0 0 12 * * *", "PT1H", "+00:00").unwrap())
    }

    fn config(polling: u64, min: u64) -> TenantConfig {
        TenantConfig {
            polling_time: Duration::from_secs(polling),
            min_polling_time: Duration::from_secs(min),
            ..Default::default()
        }
    }

    #[test]
    fn handling_without_schedule() {
        let none = WindowEvaluator::none();
        let forced = deployment(ActionType::Forced);
        assert_eq!(download_handling(&forced, at(1, 0)), HandlingType::Forced);
        assert_eq!(update_handling(&forced, &none, at(1, 0)), HandlingType::Forced);
        assert_eq!(window_status(&none, at(1, 0)), None);

        let soft = deployment(ActionType::Soft);
        assert_eq!(download_handling(&soft, at(1, 0)), HandlingType::Attempt);
        assert_eq!(update_handling(&soft, &none, at(1, 0)), HandlingType::Attempt);

        let download_only = deployment(ActionType::DownloadOnly);
        assert_eq!(download_handling(&download_only, at(1, 0)), HandlingType::Forced);
        assert_eq!(update_handling(&download_only, &none, at(1, 0)), HandlingType::Skip);
    }

    #[test]
    fn time_forced_switches_at_forced_time() {
        let mut d = deployment(ActionType::TimeForced);
        d.forced_time = Some(at(10, 0));
        assert_eq!(download_handling(&d, at(9, 59)), HandlingType::Attempt);
        assert_eq!(download_handling(&d, at(10, 0)), HandlingType::Forced);
    }

    #[test]
    fn window_gates_update_only() {
        let d = deployment(ActionType::Forced);
        let window = noon();
        assert_eq!(download_handling(&d, at(11, 0)), HandlingType::Forced);
        assert_eq!(update_handling(&d, &window, at(11, 0)), HandlingType::Skip);
        assert_eq!(window_status(&window, at(11, 0)), Some(MaintenanceWindowStatus::Unavailable));

        assert_eq!(update_handling(&d, &window, at(12, 30)), HandlingType::Forced);
        assert_eq!(window_status(&window, at(12, 30)), Some(MaintenanceWindowStatus::Available));
    }

    #[test]
    fn lapsed_schedule_skips_update() {
        let d = deployment(ActionType::Forced);
        let lapsed = WindowEvaluator::new(
            MaintenanceWindow::parse("0 0 2 1 1 * 2020", "PT1H", "+00:00").unwrap(),
        );
        assert_eq!(download_handling(&d, at(11, 0)), HandlingType::Forced);
        assert_eq!(update_handling(&d, &lapsed, at(11, 0)), HandlingType::Skip);
    }

    #[test]
    fn sleep_shrinks_towards_window() {
        let cfg = config(300, 60);
        let window = noon();
        // 16 minutes out: 16/3 min exceeds the polling time.
        assert_eq!(poll_sleep(&cfg, &window, at(11, 44)), Duration::from_secs(300));
        // 6 minutes out: 2 minutes.
        assert_eq!(poll_sleep(&cfg, &window, at(11, 54)), Duration::from_secs(120));
        // 2 minutes out: floor at the minimum.
        assert_eq!(poll_sleep(&cfg, &window, at(11, 58)), Duration::from_secs(60));
        // Window open.
        assert_eq!(poll_sleep(&cfg, &window, at(12, 10)), Duration::from_secs(300));
    }

    #[test]
    fn sleep_is_full_interval_without_upcoming_window() {
        let cfg = config(300, 60);
        let lapsed = WindowEvaluator::new(
            MaintenanceWindow::parse("0 0 2 1 1 * 2020", "PT1H", "+00:00").unwrap(),
        );
        assert_eq!(poll_sleep(&cfg, &lapsed, at(11, 58)), Duration::from_secs(300));
        assert_eq!(poll_sleep(&cfg, &WindowEvaluator::none(), at(11, 58)), Duration::from_secs(300));
    }
}
