//! Participant eligibility and selection ordering.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use edgeorchestra_core::{BatteryState, DeviceStatus};

use crate::{coordinator::job::RoundPolicy, registry::Device};

/// Whether a device may be assigned to a round.
///
/// A device is eligible iff it is live, `online` (devices assigned to another
/// open round are `training` and therefore excluded), charged above the
/// battery floor, not discharging, below the thermal ceiling, and supports
/// every required framework.
pub fn is_eligible(
    device: &Device,
    live: bool,
    policy: &RoundPolicy,
    required_frameworks: &BTreeSet<String>,
) -> bool {
    let metrics = &device.last_metrics;
    live && device.status == DeviceStatus::Online
        && metrics.battery_level >= policy.battery_floor
        && matches!(
            metrics.battery_state,
            BatteryState::Charging | BatteryState::Full | BatteryState::NotCharging
        )
        && metrics.thermal_pressure <= policy.thermal_ceiling
        && required_frameworks.is_subset(&device.capabilities.supported_frameworks)
}

/// Selection order for oversubscribed rounds: higher battery first, then
/// lower thermal pressure, then lower CPU load, ties broken by device id.
pub fn rank(a: &Device, b: &Device) -> Ordering {
    let am = &a.last_metrics;
    let bm = &b.last_metrics;
    bm.battery_level
        .partial_cmp(&am.battery_level)
        .unwrap_or(Ordering::Equal)
        .then(
            am.thermal_pressure
                .partial_cmp(&bm.thermal_pressure)
                .unwrap_or(Ordering::Equal),
        )
        .then(
            am.cpu_usage
                .partial_cmp(&bm.cpu_usage)
                .unwrap_or(Ordering::Equal),
        )
        .then(a.id.cmp(&b.id))
}

/// Sorts the eligible pool and truncates it to `max` when set.
pub fn pick(mut eligible: Vec<Device>, max: Option<usize>) -> Vec<Device> {
    eligible.sort_by(rank);
    if let Some(max) = max {
        eligible.truncate(max);
    }
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edgeorchestra_core::{DeviceCapabilities, DeviceId, DeviceMetrics};

    fn device(battery: f32, thermal: f32, cpu: f32) -> Device {
        Device {
            id: DeviceId::generate(),
            name: "d".into(),
            device_model: "sim".into(),
            os_version: "1.0".into(),
            capabilities: DeviceCapabilities::default(),
            status: DeviceStatus::Online,
            last_metrics: DeviceMetrics {
                cpu_usage: cpu,
                memory_usage: 0.2,
                thermal_pressure: thermal,
                battery_level: battery,
                battery_state: BatteryState::Charging,
                low_power_mode: false,
            },
            registered_at: Utc::now(),
            last_seen_at: Utc::now(),
        }
    }

    fn policy() -> RoundPolicy {
        RoundPolicy::default()
    }

    #[test]
    fn test_battery_floor_excludes() {
        let low = device(0.20, 0.1, 0.1);
        assert!(!is_eligible(&low, true, &policy(), &BTreeSet::new()));
        let ok = device(0.30, 0.1, 0.1);
        assert!(is_eligible(&ok, true, &policy(), &BTreeSet::new()));
    }

    #[test]
    fn test_discharging_excludes() {
        let mut d = device(0.9, 0.1, 0.1);
        d.last_metrics.battery_state = BatteryState::Discharging;
        assert!(!is_eligible(&d, true, &policy(), &BTreeSet::new()));
        d.last_metrics.battery_state = BatteryState::NotCharging;
        assert!(is_eligible(&d, true, &policy(), &BTreeSet::new()));
    }

    #[test]
    fn test_thermal_ceiling_excludes() {
        let hot = device(0.9, 0.75, 0.1);
        assert!(!is_eligible(&hot, true, &policy(), &BTreeSet::new()));
    }

    #[test]
    fn test_dead_and_busy_devices_excluded() {
        let d = device(0.9, 0.1, 0.1);
        assert!(!is_eligible(&d, false, &policy(), &BTreeSet::new()));

        let mut busy = device(0.9, 0.1, 0.1);
        busy.status = DeviceStatus::Training;
        assert!(!is_eligible(&busy, true, &policy(), &BTreeSet::new()));
    }

    #[test]
    fn test_framework_requirement() {
        let mut required = BTreeSet::new();
        required.insert("coreml".to_string());

        let plain = device(0.9, 0.1, 0.1);
        assert!(!is_eligible(&plain, true, &policy(), &required));

        let mut capable = device(0.9, 0.1, 0.1);
        capable
            .capabilities
            .supported_frameworks
            .insert("coreml".to_string());
        assert!(is_eligible(&capable, true, &policy(), &required));
    }

    #[test]
    fn test_rank_prefers_battery_then_thermal_then_cpu() {
        let best = device(0.9, 0.1, 0.5);
        let cooler = device(0.8, 0.1, 0.5);
        let warmer = device(0.8, 0.3, 0.5);
        let idler = device(0.8, 0.3, 0.1);

        let picked = pick(
            vec![warmer.clone(), best.clone(), idler.clone(), cooler.clone()],
            None,
        );
        let ids: Vec<_> = picked.iter().map(|d| d.id).collect();
        assert_eq!(ids[0], best.id);
        assert_eq!(ids[1], cooler.id);
        // Same battery and thermal: the idle device wins.
        assert_eq!(ids[2], idler.id);
        assert_eq!(ids[3], warmer.id);
    }

    #[test]
    fn test_pick_truncates_to_max() {
        let pool = vec![
            device(0.9, 0.1, 0.1),
            device(0.8, 0.1, 0.1),
            device(0.7, 0.1, 0.1),
        ];
        assert_eq!(pick(pool, Some(2)).len(), 2);
    }

    #[test]
    fn test_rank_tie_breaks_by_id() {
        let mut a = device(0.8, 0.2, 0.2);
        let mut b = device(0.8, 0.2, 0.2);
        if b.id < a.id {
            std::mem::swap(&mut a, &mut b);
        }
        assert_eq!(rank(&a, &b), Ordering::Less);
    }
}
