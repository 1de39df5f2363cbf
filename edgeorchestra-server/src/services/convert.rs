//! Conversions between wire messages and core types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use prost_types::Timestamp;

use edgeorchestra_core::{
    BatteryState,
    Command,
    DeviceCapabilities,
    DeviceMetrics,
    DeviceStatus,
};
use edgeorchestra_proto as proto;

use crate::registry::Device;

pub fn status_to_proto(status: DeviceStatus) -> proto::DeviceStatus {
    match status {
        DeviceStatus::Online => proto::DeviceStatus::Online,
        DeviceStatus::Offline => proto::DeviceStatus::Offline,
        DeviceStatus::Training => proto::DeviceStatus::Training,
        DeviceStatus::Error => proto::DeviceStatus::Error,
    }
}

pub fn status_filter_from_proto(status: i32) -> Option<DeviceStatus> {
    match proto::DeviceStatus::from_i32(status) {
        Some(proto::DeviceStatus::Online) => Some(DeviceStatus::Online),
        Some(proto::DeviceStatus::Offline) => Some(DeviceStatus::Offline),
        Some(proto::DeviceStatus::Training) => Some(DeviceStatus::Training),
        Some(proto::DeviceStatus::Error) => Some(DeviceStatus::Error),
        Some(proto::DeviceStatus::Unspecified) | None => None,
    }
}

fn battery_state_from_proto(state: i32) -> BatteryState {
    match proto::BatteryState::from_i32(state) {
        Some(proto::BatteryState::Charging) => BatteryState::Charging,
        Some(proto::BatteryState::Discharging) => BatteryState::Discharging,
        Some(proto::BatteryState::Full) => BatteryState::Full,
        Some(proto::BatteryState::NotCharging) => BatteryState::NotCharging,
        Some(proto::BatteryState::Unspecified) | None => BatteryState::Unspecified,
    }
}

fn battery_state_to_proto(state: BatteryState) -> proto::BatteryState {
    match state {
        BatteryState::Charging => proto::BatteryState::Charging,
        BatteryState::Discharging => proto::BatteryState::Discharging,
        BatteryState::Full => proto::BatteryState::Full,
        BatteryState::NotCharging => proto::BatteryState::NotCharging,
        BatteryState::Unspecified => proto::BatteryState::Unspecified,
    }
}

pub fn metrics_from_proto(metrics: Option<proto::DeviceMetrics>) -> DeviceMetrics {
    let metrics = match metrics {
        Some(metrics) => metrics,
        None => return DeviceMetrics::default(),
    };
    let (battery_level, battery_state) = metrics
        .battery
        .map(|battery| (battery.level, battery_state_from_proto(battery.state)))
        .unwrap_or((0.0, BatteryState::Unspecified));
    DeviceMetrics {
        cpu_usage: metrics.cpu_usage,
        memory_usage: metrics.memory_usage,
        thermal_pressure: metrics.thermal_pressure,
        battery_level,
        battery_state,
        low_power_mode: metrics.is_low_power_mode,
    }
}

pub fn metrics_to_proto(metrics: &DeviceMetrics) -> proto::DeviceMetrics {
    proto::DeviceMetrics {
        cpu_usage: metrics.cpu_usage,
        memory_usage: metrics.memory_usage,
        thermal_pressure: metrics.thermal_pressure,
        battery: Some(proto::BatteryInfo {
            level: metrics.battery_level,
            state: battery_state_to_proto(metrics.battery_state) as i32,
        }),
        is_low_power_mode: metrics.low_power_mode,
    }
}

pub fn capabilities_from_proto(
    capabilities: Option<proto::DeviceCapabilities>,
) -> DeviceCapabilities {
    let capabilities = match capabilities {
        Some(capabilities) => capabilities,
        None => return DeviceCapabilities::default(),
    };
    DeviceCapabilities {
        chip: capabilities.chip,
        memory_bytes: capabilities.memory_bytes,
        cpu_cores: capabilities.cpu_cores,
        gpu_cores: capabilities.gpu_cores,
        neural_engine_cores: capabilities.neural_engine_cores,
        supported_frameworks: capabilities.supported_frameworks.into_iter().collect(),
    }
}

fn capabilities_to_proto(capabilities: &DeviceCapabilities) -> proto::DeviceCapabilities {
    proto::DeviceCapabilities {
        chip: capabilities.chip.clone(),
        memory_bytes: capabilities.memory_bytes,
        cpu_cores: capabilities.cpu_cores,
        gpu_cores: capabilities.gpu_cores,
        neural_engine_cores: capabilities.neural_engine_cores,
        supported_frameworks: capabilities
            .supported_frameworks
            .iter()
            .cloned()
            .collect(),
    }
}

fn timestamp(datetime: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: datetime.timestamp(),
        nanos: datetime.timestamp_subsec_nanos() as i32,
    }
}

pub fn device_to_proto(device: &Device) -> proto::DeviceInfo {
    proto::DeviceInfo {
        id: Some(proto::DeviceId {
            value: device.id.to_string(),
        }),
        name: device.name.clone(),
        device_model: device.device_model.clone(),
        os_version: device.os_version.clone(),
        capabilities: Some(capabilities_to_proto(&device.capabilities)),
        status: status_to_proto(device.status) as i32,
        last_metrics: Some(metrics_to_proto(&device.last_metrics)),
        registered_at: Some(timestamp(device.registered_at)),
        last_seen_at: Some(timestamp(device.last_seen_at)),
    }
}

fn command_to_proto(command: &Command) -> proto::HeartbeatCommand {
    match command {
        Command::Ack => proto::HeartbeatCommand::Ack,
        Command::UpdateInterval { .. } => proto::HeartbeatCommand::UpdateInterval,
        Command::StartTraining(_) => proto::HeartbeatCommand::StartTraining,
        Command::StopTraining { .. } => proto::HeartbeatCommand::StopTraining,
        Command::Shutdown => proto::HeartbeatCommand::Shutdown,
    }
}

/// Builds a heartbeat response delivering `command` (or a bare ack) plus the
/// server telemetry the worker surfaces.
pub fn heartbeat_response(
    command: Option<Command>,
    ack_sequence: u64,
    metadata: HashMap<String, String>,
) -> proto::HeartbeatResponse {
    let command = command.unwrap_or(Command::Ack);
    proto::HeartbeatResponse {
        command: command_to_proto(&command) as i32,
        ack_sequence,
        parameters: command.parameters().into_iter().collect(),
        metadata: metadata.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeorchestra_core::{command::StartTraining, JobId, ModelId};

    #[test]
    fn test_metrics_roundtrip() {
        let metrics = DeviceMetrics {
            cpu_usage: 0.4,
            memory_usage: 0.3,
            thermal_pressure: 0.2,
            battery_level: 0.8,
            battery_state: BatteryState::Full,
            low_power_mode: true,
        };
        assert_eq!(metrics_from_proto(Some(metrics_to_proto(&metrics))), metrics);
    }

    #[test]
    fn test_missing_metrics_default() {
        assert_eq!(metrics_from_proto(None), DeviceMetrics::default());
    }

    #[test]
    fn test_start_training_response_carries_parameters() {
        let job_id = JobId::generate();
        let command = Command::StartTraining(StartTraining {
            job_id,
            model_id: ModelId::digest(b"m"),
            round: 2,
            partition_index: 0,
            partition_total: 3,
            architecture: "mnist".into(),
        });
        let response = heartbeat_response(Some(command), 9, HashMap::new());
        assert_eq!(
            response.command,
            proto::HeartbeatCommand::StartTraining as i32
        );
        assert_eq!(response.ack_sequence, 9);
        assert_eq!(response.parameters["job_id"], job_id.to_string());
        assert_eq!(response.parameters["round"], "2");
    }

    #[test]
    fn test_ack_response_when_no_command_queued() {
        let response = heartbeat_response(None, 4, HashMap::new());
        assert_eq!(response.command, proto::HeartbeatCommand::Ack as i32);
        assert!(response.parameters.is_empty());
    }
}
