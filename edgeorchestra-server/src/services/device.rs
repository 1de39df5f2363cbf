//! The device registry gRPC service.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

use edgeorchestra_proto::{
    device_registry_server::DeviceRegistry as DeviceRegistryService,
    DeviceInfo,
    GetDeviceRequest,
    GetDeviceResponse,
    ListDevicesRequest,
    RegisterRequest,
    RegisterResponse,
    UnregisterRequest,
    UnregisterResponse,
};

use crate::{
    liveness::LivenessTracker,
    registry::{DeviceRegistry, Registration},
    services::{convert, parse_device_id, unavailable},
    storage::Storage,
};

/// Device registration and management.
pub struct DeviceApi<T> {
    registry: DeviceRegistry<T>,
    liveness: LivenessTracker<T>,
}

impl<T> DeviceApi<T>
where
    T: Storage,
{
    pub fn new(registry: DeviceRegistry<T>, liveness: LivenessTracker<T>) -> Self {
        Self { registry, liveness }
    }
}

#[tonic::async_trait]
impl<T> DeviceRegistryService for DeviceApi<T>
where
    T: Storage,
{
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let request = request.into_inner();
        let metrics = convert::metrics_from_proto(request.initial_metrics);

        let mut registry = self.registry.clone();
        let device = registry
            .register(Registration {
                name: request.name,
                device_model: request.device_model,
                os_version: request.os_version,
                capabilities: convert::capabilities_from_proto(request.capabilities),
                initial_metrics: metrics.clone(),
            })
            .await
            .map_err(unavailable)?;

        // Seed liveness so a freshly registered device counts as live until
        // its first heartbeat interval elapses.
        let mut liveness = self.liveness.clone();
        liveness
            .ingest(&device.id, 0, &metrics)
            .await
            .map_err(|err| Status::unavailable(err.to_string()))?;

        Ok(Response::new(RegisterResponse {
            device_id: Some(edgeorchestra_proto::DeviceId {
                value: device.id.to_string(),
            }),
            device: Some(convert::device_to_proto(&device)),
        }))
    }

    async fn unregister(
        &self,
        request: Request<UnregisterRequest>,
    ) -> Result<Response<UnregisterResponse>, Status> {
        let request = request.into_inner();
        let device_id = parse_device_id(request.device_id)?;

        let mut registry = self.registry.clone();
        let known = registry.unregister(&device_id).await.map_err(unavailable)?;
        if !known {
            return Err(Status::not_found("unknown device"));
        }
        let mut liveness = self.liveness.clone();
        liveness.forget(&device_id).await.map_err(unavailable)?;
        Ok(Response::new(UnregisterResponse {}))
    }

    async fn get_device(
        &self,
        request: Request<GetDeviceRequest>,
    ) -> Result<Response<GetDeviceResponse>, Status> {
        let request = request.into_inner();
        let device_id = parse_device_id(request.device_id)?;

        let mut registry = self.registry.clone();
        let device = registry
            .get(&device_id)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| Status::not_found("unknown device"))?;
        Ok(Response::new(GetDeviceResponse {
            device: Some(convert::device_to_proto(&device)),
        }))
    }

    type ListDevicesStream = ReceiverStream<Result<DeviceInfo, Status>>;

    async fn list_devices(
        &self,
        request: Request<ListDevicesRequest>,
    ) -> Result<Response<Self::ListDevicesStream>, Status> {
        let request = request.into_inner();
        let filter = convert::status_filter_from_proto(request.status_filter);

        let mut registry = self.registry.clone();
        let devices = registry.list(filter).await.map_err(unavailable)?;
        debug!(devices = devices.len(), "streaming device list");

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for device in devices {
                if tx.send(Ok(convert::device_to_proto(&device))).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
