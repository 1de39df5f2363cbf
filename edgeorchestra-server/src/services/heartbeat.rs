//! The duplex heartbeat gRPC service.
//!
//! One session per connected worker. Telemetry flows up, commands flow down,
//! and a command is only ever delivered in response to a request, so
//! responses stay strictly ordered with respect to requests. The outbound
//! channel holds at most one response ahead of the client; a slow reader
//! backpressures the whole session instead of growing a buffer.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use edgeorchestra_proto::{
    heartbeat_service_server::HeartbeatService,
    HeartbeatRequest,
    HeartbeatResponse,
};

use crate::{
    coordinator::Fleet,
    liveness::{IngestError, LivenessTracker},
    registry::DeviceRegistry,
    services::{convert, parse_device_id, unavailable},
    storage::Storage,
};

/// The heartbeat session manager.
pub struct HeartbeatApi<T> {
    registry: DeviceRegistry<T>,
    liveness: LivenessTracker<T>,
    fleet: Fleet<T>,
}

impl<T> HeartbeatApi<T>
where
    T: Storage,
{
    pub fn new(registry: DeviceRegistry<T>, liveness: LivenessTracker<T>, fleet: Fleet<T>) -> Self {
        Self {
            registry,
            liveness,
            fleet,
        }
    }

    /// Server telemetry stamped onto every response; empty before the first
    /// aggregate exists.
    fn telemetry_metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        if let Some(telemetry) = self.fleet.latest_telemetry() {
            if let Some(accuracy) = telemetry.server_accuracy {
                metadata.insert("server_accuracy".into(), format!("{:.4}", accuracy));
            }
            if let Some(loss) = telemetry.server_loss {
                metadata.insert("server_loss".into(), format!("{:.4}", loss));
            }
            metadata.insert("round".into(), telemetry.round.to_string());
            metadata.insert("job_id".into(), telemetry.job_id.to_string());
        }
        metadata
    }

    /// Handles one heartbeat request: touch the registry row, ingest the
    /// liveness snapshot, pop at most one queued command, stamp metadata.
    async fn handle_request(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, Status> {
        let device_id = parse_device_id(request.device_id)?;
        let metrics = convert::metrics_from_proto(request.metrics);

        let mut registry = self.registry.clone();
        registry
            .touch(&device_id, &metrics)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| Status::not_found("unknown device"))?;

        let mut liveness = self.liveness.clone();
        liveness
            .ingest(&device_id, request.sequence, &metrics)
            .await
            .map_err(|err| match err {
                IngestError::Stale(stale) => {
                    warn!(device_id = %device_id, error = %stale, "dropping stale stream");
                    Status::failed_precondition(stale.to_string())
                }
                IngestError::Storage(err) => unavailable(err),
            })?;

        let command = liveness.pop_command(&device_id).await.map_err(unavailable)?;
        if let Some(command) = &command {
            info!(device_id = %device_id, command = command.kind(), "delivering command");
        }
        Ok(convert::heartbeat_response(
            command,
            request.sequence,
            self.telemetry_metadata(),
        ))
    }
}

#[tonic::async_trait]
impl<T> HeartbeatService for HeartbeatApi<T>
where
    T: Storage,
{
    type HeartbeatStream = ReceiverStream<Result<HeartbeatResponse, Status>>;

    async fn heartbeat(
        &self,
        request: Request<Streaming<HeartbeatRequest>>,
    ) -> Result<Response<Self::HeartbeatStream>, Status> {
        let mut inbound = request.into_inner();
        // Depth 1: never more than one response buffered ahead.
        let (tx, rx) = mpsc::channel(1);

        let api = HeartbeatApi {
            registry: self.registry.clone(),
            liveness: self.liveness.clone(),
            fleet: self.fleet.clone(),
        };
        tokio::spawn(async move {
            loop {
                let request = match inbound.message().await {
                    Ok(Some(request)) => request,
                    // Client half-closed: drain is implicit, every accepted
                    // request was already answered in order.
                    Ok(None) => {
                        debug!("heartbeat stream closed by client");
                        break;
                    }
                    Err(status) => {
                        debug!(error = %status, "heartbeat stream read failed");
                        break;
                    }
                };
                let response = api.handle_request(request).await;
                let terminal = response.is_err();
                if tx.send(response).await.is_err() {
                    // Client stopped reading responses.
                    break;
                }
                if terminal {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
