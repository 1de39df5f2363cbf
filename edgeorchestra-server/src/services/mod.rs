//! The gRPC surface of the orchestrator.

pub mod convert;
pub mod device;
pub mod heartbeat;
pub mod model;

use std::str::FromStr;

use tonic::{
    metadata::MetadataValue,
    transport::{Certificate, Identity, Server, ServerTlsConfig},
    Request,
    Status,
};
use tracing::info;

use edgeorchestra_core::DeviceId;
use edgeorchestra_proto::{
    device_registry_server::DeviceRegistryServer,
    heartbeat_service_server::HeartbeatServiceServer,
    model_service_server::ModelServiceServer,
};

use crate::{
    coordinator::Fleet,
    liveness::LivenessTracker,
    registry::DeviceRegistry,
    services::{device::DeviceApi, heartbeat::HeartbeatApi, model::ModelApi},
    settings::ApiSettings,
    storage::{Storage, StorageError},
};

/// Maps an opaque storage failure onto the retriable `unavailable` code.
pub(crate) fn unavailable(err: StorageError) -> Status {
    Status::unavailable(err.to_string())
}

/// Parses the wire form of a device id.
pub(crate) fn parse_device_id(
    device_id: Option<edgeorchestra_proto::DeviceId>,
) -> Result<DeviceId, Status> {
    let device_id = device_id.ok_or_else(|| Status::invalid_argument("missing device_id"))?;
    DeviceId::from_str(&device_id.value)
        .map_err(|_| Status::invalid_argument("malformed device_id"))
}

/// Requires `x-api-key` metadata on every call when a key is configured.
fn check_api_key(api_key: &Option<String>, request: &Request<()>) -> Result<(), Status> {
    let expected = match api_key {
        Some(expected) => expected,
        None => return Ok(()),
    };
    let expected = MetadataValue::from_str(expected)
        .map_err(|_| Status::internal("configured api key is not valid metadata"))?;
    match request.metadata().get("x-api-key") {
        Some(value) if value == expected => Ok(()),
        _ => Err(Status::unauthenticated("missing or invalid x-api-key")),
    }
}

/// Serves the device registry, heartbeat and model services until the task
/// is dropped.
pub async fn serve<T>(
    settings: ApiSettings,
    registry: DeviceRegistry<T>,
    liveness: LivenessTracker<T>,
    fleet: Fleet<T>,
    store: T,
    chunk_size: usize,
) -> anyhow::Result<()>
where
    T: Storage,
{
    let device_api = DeviceApi::new(registry.clone(), liveness.clone());
    let heartbeat_api = HeartbeatApi::new(registry, liveness, fleet.clone());
    let model_api = ModelApi::new(store, fleet, chunk_size);

    let api_key = settings.api_key.clone();
    let interceptor = move |request: Request<()>| {
        check_api_key(&api_key, &request)?;
        Ok(request)
    };

    let mut builder = Server::builder();
    if let (Some(cert), Some(key)) = (&settings.tls_certificate, &settings.tls_key) {
        let cert = tokio::fs::read(cert).await?;
        let key = tokio::fs::read(key).await?;
        let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
        if let Some(client_ca) = &settings.tls_client_auth {
            let ca = tokio::fs::read(client_ca).await?;
            tls = tls.client_ca_root(Certificate::from_pem(ca));
        }
        builder = builder.tls_config(tls)?;
    }

    info!(address = %settings.bind_address, "gRPC server listening");
    builder
        .add_service(DeviceRegistryServer::with_interceptor(
            device_api,
            interceptor.clone(),
        ))
        .add_service(HeartbeatServiceServer::with_interceptor(
            heartbeat_api,
            interceptor.clone(),
        ))
        .add_service(ModelServiceServer::with_interceptor(model_api, interceptor))
        .serve(settings.bind_address)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_not_required_when_unset() {
        let request = Request::new(());
        assert!(check_api_key(&None, &request).is_ok());
    }

    #[test]
    fn test_api_key_checked_when_set() {
        let key = Some("sekrit".to_string());

        let request = Request::new(());
        assert!(check_api_key(&key, &request).is_err());

        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert("x-api-key", MetadataValue::from_str("sekrit").unwrap());
        assert!(check_api_key(&key, &request).is_ok());

        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert("x-api-key", MetadataValue::from_str("wrong").unwrap());
        assert!(check_api_key(&key, &request).is_err());
    }
}
