//! The model transport gRPC service.
//!
//! Serves chunked model downloads, accepts weight-delta submissions and
//! offers an admin-only streamed upload.

use std::{collections::BTreeMap, str::FromStr};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use edgeorchestra_core::{architecture, delta, ModelId};
use edgeorchestra_proto::{
    model_chunk,
    model_service_server::ModelService,
    upload_model_chunk,
    DataChunk,
    DownloadModelRequest,
    ModelChunk,
    ModelMetadata,
    SubmitGradientsRequest,
    SubmitGradientsResponse,
    UploadModelChunk,
    UploadModelResponse,
};

use crate::{
    coordinator::{
        fleet::SubmitError,
        requests::{RequestError, SubmissionRequest},
        Fleet,
    },
    services::{parse_device_id, unavailable},
    storage::{JobStorage, ModelStorage, Storage},
};

/// Model download, gradient submission and admin upload.
pub struct ModelApi<T> {
    store: T,
    fleet: Fleet<T>,
    chunk_size: usize,
}

impl<T> ModelApi<T>
where
    T: Storage,
{
    pub fn new(store: T, fleet: Fleet<T>, chunk_size: usize) -> Self {
        Self {
            store,
            fleet,
            chunk_size,
        }
    }

    /// Validates a submitted blob against the job's architecture so workers
    /// learn about malformed payloads synchronously.
    async fn check_blob(&self, model_id: &ModelId, blob: &[u8]) -> Result<(), Status> {
        let handle = self
            .fleet
            .job_for_model(model_id)
            .ok_or_else(|| Status::not_found("no running job distributes this model"))?;
        let mut store = self.store.clone();
        let record = store
            .job(&handle.job_id)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| Status::internal("job row missing"))?;
        let arch = architecture::get(&record.architecture)
            .map_err(|err| Status::internal(err.to_string()))?;

        let bank = delta::decode(blob)
            .map_err(|err| Status::failed_precondition(format!("invalid delta blob: {}", err)))?;
        bank.check_architecture(arch)
            .map_err(|err| Status::failed_precondition(format!("layer mismatch: {}", err)))?;
        Ok(())
    }
}

fn submit_status(err: SubmitError) -> Status {
    match err {
        SubmitError::UnknownModel(model_id) => {
            Status::not_found(format!("no running job distributes model {}", model_id))
        }
        SubmitError::Request(RequestError::AlreadySubmitted) => {
            Status::already_exists("already_submitted")
        }
        SubmitError::Request(RequestError::RoundNotOpen) => {
            Status::failed_precondition("the round is not accepting submissions")
        }
        SubmitError::Request(RequestError::NotAParticipant) => {
            Status::failed_precondition("device is not a participant of this round")
        }
        SubmitError::Request(RequestError::JobTerminated) => {
            Status::failed_precondition("the job is no longer running")
        }
        SubmitError::Request(RequestError::InternalError(reason)) => Status::internal(reason),
        SubmitError::Request(RequestError::Storage(err)) => Status::unavailable(err.to_string()),
    }
}

#[tonic::async_trait]
impl<T> ModelService for ModelApi<T>
where
    T: Storage,
{
    type DownloadModelStream = ReceiverStream<Result<ModelChunk, Status>>;

    async fn download_model(
        &self,
        request: Request<DownloadModelRequest>,
    ) -> Result<Response<Self::DownloadModelStream>, Status> {
        let request = request.into_inner();
        let model_id = ModelId::from_str(&request.model_id)
            .map_err(|_| Status::not_found("unknown model"))?;

        let mut store = self.store.clone();
        let bytes = store
            .model(&model_id)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| Status::not_found("unknown model"))?;

        let chunk_size = self.chunk_size;
        let total_chunks = (bytes.len() + chunk_size - 1) / chunk_size;
        debug!(
            model_id = %model_id,
            size = bytes.len(),
            total_chunks,
            "streaming model download"
        );

        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(async move {
            let metadata = ModelChunk {
                payload: Some(model_chunk::Payload::Metadata(ModelMetadata {
                    model_id: model_id.to_string(),
                    size_bytes: bytes.len() as u64,
                    total_chunks: total_chunks as u32,
                    chunk_size: chunk_size as u32,
                    // The content address is the payload digest.
                    sha256: model_id.to_string(),
                })),
            };
            if tx.send(Ok(metadata)).await.is_err() {
                return;
            }
            for (index, window) in bytes.chunks(chunk_size).enumerate() {
                let chunk = ModelChunk {
                    payload: Some(model_chunk::Payload::Chunk(DataChunk {
                        chunk_index: index as u32,
                        data: window.to_vec(),
                    })),
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn submit_gradients(
        &self,
        request: Request<SubmitGradientsRequest>,
    ) -> Result<Response<SubmitGradientsResponse>, Status> {
        let request = request.into_inner();
        let device_id = parse_device_id(request.device_id)?;
        let model_id = ModelId::from_str(&request.model_id)
            .map_err(|_| Status::not_found("unknown model"))?;

        if request.gradients.is_empty() {
            return Err(Status::failed_precondition("empty gradients payload"));
        }
        if request.num_samples == 0 {
            return Err(Status::failed_precondition("num_samples must be positive"));
        }
        if request.training_round == 0 {
            return Err(Status::failed_precondition("training_round must be positive"));
        }

        self.check_blob(&model_id, &request.gradients).await?;

        let metrics: BTreeMap<String, f64> = request
            .metrics
            .into_iter()
            .map(|(key, value)| (key, f64::from(value)))
            .collect();
        let submission = SubmissionRequest {
            device_id,
            round: request.training_round,
            blob: request.gradients,
            num_samples: request.num_samples,
            metrics,
        };

        self.fleet
            .submit(&model_id, submission)
            .await
            .map_err(|err| {
                warn!(device_id = %device_id, error = %err, "submission rejected");
                submit_status(err)
            })?;

        info!(
            device_id = %device_id,
            model_id = %model_id,
            round = request.training_round,
            num_samples = request.num_samples,
            "gradients received"
        );
        Ok(Response::new(SubmitGradientsResponse {
            accepted: true,
            reason: String::new(),
        }))
    }

    async fn upload_model(
        &self,
        request: Request<Streaming<UploadModelChunk>>,
    ) -> Result<Response<UploadModelResponse>, Status> {
        let mut inbound = request.into_inner();
        let mut metadata: Option<ModelMetadata> = None;
        let mut bytes = Vec::new();

        while let Some(chunk) = inbound.message().await? {
            match chunk.payload {
                Some(upload_model_chunk::Payload::Metadata(meta)) => {
                    metadata = Some(meta);
                }
                Some(upload_model_chunk::Payload::Chunk(data)) => {
                    bytes.extend_from_slice(&data.data);
                }
                None => {}
            }
        }

        let metadata = metadata
            .ok_or_else(|| Status::failed_precondition("missing model metadata frame"))?;
        if metadata.size_bytes != 0 && metadata.size_bytes != bytes.len() as u64 {
            return Err(Status::failed_precondition(format!(
                "size mismatch: metadata says {}, received {}",
                metadata.size_bytes,
                bytes.len()
            )));
        }

        let mut store = self.store.clone();
        let model_id = store.put_model(&bytes).await.map_err(unavailable)?;
        if !metadata.sha256.is_empty() && metadata.sha256 != model_id.as_str() {
            return Err(Status::failed_precondition(
                "uploaded bytes do not match the declared sha256",
            ));
        }

        info!(model_id = %model_id, size = bytes.len(), "model uploaded");
        Ok(Response::new(UploadModelResponse {
            model_id: model_id.to_string(),
            size_bytes: bytes.len() as u64,
        }))
    }
}
