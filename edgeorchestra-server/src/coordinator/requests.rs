//! The request channel into a running job coordinator.
//!
//! Round and submission rows are single-writer: only the coordinator task
//! touches them. Everything else (the model service, admin cancellation)
//! produces requests on this channel and awaits the per-request response.

use std::{
    collections::BTreeMap,
    pin::Pin,
    task::{Context, Poll},
};

use derive_more::From;
use displaydoc::Display;
use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, Span};

use edgeorchestra_core::DeviceId;

use crate::storage::{StorageError, SubmissionAddError};

/// Errors which can occur while the job coordinator handles a request.
#[derive(Debug, Display, Error)]
pub enum RequestError {
    /// The device already submitted for this round.
    AlreadySubmitted,
    /// The round is not accepting submissions.
    RoundNotOpen,
    /// The device is not a participant of this round.
    NotAParticipant,
    /// The job is no longer running.
    JobTerminated,
    /// The request could not be processed due to an internal error: {0}.
    InternalError(&'static str),
    /// Storage request failed: {0}.
    Storage(#[from] StorageError),
}

impl From<SubmissionAddError> for RequestError {
    fn from(err: SubmissionAddError) -> Self {
        match err {
            SubmissionAddError::AlreadySubmitted => RequestError::AlreadySubmitted,
        }
    }
}

/// A weight-delta submission for the round in flight.
#[derive(Debug)]
pub struct SubmissionRequest {
    pub device_id: DeviceId,
    pub round: u32,
    /// The encoded delta blob as received on the wire.
    pub blob: Vec<u8>,
    pub num_samples: u32,
    pub metrics: BTreeMap<String, f64>,
}

/// A request to a running job coordinator.
#[derive(Debug, From)]
pub enum JobRequest {
    Submission(SubmissionRequest),
    Cancel,
}

/// A handle to send requests to a job coordinator.
#[derive(Clone, From, Debug)]
pub struct RequestSender(mpsc::UnboundedSender<(JobRequest, Span, ResponseSender)>);

impl RequestSender {
    /// Sends a request to the job coordinator and awaits its response.
    ///
    /// # Errors
    /// Fails if the coordinator has already shut down and the request channel
    /// has been closed as a result.
    pub async fn request(&self, req: JobRequest, span: Span) -> Result<(), RequestError> {
        let (resp_tx, resp_rx) = oneshot::channel::<Result<(), RequestError>>();
        self.0
            .send((req, span, resp_tx))
            .map_err(|_| RequestError::JobTerminated)?;
        resp_rx.await.map_err(|_| RequestError::JobTerminated)?
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// The channel over which the coordinator responds to a single request.
pub(in crate::coordinator) type ResponseSender = oneshot::Sender<Result<(), RequestError>>;

/// The receiver half of the request channel, owned by the coordinator task.
#[derive(From, Debug)]
pub struct RequestReceiver(mpsc::UnboundedReceiver<(JobRequest, Span, ResponseSender)>);

impl Stream for RequestReceiver {
    type Item = (JobRequest, Span, ResponseSender);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        trace!("RequestReceiver: polling");
        Pin::new(&mut self.get_mut().0).poll_recv(cx)
    }
}

impl RequestReceiver {
    /// Creates a new request channel and returns both halves.
    pub fn new() -> (Self, RequestSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RequestReceiver::from(rx), RequestSender::from(tx))
    }

    /// Closes the channel; senders observe [`RequestError::JobTerminated`].
    pub fn close(&mut self) {
        self.0.close()
    }

    /// Receives the next request.
    pub async fn recv(&mut self) -> Option<(JobRequest, Span, ResponseSender)> {
        self.0.recv().await
    }

    /// Retrieves the next request without blocking. `None` means no request
    /// is pending; `Some(None)` means the channel has shut down.
    pub fn try_recv(&mut self) -> Option<Option<(JobRequest, Span, ResponseSender)>> {
        use tokio::sync::mpsc::error::TryRecvError;
        match self.0.try_recv() {
            Ok(item) => Some(Some(item)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (mut rx, tx) = RequestReceiver::new();

        let responder = tokio::spawn(async move {
            let (req, _span, resp_tx) = rx.recv().await.unwrap();
            assert!(matches!(req, JobRequest::Cancel));
            resp_tx.send(Err(RequestError::RoundNotOpen)).unwrap();
        });

        let result = tx.request(JobRequest::Cancel, Span::none()).await;
        assert!(matches!(result, Err(RequestError::RoundNotOpen)));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_channel_reports_job_terminated() {
        let (rx, tx) = RequestReceiver::new();
        drop(rx);
        let result = tx.request(JobRequest::Cancel, Span::none()).await;
        assert!(matches!(result, Err(RequestError::JobTerminated)));
    }
}
