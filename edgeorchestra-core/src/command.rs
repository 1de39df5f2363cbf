//! The typed command envelope delivered to workers over the heartbeat channel.
//!
//! On the wire a command is a type tag plus a `map<string, string>` parameter
//! bag. Parsing and rendering of that bag happens exactly once, here; the rest
//! of the orchestrator only ever handles the typed [`Command`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{JobId, ModelId};

/// An error returned when a wire parameter bag cannot be parsed into a
/// [`Command`].
#[derive(Error, Debug)]
pub enum CommandParseError {
    #[error("unknown command type `{0}`")]
    UnknownType(String),
    #[error("missing parameter `{0}`")]
    MissingParameter(&'static str),
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// The payload of a `start_training` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTraining {
    pub job_id: JobId,
    pub model_id: ModelId,
    pub round: u32,
    pub partition_index: u32,
    pub partition_total: u32,
    pub architecture: String,
}

/// A command queued for delivery on the next heartbeat response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Ack,
    UpdateInterval { seconds: u32 },
    StartTraining(StartTraining),
    StopTraining { job_id: JobId },
    Shutdown,
}

impl Command {
    /// The wire type tag of this command.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Ack => "ack",
            Command::UpdateInterval { .. } => "update_interval",
            Command::StartTraining(_) => "start_training",
            Command::StopTraining { .. } => "stop_training",
            Command::Shutdown => "shutdown",
        }
    }

    /// Whether this command survives queue overflow. A full command queue
    /// drops its oldest entry, except `shutdown`.
    pub fn is_durable(&self) -> bool {
        matches!(self, Command::Shutdown)
    }

    /// Renders the wire parameter bag of this command.
    pub fn parameters(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        match self {
            Command::Ack | Command::Shutdown => {}
            Command::UpdateInterval { seconds } => {
                params.insert("seconds".into(), seconds.to_string());
            }
            Command::StartTraining(start) => {
                params.insert("job_id".into(), start.job_id.to_string());
                params.insert("model_id".into(), start.model_id.to_string());
                params.insert("round".into(), start.round.to_string());
                params.insert("partition_index".into(), start.partition_index.to_string());
                params.insert("partition_total".into(), start.partition_total.to_string());
                params.insert("architecture".into(), start.architecture.clone());
            }
            Command::StopTraining { job_id } => {
                params.insert("job_id".into(), job_id.to_string());
            }
        }
        params
    }

    /// Parses a command from its wire type tag and parameter bag.
    pub fn from_wire(
        kind: &str,
        params: &HashMap<String, String>,
    ) -> Result<Self, CommandParseError> {
        fn required<'a>(
            params: &'a HashMap<String, String>,
            name: &'static str,
        ) -> Result<&'a str, CommandParseError> {
            params
                .get(name)
                .map(String::as_str)
                .ok_or(CommandParseError::MissingParameter(name))
        }

        fn parse<T: std::str::FromStr>(
            params: &HashMap<String, String>,
            name: &'static str,
        ) -> Result<T, CommandParseError>
        where
            T::Err: std::fmt::Display,
        {
            required(params, name)?
                .parse()
                .map_err(|err: T::Err| CommandParseError::InvalidParameter {
                    name,
                    reason: err.to_string(),
                })
        }

        match kind {
            "ack" => Ok(Command::Ack),
            "shutdown" => Ok(Command::Shutdown),
            "update_interval" => Ok(Command::UpdateInterval {
                seconds: parse(params, "seconds")?,
            }),
            "stop_training" => Ok(Command::StopTraining {
                job_id: parse(params, "job_id")?,
            }),
            "start_training" => Ok(Command::StartTraining(StartTraining {
                job_id: parse(params, "job_id")?,
                model_id: parse(params, "model_id")?,
                round: parse(params, "round")?,
                partition_index: parse(params, "partition_index")?,
                partition_total: parse(params, "partition_total")?,
                architecture: required(params, "architecture")?.to_string(),
            })),
            other => Err(CommandParseError::UnknownType(other.to_string())),
        }
    }
}
