//! Wire types for the worker request/response protocol.
//!
//! Worker handles talk to their worker through serialized messages only; the
//! payloads cross the channel as bytes so the transport can be swapped for a
//! real process boundary without touching either side.

use crate::blocks::{Header, ProcessResult};
use crate::runtime::telemetry::WorkerLoad;
use crate::services::FetchError;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum WorkerRequest {
    FetchBlock { height: u64 },
    ProcessBlock { height: u64 },
    Status,
    AbortFetching,
    Terminate,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum WorkerResponse {
    Fetched(Result<Header, WireFetchError>),
    Processed(Result<ProcessResult, String>),
    Status(WorkerLoad),
    AbortAcknowledged,
    Terminating,
}

/// Serializable projection of [`FetchError`]; source errors flatten to text.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum WireFetchError {
    Flushed,
    BlockUnavailable { height: u64 },
    Other(String),
}

impl From<FetchError> for WireFetchError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Flushed => WireFetchError::Flushed,
            FetchError::BlockUnavailable { height } => WireFetchError::BlockUnavailable { height },
            FetchError::Source(err) => WireFetchError::Other(format!("{err:#}")),
        }
    }
}

impl From<WireFetchError> for FetchError {
    fn from(err: WireFetchError) -> Self {
        match err {
            WireFetchError::Flushed => FetchError::Flushed,
            WireFetchError::BlockUnavailable { height } => {
                FetchError::BlockUnavailable { height }
            }
            WireFetchError::Other(message) => FetchError::Source(anyhow!(message)),
        }
    }
}

/// One in-flight request: serialized payload plus its reply slot.
pub(crate) struct Envelope {
    pub(crate) payload: Vec<u8>,
    pub(crate) reply: oneshot::Sender<Vec<u8>>,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).context("failed to encode worker message")
}

pub(crate) fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    serde_json::from_slice(bytes).context("failed to decode worker message")
}
