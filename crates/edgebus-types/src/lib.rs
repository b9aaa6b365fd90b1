use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error returned by user-supplied envelope converters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Message envelope exchanged with the bus client.
///
/// The bus treats `data` as opaque bytes; only the converters handed to the
/// edge know how to turn it into a domain value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Server-assigned message id. Empty until the bus accepts a publish.
    pub id: String,
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Set by the bus when the message is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_time: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Create an envelope carrying `data` and no attributes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Replace the message id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a string attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Build an envelope whose payload is the JSON encoding of `value`.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Decode the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

/// Result of asking the bus to acknowledge a received envelope.
///
/// Wire codes follow the bus's exactly-once status enumeration; anything
/// outside the known range is carried verbatim in [`AckOutcome::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckOutcome {
    Success,
    InvalidAckId,
    PermissionDenied,
    FailedPrecondition,
    Other,
    Unknown(i32),
}

impl AckOutcome {
    /// Map a raw wire code onto an outcome.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => AckOutcome::Success,
            1 => AckOutcome::PermissionDenied,
            2 => AckOutcome::FailedPrecondition,
            3 => AckOutcome::InvalidAckId,
            4 => AckOutcome::Other,
            raw => AckOutcome::Unknown(raw),
        }
    }

    /// The raw wire code for this outcome.
    pub fn code(self) -> i32 {
        match self {
            AckOutcome::Success => 0,
            AckOutcome::PermissionDenied => 1,
            AckOutcome::FailedPrecondition => 2,
            AckOutcome::InvalidAckId => 3,
            AckOutcome::Other => 4,
            AckOutcome::Unknown(raw) => raw,
        }
    }

    pub fn is_success(self) -> bool {
        self == AckOutcome::Success
    }
}

/// Displays the raw wire code.
impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Failures reported by a bus client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("context canceled")]
    Cancelled,

    #[error("bus channel closed")]
    Closed,

    #[error("rejected by bus: {0}")]
    Rejected(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("subscription already has an active receiver")]
    AlreadyReceiving,

    #[error("no async runtime available")]
    NoRuntime,

    #[error("bus transport error: {0}")]
    Transport(String),
}

/// Every anomaly the edge routes to its error sink.
///
/// The rendered text of each variant is stable; log matchers downstream rely
/// on the prefixes.
#[derive(Error, Debug)]
pub enum EdgeError {
    /// The outbound converter rejected a value; nothing was published.
    #[error("got err from e.convertTo: {0}")]
    ConvertTo(#[source] BoxError),

    /// The bus failed, or the edge context ended, before a publish was confirmed.
    #[error("got err publishing: {0}")]
    Publish(#[source] BusError),

    /// Retrieving the ack outcome failed.
    #[error("got err from r.Get: {0}")]
    AckResult(#[source] BusError),

    /// The ack completed with a non-success outcome.
    #[error("{}", ack_rejection_message(.id, .outcome))]
    AckRejected { id: String, outcome: AckOutcome },

    /// The inbound converter rejected an acknowledged envelope.
    #[error("got err from e.convert: {0}")]
    Convert(#[source] BoxError),

    /// The bus client's receive loop exited with an error.
    #[error("got err from sub.Receive: {0}")]
    Receive(#[source] BusError),

    /// Every receiver of the delivery channel was dropped.
    #[error("got err delivering: delivery channel closed. ID: {id}")]
    Deliver { id: String },
}

impl EdgeError {
    /// Id of the envelope this error is attributable to, when there is one.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            EdgeError::AckRejected { id, .. } | EdgeError::Deliver { id } => Some(id),
            _ => None,
        }
    }
}

fn ack_rejection_message(id: &str, outcome: &AckOutcome) -> String {
    let response = match outcome {
        AckOutcome::InvalidAckId => "Invalid",
        AckOutcome::PermissionDenied => "Permission Denied",
        AckOutcome::FailedPrecondition => "Failed Precondition",
        AckOutcome::Other => "Other",
        AckOutcome::Success | AckOutcome::Unknown(_) => {
            return format!("message failed to ack with unknown status. ID: {id}, status: {outcome}");
        }
    };
    format!("message failed to ack with response of {response}. ID: {id}")
}
