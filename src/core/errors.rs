use thiserror::Error;

use super::events::EntityKind;
use super::models::AgentType;

/// Why a single incoming record was dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("malformed {kind} record: {reason}")]
    Malformed { kind: EntityKind, reason: String },

    #[error("{kind} record has an empty id")]
    MissingIdentity { kind: EntityKind },

    #[error("{kind} record {id} belongs to run {found}, not {expected}")]
    ForeignRun {
        kind: EntityKind,
        id: String,
        expected: String,
        found: String,
    },

    #[error("session {id} reports progress {progress}, outside 0..=100")]
    ProgressOutOfRange { id: String, progress: u8 },

    #[error("session {incoming} duplicates agent {agent} already tracked by session {existing}")]
    DuplicateAgentSession {
        agent: AgentType,
        existing: String,
        incoming: String,
    },
}

/// Failure of one of the two data sources. Always transient from the view's side.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("undecodable payload: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("update channel closed")]
    Closed,

    #[error("no answer within {0:?}")]
    TimedOut(std::time::Duration),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Failure of an outbound request to the scanning backend.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("backend response did not include a run id")]
    MissingRunId,

    #[error("run {0} is not known to the snapshot source")]
    UnknownRun(String),

    #[error(transparent)]
    Source(#[from] SourceError),
}
