use parley_protocol::RecordId;
use snafu::Snafu;

use crate::transport::ConnectionState;
use crate::turn::TurnId;

/// Why a resume negotiation did not produce a binding.
///
/// `Clone` so every caller joined onto one negotiation observes the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ResumeFailure {
    #[snafu(
        context(name(ResumeConnectivitySnafu)),
        display("channel unavailable for resume: {reason}")
    )]
    Connectivity { reason: String },
    #[snafu(display("conversation selection changed before the resume completed"))]
    SelectionChanged,
    #[snafu(display("server rejected the resume: {reason}"))]
    Rejected { reason: String },
    #[snafu(display("resume negotiation was dropped without an outcome"))]
    Abandoned,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("channel is {state}, cannot `{stage}`"))]
    Connectivity {
        stage: &'static str,
        state: ConnectionState,
    },
    #[snafu(display("channel refused `{tag}` on `{stage}`"))]
    SendRejected {
        stage: &'static str,
        tag: &'static str,
    },
    #[snafu(display("resume gate failed on `{stage}`: {source}"))]
    Resume {
        stage: &'static str,
        source: ResumeFailure,
    },
    #[snafu(display("server reported: {message}"))]
    ServerReported {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("turn {active} is still in flight"))]
    TurnInFlight {
        stage: &'static str,
        active: TurnId,
    },
    #[snafu(display("a submission is already waiting for the resume gate"))]
    SubmissionGated { stage: &'static str },
    #[snafu(display("nothing to send: message text and attachments are empty"))]
    EmptyInput { stage: &'static str },
    #[snafu(display("record {record_id} is not tracked locally or has no persisted binding"))]
    UnknownRecord {
        stage: &'static str,
        record_id: RecordId,
    },
    #[snafu(display("server url '{url}' is invalid: {source}"))]
    InvalidEndpoint {
        stage: &'static str,
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("history fetch failed on `{stage}`: {message}"))]
    History {
        stage: &'static str,
        message: String,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;
