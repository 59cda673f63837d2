use std::num::ParseIntError;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    #[snafu(display("wire id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: ParseIntError,
    },
    #[snafu(display("session id must not be empty"))]
    EmptySessionId { stage: &'static str },
    #[snafu(display("failed to decode inbound frame on `{stage}`: {source}"))]
    DecodeFrame {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("inbound frame carries no string `type` tag"))]
    MissingTag { stage: &'static str },
    #[snafu(display("failed to encode `{tag}` message on `{stage}`: {source}"))]
    EncodeMessage {
        stage: &'static str,
        tag: &'static str,
        source: serde_json::Error,
    },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
