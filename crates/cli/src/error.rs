use parley_api::ApiError;
use parley_protocol::ProtocolError;
use parley_session::SessionError;
use snafu::Snafu;

use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("settings failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("session failed on `{stage}`: {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("api call failed on `{stage}`: {source}"))]
    Api {
        stage: &'static str,
        source: ApiError,
    },
    #[snafu(display("invalid id on `{stage}`: {source}"))]
    InvalidId {
        stage: &'static str,
        source: ProtocolError,
    },
    #[snafu(display("usage: {usage}"))]
    Usage {
        stage: &'static str,
        usage: &'static str,
    },
    #[snafu(display("no conversation is selected"))]
    NoConversation { stage: &'static str },
    #[snafu(display("session task is gone on `{stage}`"))]
    SessionGone { stage: &'static str },
    #[snafu(display("terminal io failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type CliResult<T> = Result<T, CliError>;
