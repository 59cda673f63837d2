use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("api base url '{url}' is invalid: {source}"))]
    InvalidBaseUrl {
        stage: &'static str,
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("`{stage}` returned http {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("could not decode the `{stage}` response: {source}"))]
    Decode {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("`{stage}` reported failure: {message}"))]
    Unsuccessful {
        stage: &'static str,
        message: String,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;
