use std::sync::Arc;

use parley_protocol::ConversationRef;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt, ensure};
use url::Url;

use crate::error::{
    ApiResult, BuildClientSnafu, DecodeSnafu, InvalidBaseUrlSnafu, RequestSnafu,
    StatusSnafu, UnsuccessfulSnafu,
};
use crate::model::{ModelCache, ModelCatalog, ModelListing};
use crate::types::{
    CreateShareRequest, CreateShareResponse, Envelope, HistoryQuery, HistoryRecord, ShareEnvelope,
    ShareSnapshot, ThreadSummary,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        self
    }
}

/// HTTP collaborators of the session: model catalog, history, threads and share snapshots.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    model_cache: Arc<ModelCache>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> ApiResult<Self> {
        Self::with_cache(config, Arc::new(ModelCache::with_default_ttl()))
    }

    pub fn with_cache(config: ApiConfig, model_cache: Arc<ModelCache>) -> ApiResult<Self> {
        let base_url = Url::parse(&format!("{}/", config.base_url)).context(InvalidBaseUrlSnafu {
            stage: "parse-api-base-url",
            url: config.base_url.clone(),
        })?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(BuildClientSnafu {
                stage: "build-http-client",
            })?;

        Ok(Self {
            http,
            base_url,
            token: config.token,
            model_cache,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Model catalog with fallback: fresh cache, server, stale cache, then a static default.
    ///
    /// Never fails; degraded sources carry a warning instead.
    pub async fn fetch_models(&self) -> ModelCatalog {
        let key = self.base_url.as_str();
        if let Some(listing) = self.model_cache.get_fresh(key).await {
            return ModelCatalog::from_cache_fresh(listing);
        }

        match self.fetch_model_listing().await {
            Ok(listing) => {
                self.model_cache.set(key, listing.clone()).await;
                ModelCatalog::from_server(listing)
            }
            Err(error) => {
                tracing::warn!(error = %error, "model catalog fetch failed");
                let warning = format!("model list unavailable: {error}");
                match self.model_cache.get_any(key).await {
                    Some(listing) => ModelCatalog::from_cache_stale(listing, warning),
                    None => ModelCatalog::from_static_fallback(warning),
                }
            }
        }
    }

    async fn fetch_model_listing(&self) -> ApiResult<ModelListing> {
        let envelope: Envelope<ModelListing> = self
            .send_json(self.request(Method::GET, "api/models")?, "fetch-models")
            .await?;
        unwrap_envelope(envelope, "fetch-models")
    }

    /// Persisted exchanges, oldest first.
    pub async fn fetch_history(&self, query: &HistoryQuery) -> ApiResult<Vec<HistoryRecord>> {
        let request = self
            .request(Method::GET, "api/history")?
            .query(&query.params());
        let envelope: Envelope<Vec<HistoryRecord>> =
            self.send_json(request, "fetch-history").await?;
        let mut records = unwrap_envelope(envelope, "fetch-history")?;
        // Unfiltered listings come back newest first.
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    pub async fn fetch_threads(&self, limit: u32) -> ApiResult<Vec<ThreadSummary>> {
        let request = self
            .request(Method::GET, "api/threads")?
            .query(&[("limit", limit)]);
        let envelope: Envelope<Vec<ThreadSummary>> =
            self.send_json(request, "fetch-threads").await?;
        unwrap_envelope(envelope, "fetch-threads")
    }

    pub async fn delete_thread(&self, conversation: &ConversationRef) -> ApiResult<()> {
        let request = self.request(Method::DELETE, "api/threads")?.query(&[
            ("session_id", conversation.session_id.to_string()),
            (
                "conversation_id",
                conversation.conversation_id.get().to_string(),
            ),
        ]);
        let envelope: Envelope<serde_json::Value> =
            self.send_json(request, "delete-thread").await?;
        ensure!(
            envelope.success,
            UnsuccessfulSnafu {
                stage: "delete-thread",
                message: envelope.failure_message(),
            }
        );
        Ok(())
    }

    pub async fn fetch_share(&self, share_id: &str) -> ApiResult<ShareSnapshot> {
        let mut url = self.endpoint("api/share/s")?;
        // Pushing the id as a segment keeps it percent-encoded.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(share_id);
        }
        let request = self.authorize(self.http.get(url));
        let envelope: ShareEnvelope = self.send_json(request, "fetch-share").await?;
        ensure!(
            envelope.success,
            UnsuccessfulSnafu {
                stage: "fetch-share",
                message: envelope
                    .detail
                    .unwrap_or_else(|| "share not found".to_string()),
            }
        );

        Ok(ShareSnapshot {
            share_id: envelope.share_id.unwrap_or_else(|| share_id.to_string()),
            readonly: envelope.readonly,
            records: envelope.data,
        })
    }

    /// Publishes a read-only snapshot of a conversation; returns the share id.
    pub async fn create_share(&self, conversation: &ConversationRef, limit: u32) -> ApiResult<String> {
        let body = CreateShareRequest {
            session_id: conversation.session_id.clone(),
            conversation_id: Some(conversation.conversation_id),
            limit,
        };
        let request = self.request(Method::POST, "api/share/create")?.json(&body);
        let response: CreateShareResponse = self.send_json(request, "create-share").await?;
        ensure!(
            response.success,
            UnsuccessfulSnafu {
                stage: "create-share",
                message: response
                    .detail
                    .clone()
                    .unwrap_or_else(|| "share was not created".to_string()),
            }
        );
        response.share_id.context(UnsuccessfulSnafu {
            stage: "create-share",
            message: "response carried no share_id".to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> ApiResult<Url> {
        self.base_url.join(path).context(InvalidBaseUrlSnafu {
            stage: "join-endpoint",
            url: format!("{}{path}", self.base_url),
        })
    }

    fn request(&self, method: Method, path: &str) -> ApiResult<RequestBuilder> {
        let url = self.endpoint(path)?;
        Ok(self.authorize(self.http.request(method, url)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        stage: &'static str,
    ) -> ApiResult<T> {
        let response = request.send().await.context(RequestSnafu { stage })?;
        let response = check_status(response, stage).await?;
        response.json::<T>().await.context(DecodeSnafu { stage })
    }
}

async fn check_status(response: Response, stage: &'static str) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    StatusSnafu {
        stage,
        status: status.as_u16(),
        body,
    }
    .fail()
}

fn unwrap_envelope<T>(envelope: Envelope<T>, stage: &'static str) -> ApiResult<T> {
    ensure!(
        envelope.success,
        UnsuccessfulSnafu {
            stage,
            message: envelope.failure_message(),
        }
    );
    envelope.data.context(UnsuccessfulSnafu {
        stage,
        message: "response carried no data".to_string(),
    })
}
