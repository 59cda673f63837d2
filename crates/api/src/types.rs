use parley_protocol::{ConversationId, ConversationRef, RecordId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{success, data, ...}` wrapper used by every endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl<T> Envelope<T> {
    pub(crate) fn failure_message(&self) -> String {
        self.detail
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "no detail provided".to_string())
    }
}

/// One persisted exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryRecord {
    pub id: RecordId,
    pub session_id: SessionId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub user_input: Option<String>,
    #[serde(default)]
    pub ai_response: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub attachments: Option<Value>,
    #[serde(default)]
    pub usage: Option<Value>,
}

impl HistoryRecord {
    pub fn conversation(&self) -> Option<ConversationRef> {
        self.conversation_id
            .map(|conversation_id| ConversationRef::new(self.session_id.clone(), conversation_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub conversation: Option<ConversationRef>,
    pub limit: u32,
}

impl HistoryQuery {
    pub fn for_conversation(conversation: ConversationRef, limit: u32) -> Self {
        Self {
            conversation: Some(conversation),
            limit,
        }
    }

    pub(crate) fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("limit", self.limit.to_string())];
        if let Some(conversation) = &self.conversation {
            params.push(("session_id", conversation.session_id.to_string()));
            params.push((
                "conversation_id",
                conversation.conversation_id.get().to_string(),
            ));
        }
        params
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThreadSummary {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub first_time: Option<String>,
    #[serde(default)]
    pub last_time: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub first_user_input: Option<String>,
}

impl ThreadSummary {
    pub fn conversation(&self) -> ConversationRef {
        ConversationRef::new(self.session_id.clone(), self.conversation_id)
    }

    /// First line of the opening message, for list rendering.
    pub fn title(&self) -> &str {
        self.first_user_input
            .as_deref()
            .and_then(|input| input.lines().next())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .unwrap_or("(untitled)")
    }
}

/// Read-only snapshot behind a share link.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareSnapshot {
    pub share_id: String,
    pub readonly: bool,
    pub records: Vec<HistoryRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ShareEnvelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Vec<HistoryRecord>,
    #[serde(default)]
    pub share_id: Option<String>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CreateShareRequest {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CreateShareResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub share_id: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}
