use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt};

use super::error::{DecodeFrameSnafu, EncodeMessageSnafu, MissingTagSnafu, ProtocolResult};
use super::ids::{ConversationId, RecordId, SessionId};

/// A reference to a persisted conversation the client wants to keep streaming into.
///
/// `session_id` names the session the conversation was created under, which is never the live
/// session of the current connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationRef {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
}

impl ConversationRef {
    pub fn new(session_id: SessionId, conversation_id: ConversationId) -> Self {
        Self {
            session_id,
            conversation_id,
        }
    }
}

/// File uploaded out of band before the message referencing it is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

impl Attachment {
    pub fn new(filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            url: url.into(),
            mime_type: None,
            size: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn is_image(&self) -> bool {
        if let Some(mime_type) = &self.mime_type {
            return mime_type.trim().to_ascii_lowercase().starts_with("image/");
        }

        self.filename
            .rsplit_once('.')
            .map(|(_, extension)| {
                IMAGE_EXTENSIONS
                    .iter()
                    .any(|known| extension.eq_ignore_ascii_case(known))
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Multimodal content part in the OpenAI-compatible shape the backend forwards to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    UserMsg {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        content_parts: Vec<ContentPart>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    ReplayEdit {
        session_id: SessionId,
        conversation_id: ConversationId,
        from_record_id: RecordId,
        new_user_input: String,
    },
    ResumeConversation {
        session_id: SessionId,
        conversation_id: ConversationId,
    },
    SwitchModel {
        model: String,
    },
    Pause,
}

impl ClientMessage {
    /// Builds a `user_msg`, switching to structured parts when any attachment is an image.
    pub fn user_message(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        let text = text.into();
        let images = attachments
            .iter()
            .filter(|attachment| attachment.is_image())
            .map(|attachment| ContentPart::image(attachment.url.clone()))
            .collect::<Vec<_>>();

        let content_parts = if images.is_empty() {
            Vec::new()
        } else {
            let mut parts = Vec::with_capacity(images.len() + 1);
            if !text.trim().is_empty() {
                parts.push(ContentPart::text(text.clone()));
            }
            parts.extend(images);
            parts
        };

        Self::UserMsg {
            content: Some(text),
            content_parts,
            attachments,
        }
    }

    pub fn resume(conversation: &ConversationRef) -> Self {
        Self::ResumeConversation {
            session_id: conversation.session_id.clone(),
            conversation_id: conversation.conversation_id,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::UserMsg { .. } => "user_msg",
            Self::ReplayEdit { .. } => "replay_edit",
            Self::ResumeConversation { .. } => "resume_conversation",
            Self::SwitchModel { .. } => "switch_model",
            Self::Pause => "pause",
        }
    }

    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).context(EncodeMessageSnafu {
            stage: "encode-client-message",
            tag: self.tag(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionInfo {
        session_id: SessionId,
    },
    ResumeOk {
        session_id: SessionId,
        conversation_id: ConversationId,
    },
    ResumeError {
        #[serde(default, alias = "content")]
        reason: String,
    },
    EditOk {
        session_id: SessionId,
        conversation_id: ConversationId,
    },
    EditError {
        #[serde(default)]
        content: String,
    },
    ModelSwitched {
        model: String,
        #[serde(default)]
        reason: Option<String>,
    },
    ModelSwitchError {
        #[serde(default)]
        content: String,
    },
    UserMsgReceived {
        #[serde(default)]
        content: String,
    },
    CreditsUpdate {
        #[serde(default)]
        remaining: Option<i64>,
    },
    AiThinkingStart {
        #[serde(default)]
        content: String,
    },
    AiThinkingChunk {
        #[serde(default)]
        content: String,
    },
    AiThinkingEnd {
        #[serde(default)]
        content: String,
    },
    ToolPlan {
        #[serde(default)]
        content: String,
        #[serde(default)]
        tool_count: usize,
    },
    ToolStart {
        #[serde(deserialize_with = "loose_string")]
        tool_id: String,
        #[serde(default)]
        tool_name: String,
        #[serde(default)]
        tool_args: Value,
        #[serde(default)]
        progress: Option<String>,
    },
    ToolEnd {
        #[serde(deserialize_with = "loose_string")]
        tool_id: String,
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        result: String,
    },
    ToolError {
        #[serde(deserialize_with = "loose_string")]
        tool_id: String,
        #[serde(default)]
        error: String,
    },
    FallbackTriggered {
        #[serde(default)]
        content: String,
        #[serde(default)]
        error_count: u32,
    },
    AiResponseStart {
        #[serde(default)]
        content: String,
    },
    AiResponseChunk {
        #[serde(default)]
        content: String,
    },
    AiResponseEnd {
        #[serde(default)]
        content: String,
    },
    TokenUsage(TokenUsage),
    RecordSaved {
        record_id: RecordId,
        session_id: SessionId,
        conversation_id: ConversationId,
    },
    Error {
        #[serde(default)]
        content: String,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        remaining: Option<i64>,
        #[serde(default)]
        required: Option<i64>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::SessionInfo { .. } => "session_info",
            Self::ResumeOk { .. } => "resume_ok",
            Self::ResumeError { .. } => "resume_error",
            Self::EditOk { .. } => "edit_ok",
            Self::EditError { .. } => "edit_error",
            Self::ModelSwitched { .. } => "model_switched",
            Self::ModelSwitchError { .. } => "model_switch_error",
            Self::UserMsgReceived { .. } => "user_msg_received",
            Self::CreditsUpdate { .. } => "credits_update",
            Self::AiThinkingStart { .. } => "ai_thinking_start",
            Self::AiThinkingChunk { .. } => "ai_thinking_chunk",
            Self::AiThinkingEnd { .. } => "ai_thinking_end",
            Self::ToolPlan { .. } => "tool_plan",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::ToolError { .. } => "tool_error",
            Self::FallbackTriggered { .. } => "fallback_triggered",
            Self::AiResponseStart { .. } => "ai_response_start",
            Self::AiResponseChunk { .. } => "ai_response_chunk",
            Self::AiResponseEnd { .. } => "ai_response_end",
            Self::TokenUsage(_) => "token_usage",
            Self::RecordSaved { .. } => "record_saved",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ServerMessage),
    /// A tag this client does not know; kept so protocol skew can be logged.
    Unknown { tag: String },
}

impl Inbound {
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_str(frame).context(DecodeFrameSnafu {
            stage: "parse-frame-json",
        })?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context(MissingTagSnafu {
                stage: "read-frame-tag",
            })?;

        let message = serde_json::from_value::<ServerMessage>(value).context(DecodeFrameSnafu {
            stage: "decode-server-message",
        })?;

        Ok(match message {
            ServerMessage::Unknown => Self::Unknown { tag },
            message => Self::Message(message),
        })
    }
}

fn loose_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(raw) => Ok(raw),
        Value::Number(raw) => Ok(raw.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, found {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn decode(value: Value) -> Inbound {
        Inbound::decode(&value.to_string()).unwrap()
    }

    #[test]
    fn unknown_tags_are_reported_not_rejected() {
        let inbound = decode(json!({"type": "pong", "ts": 1}));
        assert_eq!(
            inbound,
            Inbound::Unknown {
                tag: "pong".to_string()
            }
        );
    }

    #[test]
    fn frames_without_tag_fail_to_decode() {
        assert!(Inbound::decode(r#"{"session_id": "S1"}"#).is_err());
        assert!(Inbound::decode("not json").is_err());
    }

    #[test]
    fn tool_events_accept_numeric_ids_and_missing_optionals() {
        let inbound = decode(json!({
            "type": "tool_start",
            "tool_id": 3,
            "tool_name": "stock_daily",
            "tool_args": {"ts_code": "600000.SH"},
            "progress": "1/2"
        }));
        let Inbound::Message(ServerMessage::ToolStart {
            tool_id, tool_args, ..
        }) = inbound
        else {
            panic!("expected tool_start, got {inbound:?}");
        };
        assert_eq!(tool_id, "3");
        assert_eq!(tool_args["ts_code"], "600000.SH");

        let inbound = decode(json!({"type": "tool_error", "tool_id": "call_1"}));
        assert_eq!(
            inbound,
            Inbound::Message(ServerMessage::ToolError {
                tool_id: "call_1".to_string(),
                error: String::new(),
            })
        );
    }

    #[test]
    fn token_usage_is_flat_on_the_wire() {
        let inbound = decode(json!({
            "type": "token_usage",
            "input_tokens": 10,
            "output_tokens": 5,
            "total_tokens": 15
        }));
        assert_eq!(
            inbound,
            Inbound::Message(ServerMessage::TokenUsage(TokenUsage {
                input_tokens: Some(10),
                output_tokens: Some(5),
                total_tokens: Some(15),
            }))
        );
    }

    #[test]
    fn record_saved_carries_the_binding() {
        let inbound = decode(json!({
            "type": "record_saved",
            "record_id": 43,
            "session_id": "S0",
            "conversation_id": 7
        }));
        assert_eq!(
            inbound,
            Inbound::Message(ServerMessage::RecordSaved {
                record_id: RecordId::new(43),
                session_id: SessionId::parse("S0").unwrap(),
                conversation_id: ConversationId::new(7),
            })
        );
    }

    #[test]
    fn user_message_with_images_carries_structured_parts() {
        let message = ClientMessage::user_message(
            "what is on this chart?",
            vec![
                Attachment::new("chart.PNG", "/uploads/chart.png"),
                Attachment::new("notes.csv", "/uploads/notes.csv"),
            ],
        );
        let encoded: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();

        assert_eq!(
            encoded,
            json!({
                "type": "user_msg",
                "content": "what is on this chart?",
                "content_parts": [
                    {"type": "text", "text": "what is on this chart?"},
                    {"type": "image_url", "image_url": {"url": "/uploads/chart.png"}}
                ],
                "attachments": [
                    {"filename": "chart.PNG", "url": "/uploads/chart.png"},
                    {"filename": "notes.csv", "url": "/uploads/notes.csv"}
                ]
            })
        );
    }

    #[test]
    fn control_messages_encode_with_their_tags() {
        assert_eq!(ClientMessage::Pause.encode().unwrap(), r#"{"type":"pause"}"#);

        let conversation = ConversationRef::new(SessionId::parse("S0").unwrap(), 7.into());
        let encoded: Value =
            serde_json::from_str(&ClientMessage::resume(&conversation).encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "resume_conversation", "session_id": "S0", "conversation_id": 7})
        );
    }
}
