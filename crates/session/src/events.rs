use parley_protocol::{Attachment, ConversationRef, RecordId, SessionId};

use crate::error::ResumeFailure;
use crate::transport::{ConnectionGeneration, ConnectionState, ReconnectAttempt};
use crate::turn::{TurnId, TurnStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// What the engine tells the rendering layer, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ConnectionChanged {
        state: ConnectionState,
        generation: ConnectionGeneration,
    },
    Reconnecting(ReconnectAttempt),
    /// The transport stopped retrying; a manual reconnect is required.
    GaveUp {
        attempts: u32,
    },
    SessionEstablished(SessionId),
    ResumeConfirmed(ConversationRef),
    ResumeFailed(ResumeFailure),
    /// A submission parked behind the resume gate was never transmitted.
    SubmissionDropped {
        text: String,
        attachments: Vec<Attachment>,
        reason: String,
    },
    TurnStarted(TurnId),
    ResponseDelta {
        turn: TurnId,
        chunk: String,
    },
    ThinkingDelta {
        turn: TurnId,
        chunk: String,
    },
    /// Flow, usage, acknowledgement or phase changed without new text.
    TurnUpdated(TurnId),
    TurnFinished {
        turn: TurnId,
        status: TurnStatus,
    },
    TurnsTruncated {
        from: RecordId,
        removed: usize,
    },
    RecordBound {
        turn: TurnId,
        record_id: RecordId,
    },
    ModelSwitched {
        model: String,
        reason: Option<String>,
    },
    CreditsUpdated {
        remaining: Option<i64>,
    },
    Notice {
        level: NoticeLevel,
        message: String,
    },
    /// Local turns may have diverged from the server; history for this ref should be refetched.
    HistoryRefreshRequested(ConversationRef),
    HistoryReplaced {
        conversation: ConversationRef,
        turns: usize,
    },
}

impl EngineEvent {
    pub(crate) fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self::Notice {
            level,
            message: message.into(),
        }
    }
}
