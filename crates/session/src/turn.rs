//! One user message and the AI response produced for it.
use std::fmt;

use parley_protocol::{Attachment, ConversationRef, RecordId, TokenUsage};
use serde_json::Value;
use snafu::ensure;

use crate::error::{SessionResult, TurnInFlightSnafu};
use crate::flow::{FlowOutcome, ThinkingFlow, ToolStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "turn-{}", self.0)
    }
}

/// Fine-grained lifecycle; `status()` folds it into what a renderer needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Composed,
    Sent,
    Planning,
    ToolExecuting,
    Responding,
    Streaming,
    Completed,
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl TurnPhase {
    pub fn status(&self) -> TurnStatus {
        match self {
            Self::Composed | Self::Sent | Self::Planning | Self::ToolExecuting => {
                TurnStatus::Pending
            }
            Self::Responding | Self::Streaming => TurnStatus::Streaming,
            Self::Completed => TurnStatus::Completed,
            Self::Failed { .. } => TurnStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// Applies one transition deterministically.
    ///
    /// Tool rounds may interleave with an already started response, so tool transitions are
    /// accepted from any submitted, non-terminal phase.
    pub fn apply(&self, transition: TurnTransition) -> TurnTransitionResult {
        if self.is_terminal() {
            return Err(TurnRejection::Finished {
                phase: self.clone(),
                attempted: transition,
            });
        }

        match (self, transition) {
            (Self::Composed, TurnTransition::Submitted) => Ok(Self::Sent),
            (_, TurnTransition::Submitted) => Err(TurnRejection::AlreadySubmitted),
            (Self::Composed, attempted) => Err(TurnRejection::NotSubmitted { attempted }),
            (_, TurnTransition::ToolPlanned) => Ok(Self::Planning),
            (_, TurnTransition::ToolActivity) => Ok(Self::ToolExecuting),
            (Self::Responding | Self::Streaming, TurnTransition::ResponseStarted) => {
                Ok(self.clone())
            }
            (_, TurnTransition::ResponseStarted) => Ok(Self::Responding),
            (_, TurnTransition::Chunk) => Ok(Self::Streaming),
            (_, TurnTransition::Ended) => Ok(Self::Completed),
            (_, TurnTransition::Fail { message }) => Ok(Self::Failed { message }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTransition {
    Submitted,
    ToolPlanned,
    ToolActivity,
    ResponseStarted,
    Chunk,
    Ended,
    Fail { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRejection {
    AlreadySubmitted,
    NotSubmitted {
        attempted: TurnTransition,
    },
    Finished {
        phase: TurnPhase,
        attempted: TurnTransition,
    },
}

pub type TurnTransitionResult = Result<TurnPhase, TurnRejection>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnKind {
    Message,
    /// Re-submission of an earlier persisted exchange with new input.
    ReplayEdit { supersedes: RecordId },
}

/// Server-side persistence of a turn; present once `record_saved` arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBinding {
    pub record_id: RecordId,
    pub conversation: ConversationRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub id: TurnId,
    pub kind: TurnKind,
    pub user_text: String,
    pub attachments: Vec<Attachment>,
    pub record: Option<RecordBinding>,
    /// Append-only; the source of truth for the rendered response.
    pub response: String,
    pub reasoning: String,
    pub phase: TurnPhase,
    pub flow: ThinkingFlow,
    pub usage: Option<TokenUsage>,
    pub acknowledged: bool,
    /// Acknowledged on the current connection and still owed a `record_saved`.
    pub awaiting_record: bool,
    pub paused: bool,
}

impl Turn {
    fn composed(id: TurnId, kind: TurnKind, user_text: String, attachments: Vec<Attachment>) -> Self {
        Self {
            id,
            kind,
            user_text,
            attachments,
            record: None,
            response: String::new(),
            reasoning: String::new(),
            phase: TurnPhase::Composed,
            flow: ThinkingFlow::new(),
            usage: None,
            acknowledged: false,
            awaiting_record: false,
            paused: false,
        }
    }

    pub fn status(&self) -> TurnStatus {
        self.phase.status()
    }

    /// Only persisted turns can be replay-edited.
    pub fn is_editable(&self) -> bool {
        self.record.is_some()
    }

    fn advance(&mut self, transition: TurnTransition) -> bool {
        match self.phase.apply(transition) {
            Ok(next) => {
                self.phase = next;
                true
            }
            Err(rejection) => {
                tracing::debug!(turn = %self.id, ?rejection, "turn transition rejected");
                false
            }
        }
    }
}

/// One exchange as persisted by the server, used to rebuild local history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedTurn {
    pub record_id: RecordId,
    pub conversation: ConversationRef,
    pub user_input: String,
    pub ai_response: String,
}

/// Result of a terminal server event for the active turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSettled {
    pub turn: TurnId,
    pub status: TurnStatus,
}

/// Owns the ordered turn list of the displayed conversation and the single in-flight turn.
///
/// A paused turn superseded by a new submission keeps owning the stream until the server closes
/// it, so trailing frames of the stopped generation never land on the new turn.
#[derive(Debug, Default)]
pub struct TurnTracker {
    turns: Vec<Turn>,
    active: Option<TurnId>,
    draining: Option<TurnId>,
    generating: bool,
    next_id: u64,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn get(&self, id: TurnId) -> Option<&Turn> {
        self.turns.iter().find(|turn| turn.id == id)
    }

    pub fn active_id(&self) -> Option<TurnId> {
        self.active
    }

    pub fn active(&self) -> Option<&Turn> {
        self.active.and_then(|id| self.get(id))
    }

    /// Paused turn still waiting for its trailing `ai_response_end`.
    pub fn draining_id(&self) -> Option<TurnId> {
        self.draining
    }

    /// Local "AI is generating" flag; cleared immediately by `pause`.
    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn record_binding(&self, record_id: RecordId) -> Option<&RecordBinding> {
        self.turns
            .iter()
            .filter_map(|turn| turn.record.as_ref())
            .find(|binding| binding.record_id == record_id)
    }

    /// Fails with `TurnInFlight` unless no turn is generating. A paused turn does not block.
    pub fn check_idle(&self, stage: &'static str) -> SessionResult<()> {
        if let Some(active) = self.active() {
            ensure!(
                active.paused,
                TurnInFlightSnafu {
                    stage,
                    active: active.id
                }
            );
        }
        Ok(())
    }

    /// Moves a paused turn out of the way of the next submission.
    ///
    /// The server only closes a stopped generation whose response had started; such a turn
    /// drains the remaining stream frames. Any other paused turn is completed here.
    pub fn supersede_paused(&mut self) -> Vec<TurnSettled> {
        let (id, owes_end) = match self.active_mut() {
            Some(turn) if turn.paused => (
                turn.id,
                matches!(turn.phase, TurnPhase::Responding | TurnPhase::Streaming),
            ),
            _ => return Vec::new(),
        };
        self.active = None;

        let mut settled = Vec::new();
        if owes_end {
            settled.extend(self.finalize_draining());
            self.draining = Some(id);
        } else {
            settled.extend(self.settle(id));
        }
        settled
    }

    /// Completes the draining turn locally once the server has moved on without closing it.
    pub fn finalize_draining(&mut self) -> Option<TurnSettled> {
        let id = self.draining.take()?;
        self.settle(id)
    }

    /// Appends a submitted turn and makes it the in-flight one.
    pub fn begin(
        &mut self,
        kind: TurnKind,
        user_text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> TurnId {
        let id = TurnId::new(self.next_id);
        self.next_id += 1;

        let mut turn = Turn::composed(id, kind, user_text.into(), attachments);
        turn.advance(TurnTransition::Submitted);
        self.turns.push(turn);
        self.active = Some(id);
        self.generating = true;
        id
    }

    /// Optimistically removes the turn persisted as `record_id` and everything after it.
    pub fn truncate_from(&mut self, record_id: RecordId) -> Option<Vec<Turn>> {
        let index = self.turns.iter().position(|turn| {
            turn.record
                .as_ref()
                .is_some_and(|binding| binding.record_id == record_id)
        })?;
        let removed = self.turns.split_off(index);
        if self
            .draining
            .is_some_and(|draining| removed.iter().any(|turn| turn.id == draining))
        {
            self.draining = None;
        }
        if self
            .active
            .is_some_and(|active| removed.iter().any(|turn| turn.id == active))
        {
            self.active = None;
            self.generating = false;
        }
        Some(removed)
    }

    /// Puts back a tail removed by `truncate_from` when the edit never left the client.
    pub fn restore(&mut self, tail: Vec<Turn>) {
        if let Some(open) = tail.iter().find(|turn| !turn.phase.is_terminal()) {
            self.active = Some(open.id);
            self.generating = !open.paused;
        }
        self.turns.extend(tail);
    }

    /// Marks the in-flight turn as received by the server, which will persist it.
    pub fn acknowledge(&mut self) -> Option<TurnId> {
        let turn = self.active_mut()?;
        turn.acknowledged = true;
        turn.awaiting_record = true;
        Some(turn.id)
    }

    pub fn on_thinking_chunk(&mut self, chunk: &str) -> Option<TurnId> {
        let turn = self.stream_mut()?;
        turn.reasoning.push_str(chunk);
        Some(turn.id)
    }

    pub fn on_tool_plan(&mut self, summary: &str, tool_count: usize) -> Option<TurnId> {
        let turn = self.stream_mut()?;
        turn.advance(TurnTransition::ToolPlanned);
        turn.flow.plan(summary, tool_count);
        Some(turn.id)
    }

    pub fn on_tool_start(
        &mut self,
        tool_id: &str,
        tool_name: &str,
        args: Value,
        progress: Option<String>,
    ) -> Option<TurnId> {
        let turn = self.stream_mut()?;
        turn.advance(TurnTransition::ToolActivity);
        turn.flow.start_tool(tool_id, tool_name, args, progress);
        Some(turn.id)
    }

    pub fn on_tool_end(
        &mut self,
        tool_id: &str,
        tool_name: Option<&str>,
        result: Option<String>,
    ) -> Option<TurnId> {
        let turn = self.stream_mut()?;
        turn.advance(TurnTransition::ToolActivity);
        turn.flow
            .finish_tool(tool_id, tool_name, ToolStatus::Succeeded { result });
        Some(turn.id)
    }

    pub fn on_tool_error(&mut self, tool_id: &str, error: &str) -> Option<TurnId> {
        let turn = self.stream_mut()?;
        turn.advance(TurnTransition::ToolActivity);
        turn.flow.finish_tool(
            tool_id,
            None,
            ToolStatus::Failed {
                error: error.to_string(),
            },
        );
        Some(turn.id)
    }

    pub fn on_fallback(&mut self, summary: &str, error_count: u32) -> Option<TurnId> {
        let turn = self.stream_mut()?;
        turn.flow.fallback(summary, error_count);
        Some(turn.id)
    }

    pub fn on_response_start(&mut self) -> Option<TurnId> {
        let turn = self.stream_mut()?;
        turn.advance(TurnTransition::ResponseStarted);
        turn.flow.respond();
        Some(turn.id)
    }

    /// Chunks are appended in arrival order, paused or not.
    pub fn on_response_chunk(&mut self, chunk: &str) -> Option<TurnId> {
        let turn = self.stream_mut()?;
        if !turn.advance(TurnTransition::Chunk) {
            return None;
        }
        turn.flow.respond();
        turn.response.push_str(chunk);
        Some(turn.id)
    }

    pub fn on_response_end(&mut self) -> Option<TurnSettled> {
        if let Some(draining) = self.draining.take() {
            return self.settle(draining);
        }
        let id = self.active?;
        let settled = self.settle(id);
        self.active = None;
        self.generating = false;
        settled
    }

    /// Fails the in-flight turn; a paused turn completes instead since the user stopped it.
    pub fn fail_active(&mut self, message: &str) -> Option<TurnSettled> {
        let turn = self.active_mut()?;
        if turn.paused {
            turn.advance(TurnTransition::Ended);
            turn.flow.complete(FlowOutcome::Success);
        } else {
            turn.advance(TurnTransition::Fail {
                message: message.to_string(),
            });
            turn.flow.complete(FlowOutcome::Error {
                message: message.to_string(),
            });
        }
        let settled = TurnSettled {
            turn: turn.id,
            status: turn.status(),
        };
        self.active = None;
        self.generating = false;
        Some(settled)
    }

    pub fn pause(&mut self) -> Option<TurnId> {
        self.generating = false;
        let turn = self.active_mut()?;
        turn.paused = true;
        Some(turn.id)
    }

    /// Binds a `record_saved` to the oldest acknowledged turn still owed a record.
    ///
    /// Failed turns count: the server persists whatever it received, error or not.
    pub fn bind_record(&mut self, binding: RecordBinding) -> Option<TurnId> {
        if self.record_binding(binding.record_id).is_some() {
            return None;
        }
        let turn = self
            .turns
            .iter_mut()
            .find(|turn| turn.awaiting_record && turn.record.is_none())?;
        turn.awaiting_record = false;
        turn.record = Some(binding);
        Some(turn.id)
    }

    /// An edit rejected after `edit_ok` is not persisted.
    pub fn cancel_pending_record(&mut self, id: TurnId) {
        if let Some(turn) = self.turns.iter_mut().find(|turn| turn.id == id) {
            turn.awaiting_record = false;
        }
    }

    /// Records owed on a dropped connection are never delivered on the next one.
    pub fn forget_pending_records(&mut self) {
        for turn in &mut self.turns {
            turn.awaiting_record = false;
        }
    }

    /// Attaches usage to the draining turn, otherwise to the most recent one.
    pub fn record_usage(&mut self, usage: TokenUsage) -> Option<TurnId> {
        let turn = match self.draining {
            Some(draining) => self.turns.iter_mut().find(|turn| turn.id == draining)?,
            None => self.turns.last_mut()?,
        };
        turn.usage = Some(usage);
        Some(turn.id)
    }

    /// Replaces local turns with persisted history, keeping an in-flight turn at the end.
    pub fn reconcile_history(&mut self, history: Vec<PersistedTurn>) {
        let in_flight = self
            .active
            .and_then(|active| self.turns.iter().position(|turn| turn.id == active))
            .map(|index| self.turns.remove(index));

        self.turns.clear();
        self.draining = None;
        for persisted in history {
            let id = TurnId::new(self.next_id);
            self.next_id += 1;
            let mut turn = Turn::composed(id, TurnKind::Message, persisted.user_input, Vec::new());
            turn.phase = TurnPhase::Completed;
            turn.response = persisted.ai_response;
            turn.acknowledged = true;
            turn.record = Some(RecordBinding {
                record_id: persisted.record_id,
                conversation: persisted.conversation,
            });
            self.turns.push(turn);
        }

        if let Some(turn) = in_flight {
            let superseded = turn
                .record
                .as_ref()
                .is_some_and(|binding| self.record_binding(binding.record_id).is_some());
            if superseded {
                self.active = None;
                self.generating = false;
            } else {
                self.turns.push(turn);
            }
        }
    }

    pub fn reset(&mut self) {
        self.turns.clear();
        self.active = None;
        self.draining = None;
        self.generating = false;
    }

    fn settle(&mut self, id: TurnId) -> Option<TurnSettled> {
        let turn = self.turns.iter_mut().find(|turn| turn.id == id)?;
        turn.advance(TurnTransition::Ended);
        turn.flow.complete(FlowOutcome::Success);
        Some(TurnSettled {
            turn: id,
            status: turn.status(),
        })
    }

    /// Receiver of stream frames: the draining turn first, otherwise the in-flight one.
    fn stream_mut(&mut self) -> Option<&mut Turn> {
        match self.draining {
            Some(draining) => self.turns.iter_mut().find(|turn| turn.id == draining),
            None => self.active_mut(),
        }
    }

    fn active_mut(&mut self) -> Option<&mut Turn> {
        let active = self.active?;
        let turn = self.turns.iter_mut().find(|turn| turn.id == active);
        if turn.is_none() {
            tracing::debug!(turn = %active, "active turn no longer tracked");
        }
        turn
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::{ConversationId, SessionId};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::SessionError;

    fn conversation() -> ConversationRef {
        ConversationRef::new(SessionId::parse("S0").unwrap(), ConversationId::new(7))
    }

    fn binding(record: i64) -> RecordBinding {
        RecordBinding {
            record_id: RecordId::new(record),
            conversation: conversation(),
        }
    }

    #[test]
    fn phase_rejects_everything_after_completion() {
        let phase = TurnPhase::Completed;
        assert!(matches!(
            phase.apply(TurnTransition::Chunk),
            Err(TurnRejection::Finished { .. })
        ));
    }

    #[test]
    fn server_events_need_a_submitted_turn() {
        assert_eq!(
            TurnPhase::Composed.apply(TurnTransition::Chunk),
            Err(TurnRejection::NotSubmitted {
                attempted: TurnTransition::Chunk
            })
        );
        assert_eq!(
            TurnPhase::Composed.apply(TurnTransition::Submitted),
            Ok(TurnPhase::Sent)
        );
    }

    #[test]
    fn response_start_is_idempotent_once_streaming() {
        assert_eq!(
            TurnPhase::Streaming.apply(TurnTransition::ResponseStarted),
            Ok(TurnPhase::Streaming)
        );
        assert_eq!(
            TurnPhase::ToolExecuting.apply(TurnTransition::ResponseStarted),
            Ok(TurnPhase::Responding)
        );
    }

    #[test]
    fn chunks_append_in_arrival_order() {
        let mut tracker = TurnTracker::new();
        let id = tracker.begin(TurnKind::Message, "hi", Vec::new());

        tracker.on_response_start();
        for chunk in ["a", "b", "c"] {
            tracker.on_response_chunk(chunk);
        }
        let settled = tracker.on_response_end().unwrap();

        let turn = tracker.get(id).unwrap();
        assert_eq!(turn.response, "abc");
        assert_eq!(settled.status, TurnStatus::Completed);
        assert_eq!(turn.flow.outcome(), Some(&FlowOutcome::Success));
        assert!(tracker.active().is_none());
    }

    #[test]
    fn a_second_turn_is_rejected_while_one_is_in_flight() {
        let mut tracker = TurnTracker::new();
        let id = tracker.begin(TurnKind::Message, "hi", Vec::new());

        let error = tracker.check_idle("submit").unwrap_err();
        assert!(matches!(error, SessionError::TurnInFlight { active, .. } if active == id));
    }

    #[test]
    fn paused_turn_accepts_trailing_chunks_and_completes() {
        let mut tracker = TurnTracker::new();
        let id = tracker.begin(TurnKind::Message, "hi", Vec::new());
        tracker.on_response_chunk("par");

        tracker.pause();
        assert!(!tracker.is_generating());
        tracker.on_response_chunk("tial");
        let settled = tracker.on_response_end().unwrap();

        assert_eq!(settled.status, TurnStatus::Completed);
        assert_eq!(tracker.get(id).unwrap().response, "partial");
    }

    #[test]
    fn paused_turn_before_any_response_is_finalised_by_the_next_submission() {
        let mut tracker = TurnTracker::new();
        let first = tracker.begin(TurnKind::Message, "hi", Vec::new());
        tracker.on_tool_plan("search first", 1);
        tracker.pause();

        tracker.check_idle("submit").unwrap();
        let settled = tracker.supersede_paused();

        assert_eq!(
            settled,
            vec![TurnSettled {
                turn: first,
                status: TurnStatus::Completed
            }]
        );
        assert_eq!(tracker.draining_id(), None);
    }

    #[test]
    fn superseded_streaming_turn_drains_until_its_end_frame() {
        let mut tracker = TurnTracker::new();
        let first = tracker.begin(TurnKind::Message, "one", Vec::new());
        tracker.on_response_start();
        tracker.on_response_chunk("par");
        tracker.pause();

        assert!(tracker.supersede_paused().is_empty());
        let second = tracker.begin(TurnKind::Message, "two", Vec::new());
        assert_eq!(tracker.on_response_chunk("tial"), Some(first));

        let settled = tracker.on_response_end().unwrap();
        assert_eq!(settled.turn, first);
        assert_eq!(tracker.active_id(), Some(second));
        assert!(tracker.is_generating());

        tracker.on_response_start();
        tracker.on_response_chunk("answer");
        assert_eq!(tracker.on_response_end().map(|settled| settled.turn), Some(second));
        assert_eq!(tracker.get(first).unwrap().response, "partial");
        assert_eq!(tracker.get(second).unwrap().response, "answer");
    }

    #[test]
    fn a_turn_paused_behind_a_draining_one_settles_on_its_own() {
        let mut tracker = TurnTracker::new();
        let first = tracker.begin(TurnKind::Message, "one", Vec::new());
        tracker.on_response_chunk("a");
        tracker.pause();
        tracker.supersede_paused();
        let second = tracker.begin(TurnKind::Message, "two", Vec::new());
        tracker.pause();

        let settled = tracker.supersede_paused();

        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].turn, second);
        assert_eq!(tracker.draining_id(), Some(first));
        assert_eq!(tracker.finalize_draining().map(|settled| settled.turn), Some(first));
    }

    #[test]
    fn record_saved_binds_the_oldest_unbound_turn() {
        let mut tracker = TurnTracker::new();
        let first = tracker.begin(TurnKind::Message, "one", Vec::new());
        tracker.acknowledge();
        tracker.on_response_end();
        let second = tracker.begin(TurnKind::Message, "two", Vec::new());
        tracker.acknowledge();

        assert_eq!(tracker.bind_record(binding(10)), Some(first));
        assert_eq!(tracker.bind_record(binding(11)), Some(second));
        assert_eq!(tracker.bind_record(binding(11)), None);
        assert!(tracker.get(first).unwrap().is_editable());
    }

    #[test]
    fn failed_acknowledged_turn_keeps_its_own_record() {
        let mut tracker = TurnTracker::new();
        let first = tracker.begin(TurnKind::Message, "one", Vec::new());
        tracker.acknowledge();
        tracker.fail_active("model overloaded");
        let second = tracker.begin(TurnKind::Message, "two", Vec::new());
        tracker.acknowledge();

        assert_eq!(tracker.bind_record(binding(41)), Some(first));
        assert!(tracker.get(second).unwrap().record.is_none());
    }

    #[test]
    fn unacknowledged_turns_never_take_a_record() {
        let mut tracker = TurnTracker::new();
        tracker.begin(TurnKind::Message, "rejected", Vec::new());
        tracker.fail_active("insufficient credits");

        assert_eq!(tracker.bind_record(binding(5)), None);
    }

    #[test]
    fn records_owed_on_a_lost_connection_are_forgotten() {
        let mut tracker = TurnTracker::new();
        tracker.begin(TurnKind::Message, "one", Vec::new());
        tracker.acknowledge();
        tracker.fail_active("connection lost");
        tracker.forget_pending_records();
        let second = tracker.begin(TurnKind::Message, "two", Vec::new());
        tracker.acknowledge();

        assert_eq!(tracker.bind_record(binding(8)), Some(second));
    }

    #[test]
    fn truncation_removes_the_record_and_its_tail() {
        let mut tracker = TurnTracker::new();
        for (text, record) in [("one", 1), ("two", 2), ("three", 3)] {
            tracker.begin(TurnKind::Message, text, Vec::new());
            tracker.acknowledge();
            tracker.on_response_end();
            tracker.bind_record(binding(record));
        }

        let removed = tracker.truncate_from(RecordId::new(2)).unwrap();

        assert_eq!(removed.len(), 2);
        assert_eq!(tracker.turns().len(), 1);
        assert!(tracker.truncate_from(RecordId::new(9)).is_none());

        tracker.restore(removed);
        assert_eq!(tracker.turns().len(), 3);
    }

    #[test]
    fn failure_closes_the_flow_with_an_error() {
        let mut tracker = TurnTracker::new();
        let id = tracker.begin(TurnKind::Message, "hi", Vec::new());
        tracker.on_tool_start("t1", "search", Value::Null, None);

        let settled = tracker.fail_active("connection lost").unwrap();

        assert_eq!(settled.status, TurnStatus::Failed);
        assert_eq!(
            tracker.get(id).unwrap().flow.outcome(),
            Some(&FlowOutcome::Error {
                message: "connection lost".to_string()
            })
        );
    }

    #[test]
    fn history_replaces_settled_turns() {
        let mut tracker = TurnTracker::new();
        tracker.begin(TurnKind::Message, "stale", Vec::new());
        tracker.on_response_end();

        tracker.reconcile_history(vec![PersistedTurn {
            record_id: RecordId::new(4),
            conversation: conversation(),
            user_input: "hello".to_string(),
            ai_response: "hi there".to_string(),
        }]);

        let turns = tracker.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].user_text, "hello");
        assert_eq!(turns[0].status(), TurnStatus::Completed);
        assert!(turns[0].is_editable());
    }
}
