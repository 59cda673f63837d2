use parley_protocol::{ConversationRef, Inbound, ServerMessage};

use super::{LinkStatus, SessionEngine, link_view};
use crate::error::ResumeFailure;
use crate::events::{EngineEvent, NoticeLevel};
use crate::transport::{Channel, TransportEvent};
use crate::turn::{RecordBinding, TurnId, TurnSettled};

impl<C: Channel> SessionEngine<C> {
    /// Applies one transport notification, then flushes a parked submission if it was unblocked.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged { state, generation } => {
                let was_connected = self.link.state.is_connected();
                self.link = LinkStatus { state, generation };
                self.events
                    .push(EngineEvent::ConnectionChanged { state, generation });
                if was_connected && !state.is_connected() {
                    self.on_transport_lost();
                } else if state.is_connected() {
                    // A fresh link has no identity until `session_info`.
                    self.registry.invalidate();
                }
            }
            TransportEvent::ReconnectScheduled(attempt) => {
                tracing::info!(
                    attempt = attempt.attempt,
                    max_attempts = attempt.max_attempts,
                    delay_ms = attempt.delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.events.push(EngineEvent::Reconnecting(attempt));
            }
            TransportEvent::GaveUp { attempts } => {
                self.events.push(EngineEvent::GaveUp { attempts });
                self.push_notice(
                    NoticeLevel::Error,
                    format!("connection lost after {attempts} reconnect attempts"),
                );
            }
            TransportEvent::Frame(Inbound::Message(message)) => self.dispatch(message),
            TransportEvent::Frame(Inbound::Unknown { tag }) => {
                tracing::debug!(tag = %tag, "ignoring unrecognised server message");
            }
        }
        self.poll_gate();
    }

    fn on_transport_lost(&mut self) {
        if let Some(identity) = self.registry.invalidate() {
            tracing::info!(
                session_id = %identity.session_id,
                generation = %identity.generation,
                "session identity invalidated"
            );
        }
        self.resume.on_transport_lost();
        if let Some(settled) = self.turns.finalize_draining() {
            self.finish(settled);
        }
        if let Some(settled) = self.turns.fail_active("connection lost") {
            self.finish(settled);
        }
        self.turns.forget_pending_records();
    }

    fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::SessionInfo { session_id } => {
                tracing::info!(session_id = %session_id, generation = %self.link.generation, "session established");
                self.registry
                    .establish(self.link.generation, session_id.clone());
                self.events.push(EngineEvent::SessionEstablished(session_id));
                self.resume.on_session_established(
                    link_view(&self.link, &self.registry),
                    &self.channel,
                );
            }
            ServerMessage::ResumeOk {
                session_id,
                conversation_id,
            } => {
                let conversation = ConversationRef::new(session_id, conversation_id);
                let redirected = self.resume.desired() != Some(&conversation);
                if self
                    .resume
                    .on_resume_ok(self.registry.current(), conversation.clone())
                {
                    tracing::info!(
                        session_id = %conversation.session_id,
                        conversation_id = %conversation.conversation_id,
                        "resume confirmed"
                    );
                    if redirected {
                        self.events
                            .push(EngineEvent::HistoryRefreshRequested(conversation.clone()));
                    }
                    self.events.push(EngineEvent::ResumeConfirmed(conversation));
                }
            }
            ServerMessage::ResumeError { reason } => {
                tracing::warn!(reason = %reason, "resume rejected");
                self.resume.on_resume_error(reason.clone());
                self.events
                    .push(EngineEvent::ResumeFailed(ResumeFailure::Rejected { reason }));
            }
            ServerMessage::EditOk {
                session_id,
                conversation_id,
            } => {
                let conversation = ConversationRef::new(session_id, conversation_id);
                self.resume
                    .on_edit_ok(self.registry.current(), conversation.clone());
                self.events.push(EngineEvent::ResumeConfirmed(conversation));
                self.acknowledge();
            }
            ServerMessage::EditError { content } => {
                tracing::warn!(error = %content, "replay edit rejected");
                if let Some(settled) = self.turns.fail_active(&content) {
                    self.turns.cancel_pending_record(settled.turn);
                    self.finish(settled);
                }
                self.push_notice(NoticeLevel::Error, content);
                if let Some(conversation) = self.resume.desired().cloned() {
                    self.events
                        .push(EngineEvent::HistoryRefreshRequested(conversation));
                }
            }
            ServerMessage::ModelSwitched { model, reason } => {
                tracing::info!(model = %model, "model switched");
                self.model = Some(model.clone());
                self.events.push(EngineEvent::ModelSwitched { model, reason });
            }
            ServerMessage::ModelSwitchError { content } => {
                self.push_notice(NoticeLevel::Warning, content);
            }
            ServerMessage::UserMsgReceived { .. } => self.acknowledge(),
            ServerMessage::CreditsUpdate { remaining } => {
                self.credits = remaining;
                self.events.push(EngineEvent::CreditsUpdated { remaining });
            }
            ServerMessage::AiThinkingStart { .. } | ServerMessage::AiThinkingEnd { .. } => {}
            ServerMessage::AiThinkingChunk { content } => {
                if let Some(turn) = self.turns.on_thinking_chunk(&content) {
                    self.events.push(EngineEvent::ThinkingDelta {
                        turn,
                        chunk: content,
                    });
                }
            }
            ServerMessage::ToolPlan {
                content,
                tool_count,
            } => {
                let turn = self.turns.on_tool_plan(&content, tool_count);
                self.updated(turn);
            }
            ServerMessage::ToolStart {
                tool_id,
                tool_name,
                tool_args,
                progress,
            } => {
                tracing::debug!(tool_id = %tool_id, tool_name = %tool_name, "tool started");
                let turn = self
                    .turns
                    .on_tool_start(&tool_id, &tool_name, tool_args, progress);
                self.updated(turn);
            }
            ServerMessage::ToolEnd {
                tool_id,
                tool_name,
                result,
            } => {
                let result = (!result.is_empty()).then_some(result);
                let turn = self
                    .turns
                    .on_tool_end(&tool_id, tool_name.as_deref(), result);
                self.updated(turn);
            }
            ServerMessage::ToolError { tool_id, error } => {
                tracing::debug!(tool_id = %tool_id, error = %error, "tool failed");
                let turn = self.turns.on_tool_error(&tool_id, &error);
                self.updated(turn);
            }
            ServerMessage::FallbackTriggered {
                content,
                error_count,
            } => {
                let turn = self.turns.on_fallback(&content, error_count);
                self.updated(turn);
            }
            ServerMessage::AiResponseStart { .. } => {
                let turn = self.turns.on_response_start();
                self.updated(turn);
            }
            ServerMessage::AiResponseChunk { content } => {
                match self.turns.on_response_chunk(&content) {
                    Some(turn) => self.events.push(EngineEvent::ResponseDelta {
                        turn,
                        chunk: content,
                    }),
                    None => tracing::debug!("dropping response chunk without an open turn"),
                }
            }
            // The buffer is authoritative; the end frame's content is not used.
            ServerMessage::AiResponseEnd { .. } => {
                if let Some(settled) = self.turns.on_response_end() {
                    self.finish(settled);
                }
            }
            ServerMessage::TokenUsage(usage) => {
                let turn = self.turns.record_usage(usage);
                self.updated(turn);
            }
            ServerMessage::RecordSaved {
                record_id,
                session_id,
                conversation_id,
            } => {
                let binding = RecordBinding {
                    record_id,
                    conversation: ConversationRef::new(session_id, conversation_id),
                };
                match self.turns.bind_record(binding) {
                    Some(turn) => self
                        .events
                        .push(EngineEvent::RecordBound { turn, record_id }),
                    None => {
                        tracing::debug!(record_id = %record_id, "record_saved matched no turn")
                    }
                }
            }
            ServerMessage::Error {
                content,
                code,
                remaining,
                required,
            } => {
                tracing::warn!(error = %content, code = ?code, "server reported an error");
                if let Some(settled) = self.turns.fail_active(&content) {
                    self.finish(settled);
                }
                if remaining.is_some() {
                    self.credits = remaining;
                    self.events.push(EngineEvent::CreditsUpdated { remaining });
                }
                let message = match required {
                    Some(required) => format!("{content} (requires {required} credits)"),
                    None => content,
                };
                self.push_notice(NoticeLevel::Error, message);
            }
            ServerMessage::Unknown => {
                tracing::debug!("ignoring unrecognised server message");
            }
        }
    }

    /// The server took the in-flight turn, so a stopped turn it never closed is done.
    fn acknowledge(&mut self) {
        if let Some(settled) = self.turns.finalize_draining() {
            self.finish(settled);
        }
        let turn = self.turns.acknowledge();
        self.updated(turn);
    }

    fn updated(&mut self, turn: Option<TurnId>) {
        if let Some(turn) = turn {
            self.events.push(EngineEvent::TurnUpdated(turn));
        }
    }

    fn finish(&mut self, settled: TurnSettled) {
        tracing::debug!(turn = %settled.turn, status = ?settled.status, "turn finished");
        self.events.push(EngineEvent::TurnFinished {
            turn: settled.turn,
            status: settled.status,
        });
    }
}
