//! The single owned state object behind a conversation session.
//!
//! Every mutation happens through `&mut self`, one transport event or user command at a time,
//! so protocol state needs no locks. Staleness is decided by connection generation and the
//! server-assigned identity, never by timers.
use parley_protocol::{Attachment, ClientMessage, ConversationRef, RecordId, SessionId};
use snafu::{OptionExt, ResultExt, ensure};

use crate::error::{
    ConnectivitySnafu, EmptyInputSnafu, ResumeSnafu, SendRejectedSnafu, SessionResult,
    SubmissionGatedSnafu, UnknownRecordSnafu,
};
use crate::events::{EngineEvent, NoticeLevel};
use crate::registry::SessionRegistry;
use crate::resume::{
    ConfirmedBinding, LinkView, NegotiationSummary, ResumeCoordinator, ResumeHandle,
};
use crate::transport::{Channel, ConnectionGeneration, ConnectionState};
use crate::turn::{PersistedTurn, Turn, TurnId, TurnKind, TurnTracker};

mod dispatch;

/// Outcome of a submission that passed local validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Sent(TurnId),
    /// Parked until the outstanding resume negotiation settles.
    AwaitingResume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Draft {
    Message {
        text: String,
        attachments: Vec<Attachment>,
    },
    ReplayEdit {
        record_id: RecordId,
        conversation: ConversationRef,
        text: String,
    },
}

impl Draft {
    fn text(&self) -> &str {
        match self {
            Self::Message { text, .. } | Self::ReplayEdit { text, .. } => text,
        }
    }

    fn attachments(&self) -> &[Attachment] {
        match self {
            Self::Message { attachments, .. } => attachments,
            Self::ReplayEdit { .. } => &[],
        }
    }
}

#[derive(Debug)]
struct GatedSubmission {
    draft: Draft,
    handle: ResumeHandle,
}

#[derive(Debug, Clone, Copy, Default)]
struct LinkStatus {
    state: ConnectionState,
    generation: ConnectionGeneration,
}

/// Point-in-time view for renderers and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub state: ConnectionState,
    pub generation: ConnectionGeneration,
    pub session_id: Option<SessionId>,
    pub desired: Option<ConversationRef>,
    pub confirmed: Option<ConfirmedBinding>,
    pub negotiation: Option<NegotiationSummary>,
    pub turns: Vec<Turn>,
    pub active_turn: Option<TurnId>,
    pub generating: bool,
    pub submission_gated: bool,
    pub model: Option<String>,
    pub credits: Option<i64>,
}

pub struct SessionEngine<C: Channel> {
    channel: C,
    link: LinkStatus,
    registry: SessionRegistry,
    resume: ResumeCoordinator,
    turns: TurnTracker,
    model: Option<String>,
    credits: Option<i64>,
    gated: Option<GatedSubmission>,
    events: Vec<EngineEvent>,
}

fn link_view<'a>(link: &LinkStatus, registry: &'a SessionRegistry) -> LinkView<'a> {
    LinkView {
        state: link.state,
        generation: link.generation,
        identity: registry.current(),
    }
}

impl<C: Channel> SessionEngine<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            link: LinkStatus::default(),
            registry: SessionRegistry::new(),
            resume: ResumeCoordinator::new(),
            turns: TurnTracker::new(),
            model: None,
            credits: None,
            gated: None,
            events: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn turns(&self) -> &[Turn] {
        self.turns.turns()
    }

    pub fn desired_conversation(&self) -> Option<&ConversationRef> {
        self.resume.desired()
    }

    /// Sends a user message once the resume gate allows it.
    pub fn submit(
        &mut self,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> SessionResult<Submission> {
        let text = text.into();
        ensure!(
            !text.trim().is_empty() || !attachments.is_empty(),
            EmptyInputSnafu { stage: "submit" }
        );
        self.check_submittable("submit")?;
        self.gate("submit", Draft::Message { text, attachments })
    }

    /// Replays the exchange persisted as `record_id` with new input.
    pub fn submit_replay_edit(
        &mut self,
        record_id: RecordId,
        text: impl Into<String>,
    ) -> SessionResult<Submission> {
        let text = text.into();
        ensure!(
            !text.trim().is_empty(),
            EmptyInputSnafu {
                stage: "submit-replay-edit"
            }
        );
        self.check_submittable("submit-replay-edit")?;
        let conversation = self
            .turns
            .record_binding(record_id)
            .map(|binding| binding.conversation.clone())
            .context(UnknownRecordSnafu {
                stage: "submit-replay-edit",
                record_id,
            })?;

        self.gate(
            "submit-replay-edit",
            Draft::ReplayEdit {
                record_id,
                conversation,
                text,
            },
        )
    }

    /// Switches the conversation the session should be bound to; `None` starts a fresh one.
    pub fn select_conversation(&mut self, conversation: Option<ConversationRef>) {
        tracing::info!(
            session_id = conversation.as_ref().map(|target| target.session_id.to_string()),
            conversation_id = conversation.as_ref().map(|target| target.conversation_id.get()),
            "conversation selected"
        );
        self.resume.set_desired_conversation(conversation.clone());

        let mut settled: Vec<_> = self.turns.finalize_draining().into_iter().collect();
        settled.extend(self.turns.fail_active("conversation changed"));
        for settled in settled {
            self.events.push(EngineEvent::TurnFinished {
                turn: settled.turn,
                status: settled.status,
            });
        }
        self.turns.reset();

        if let Some(target) = conversation {
            self.events
                .push(EngineEvent::HistoryRefreshRequested(target.clone()));
            if self.registry.current().is_some() {
                // Bind eagerly; the next submission joins this negotiation.
                drop(self.resume.negotiate(
                    link_view(&self.link, &self.registry),
                    &self.channel,
                    false,
                ));
            }
        }
        self.poll_gate();
    }

    pub fn switch_model(&mut self, model: impl Into<String>) -> SessionResult<()> {
        ensure!(
            self.link.state.is_connected(),
            ConnectivitySnafu {
                stage: "switch-model",
                state: self.link.state,
            }
        );
        let message = ClientMessage::SwitchModel {
            model: model.into(),
        };
        ensure!(
            self.channel.send(self.link.generation, &message),
            SendRejectedSnafu {
                stage: "switch-model",
                tag: message.tag(),
            }
        );
        Ok(())
    }

    /// Asks the server to stop generating; the local flag flips immediately.
    pub fn pause(&mut self) -> SessionResult<Option<TurnId>> {
        if !self.turns.is_generating() {
            return Ok(None);
        }
        let message = ClientMessage::Pause;
        ensure!(
            self.channel.send(self.link.generation, &message),
            SendRejectedSnafu {
                stage: "pause",
                tag: message.tag(),
            }
        );
        let paused = self.turns.pause();
        if let Some(turn) = paused {
            tracing::info!(turn = %turn, "generation paused");
            self.events.push(EngineEvent::TurnUpdated(turn));
        }
        Ok(paused)
    }

    pub fn ensure_bound(&mut self) -> ResumeHandle {
        self.resume
            .ensure_bound(link_view(&self.link, &self.registry), &self.channel)
    }

    pub fn negotiate(&mut self, force: bool) -> ResumeHandle {
        self.resume
            .negotiate(link_view(&self.link, &self.registry), &self.channel, force)
    }

    pub fn reconnect(&self) {
        self.channel.reconnect();
    }

    /// Replaces local turns with persisted history; ignored when it belongs to another selection.
    pub fn reconcile_history(
        &mut self,
        conversation: ConversationRef,
        history: Vec<PersistedTurn>,
    ) -> bool {
        if self.resume.desired() != Some(&conversation) {
            tracing::debug!(
                session_id = %conversation.session_id,
                conversation_id = %conversation.conversation_id,
                "dropping history for a conversation that is no longer selected"
            );
            return false;
        }
        self.turns.reconcile_history(history);
        self.events.push(EngineEvent::HistoryReplaced {
            conversation,
            turns: self.turns.turns().len(),
        });
        true
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.link.state,
            generation: self.link.generation,
            session_id: self.registry.session_id().cloned(),
            desired: self.resume.desired().cloned(),
            confirmed: self.resume.confirmed().cloned(),
            negotiation: self.resume.outstanding(),
            turns: self.turns.turns().to_vec(),
            active_turn: self.turns.active_id(),
            generating: self.turns.is_generating(),
            submission_gated: self.gated.is_some(),
            model: self.model.clone(),
            credits: self.credits,
        }
    }

    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn push_notice(&mut self, level: NoticeLevel, message: impl Into<String>) {
        self.events.push(EngineEvent::notice(level, message));
    }

    pub fn shutdown(&mut self) {
        tracing::info!("session shutting down");
        self.channel.close();
    }

    fn check_submittable(&self, stage: &'static str) -> SessionResult<()> {
        self.turns.check_idle(stage)?;
        ensure!(self.gated.is_none(), SubmissionGatedSnafu { stage });
        Ok(())
    }

    fn gate(&mut self, stage: &'static str, draft: Draft) -> SessionResult<Submission> {
        let mut handle = self.ensure_bound();
        match handle.try_outcome() {
            Some(outcome) => {
                outcome.context(ResumeSnafu { stage })?;
                self.transmit(stage, draft).map(Submission::Sent)
            }
            None => {
                tracing::debug!(stage, "submission parked behind resume negotiation");
                self.gated = Some(GatedSubmission { draft, handle });
                Ok(Submission::AwaitingResume)
            }
        }
    }

    /// Flushes or drops the parked submission once its negotiation has settled.
    fn poll_gate(&mut self) {
        let Some(mut gated) = self.gated.take() else {
            return;
        };
        match gated.handle.try_outcome() {
            None => self.gated = Some(gated),
            Some(Ok(_)) => {
                let text = gated.draft.text().to_string();
                let attachments = gated.draft.attachments().to_vec();
                if let Err(error) = self.transmit("flush-gated", gated.draft) {
                    tracing::warn!(error = %error, "gated submission failed to send");
                    self.events.push(EngineEvent::SubmissionDropped {
                        text,
                        attachments,
                        reason: error.to_string(),
                    });
                }
            }
            Some(Err(failure)) => {
                tracing::warn!(failure = %failure, "gated submission dropped");
                self.events.push(EngineEvent::SubmissionDropped {
                    text: gated.draft.text().to_string(),
                    attachments: gated.draft.attachments().to_vec(),
                    reason: failure.to_string(),
                });
            }
        }
    }

    fn transmit(&mut self, stage: &'static str, draft: Draft) -> SessionResult<TurnId> {
        match draft {
            Draft::Message { text, attachments } => {
                let message = ClientMessage::user_message(text.clone(), attachments.clone());
                ensure!(
                    self.channel.send(self.link.generation, &message),
                    SendRejectedSnafu {
                        stage,
                        tag: message.tag(),
                    }
                );
                Ok(self.start_turn(TurnKind::Message, text, attachments))
            }
            Draft::ReplayEdit {
                record_id,
                conversation,
                text,
            } => {
                let removed = self.turns.truncate_from(record_id).unwrap_or_default();
                let message = ClientMessage::ReplayEdit {
                    session_id: conversation.session_id,
                    conversation_id: conversation.conversation_id,
                    from_record_id: record_id,
                    new_user_input: text.clone(),
                };
                if !self.channel.send(self.link.generation, &message) {
                    self.turns.restore(removed);
                    return SendRejectedSnafu {
                        stage,
                        tag: message.tag(),
                    }
                    .fail();
                }
                if !removed.is_empty() {
                    self.events.push(EngineEvent::TurnsTruncated {
                        from: record_id,
                        removed: removed.len(),
                    });
                }
                Ok(self.start_turn(TurnKind::ReplayEdit { supersedes: record_id }, text, Vec::new()))
            }
        }
    }

    fn start_turn(&mut self, kind: TurnKind, text: String, attachments: Vec<Attachment>) -> TurnId {
        for settled in self.turns.supersede_paused() {
            self.events.push(EngineEvent::TurnFinished {
                turn: settled.turn,
                status: settled.status,
            });
        }
        let turn = self.turns.begin(kind, text, attachments);
        tracing::debug!(turn = %turn, "turn started");
        self.events.push(EngineEvent::TurnStarted(turn));
        turn
    }
}
