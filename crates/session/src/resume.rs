//! Reconciles the conversation the user wants to resume with what the live connection is
//! actually bound to.
//!
//! The binding is scoped to a connection identity, never to a flag: a fresh `session_info`
//! makes every earlier confirmation stale by comparison alone. At most one negotiation is
//! outstanding; later callers join it instead of issuing another `resume_conversation`.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parley_protocol::{ClientMessage, ConversationRef, SessionId};
use tokio::sync::oneshot;

use crate::error::ResumeFailure;
use crate::registry::ConnectionIdentity;
use crate::transport::{Channel, ConnectionGeneration, ConnectionState};

/// `Ok(None)` means nothing needed binding.
pub type ResumeOutcome = Result<Option<ConversationRef>, ResumeFailure>;

/// Deferred outcome of `ensure_bound`/`negotiate`.
///
/// Always settles: voiding a negotiation rejects it, and a dropped coordinator reads as
/// `ResumeFailure::Abandoned`.
#[derive(Debug)]
pub struct ResumeHandle {
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Ready(Option<ResumeOutcome>),
    Waiting(oneshot::Receiver<ResumeOutcome>),
}

impl ResumeHandle {
    fn ready(outcome: ResumeOutcome) -> Self {
        Self {
            state: HandleState::Ready(Some(outcome)),
        }
    }

    fn waiting(receiver: oneshot::Receiver<ResumeOutcome>) -> Self {
        Self {
            state: HandleState::Waiting(receiver),
        }
    }

    /// True until an outcome has been observed through `try_outcome`.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, HandleState::Waiting(_))
    }

    /// Non-blocking read of the outcome; `None` while the negotiation is unresolved.
    ///
    /// The outcome is handed out once.
    pub fn try_outcome(&mut self) -> Option<ResumeOutcome> {
        match &mut self.state {
            HandleState::Ready(outcome) => outcome.take(),
            HandleState::Waiting(receiver) => match receiver.try_recv() {
                Ok(outcome) => {
                    self.state = HandleState::Ready(None);
                    Some(outcome)
                }
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.state = HandleState::Ready(None);
                    Some(Err(ResumeFailure::Abandoned))
                }
            },
        }
    }
}

impl Future for ResumeHandle {
    type Output = ResumeOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            HandleState::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(Err(ResumeFailure::Abandoned)))
            }
            HandleState::Waiting(receiver) => {
                let received = std::task::ready!(Pin::new(receiver).poll(cx));
                self.state = HandleState::Ready(None);
                Poll::Ready(received.unwrap_or(Err(ResumeFailure::Abandoned)))
            }
        }
    }
}

/// What the coordinator needs to know about the link at call time.
#[derive(Debug, Clone, Copy)]
pub struct LinkView<'a> {
    pub state: ConnectionState,
    pub generation: ConnectionGeneration,
    pub identity: Option<&'a ConnectionIdentity>,
}

/// The live connection has been told it is resuming `conversation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedBinding {
    pub identity: ConnectionIdentity,
    pub conversation: ConversationRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NegotiationId(pub u64);

#[derive(Debug)]
struct ResumeNegotiation {
    id: NegotiationId,
    issued_on: ConnectionGeneration,
    /// Live session the request went out under; `None` while held back for `session_info`.
    sent_under: Option<SessionId>,
    target: ConversationRef,
    waiters: Vec<oneshot::Sender<ResumeOutcome>>,
}

impl ResumeNegotiation {
    fn subscribe(&mut self) -> ResumeHandle {
        let (sender, receiver) = oneshot::channel();
        self.waiters.push(sender);
        ResumeHandle::waiting(receiver)
    }

    fn settle(self, outcome: ResumeOutcome) {
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Snapshot of an outstanding negotiation for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationSummary {
    pub id: NegotiationId,
    pub issued_on: ConnectionGeneration,
    pub target: ConversationRef,
    pub sent: bool,
}

#[derive(Debug, Default)]
pub struct ResumeCoordinator {
    desired: Option<ConversationRef>,
    confirmed: Option<ConfirmedBinding>,
    outstanding: Option<ResumeNegotiation>,
    next_negotiation: u64,
}

impl ResumeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn desired(&self) -> Option<&ConversationRef> {
        self.desired.as_ref()
    }

    pub fn confirmed(&self) -> Option<&ConfirmedBinding> {
        self.confirmed.as_ref()
    }

    pub fn outstanding(&self) -> Option<NegotiationSummary> {
        self.outstanding.as_ref().map(|negotiation| NegotiationSummary {
            id: negotiation.id,
            issued_on: negotiation.issued_on,
            target: negotiation.target.clone(),
            sent: negotiation.sent_under.is_some(),
        })
    }

    /// True when the live identity carries a confirmed binding.
    pub fn is_bound_to(&self, identity: Option<&ConnectionIdentity>) -> bool {
        match (&self.confirmed, identity) {
            (Some(confirmed), Some(identity)) => confirmed.identity == *identity,
            _ => false,
        }
    }

    pub fn set_desired_conversation(&mut self, conversation: Option<ConversationRef>) {
        self.void(ResumeFailure::SelectionChanged);
        self.confirmed = None;
        self.desired = conversation;
    }

    /// Gate for every outgoing user message.
    pub fn ensure_bound(&mut self, link: LinkView<'_>, channel: &dyn Channel) -> ResumeHandle {
        self.negotiate(link, channel, false)
    }

    pub fn negotiate(
        &mut self,
        link: LinkView<'_>,
        channel: &dyn Channel,
        force: bool,
    ) -> ResumeHandle {
        let Some(target) = self.desired.clone() else {
            return ResumeHandle::ready(Ok(None));
        };

        if !link.state.is_connected() {
            return ResumeHandle::ready(Err(ResumeFailure::Connectivity {
                reason: format!("channel is {}", link.state),
            }));
        }

        if self
            .outstanding
            .as_ref()
            .is_some_and(|negotiation| negotiation.issued_on != link.generation)
        {
            self.void(ResumeFailure::Connectivity {
                reason: "connection replaced before the resume completed".to_string(),
            });
        }

        if !force
            && let Some(confirmed) = &self.confirmed
            && link.identity == Some(&confirmed.identity)
        {
            return ResumeHandle::ready(Ok(Some(confirmed.conversation.clone())));
        }

        if let Some(negotiation) = self.outstanding.as_mut() {
            return negotiation.subscribe();
        }

        let sent_under = match link.identity {
            Some(identity) => {
                if !channel.send(link.generation, &ClientMessage::resume(&target)) {
                    return ResumeHandle::ready(Err(ResumeFailure::Connectivity {
                        reason: "channel refused resume_conversation".to_string(),
                    }));
                }
                Some(identity.session_id.clone())
            }
            // Held back until `session_info` names the connection.
            None => None,
        };

        let id = NegotiationId(self.next_negotiation);
        self.next_negotiation += 1;
        tracing::debug!(
            negotiation = id.0,
            generation = %link.generation,
            session_id = %target.session_id,
            conversation_id = %target.conversation_id,
            sent = sent_under.is_some(),
            "resume negotiation issued"
        );

        let mut negotiation = ResumeNegotiation {
            id,
            issued_on: link.generation,
            sent_under,
            target,
            waiters: Vec::new(),
        };
        let handle = negotiation.subscribe();
        self.outstanding = Some(negotiation);
        handle
    }

    /// Reacts to a new live identity: stale bindings drop, held-back requests go out, and a
    /// desired conversation is re-negotiated automatically.
    pub fn on_session_established(&mut self, link: LinkView<'_>, channel: &dyn Channel) {
        let Some(identity) = link.identity else {
            return;
        };

        if self
            .confirmed
            .as_ref()
            .is_some_and(|confirmed| confirmed.identity != *identity)
        {
            self.confirmed = None;
        }

        let held_back = match self.outstanding.as_ref() {
            Some(negotiation) if negotiation.issued_on != link.generation => {
                self.void(ResumeFailure::Connectivity {
                    reason: "connection replaced before the resume completed".to_string(),
                });
                false
            }
            Some(negotiation) => match &negotiation.sent_under {
                None => true,
                Some(session_id) if *session_id != identity.session_id => {
                    self.void(ResumeFailure::Connectivity {
                        reason: "session replaced before the resume completed".to_string(),
                    });
                    false
                }
                Some(_) => return,
            },
            None => false,
        };

        if held_back {
            let sent = self.outstanding.as_ref().is_some_and(|negotiation| {
                channel.send(link.generation, &ClientMessage::resume(&negotiation.target))
            });
            if sent {
                if let Some(negotiation) = self.outstanding.as_mut() {
                    negotiation.sent_under = Some(identity.session_id.clone());
                }
            } else {
                self.void(ResumeFailure::Connectivity {
                    reason: "channel refused resume_conversation".to_string(),
                });
            }
            return;
        }

        if self.desired.is_some() {
            // Nobody is waiting on an automatic resume; the handle is dropped on purpose.
            drop(self.negotiate(link, channel, false));
        }
    }

    /// `resume_ok`: the server's values win over what was requested.
    pub fn on_resume_ok(
        &mut self,
        identity: Option<&ConnectionIdentity>,
        conversation: ConversationRef,
    ) -> bool {
        let Some(identity) = identity else {
            tracing::warn!("resume_ok arrived before session_info; ignoring");
            return false;
        };

        self.desired = Some(conversation.clone());
        self.confirmed = Some(ConfirmedBinding {
            identity: identity.clone(),
            conversation: conversation.clone(),
        });
        if let Some(negotiation) = self.outstanding.take() {
            negotiation.settle(Ok(Some(conversation)));
        }
        true
    }

    /// `resume_error`: binding cleared, desired conversation kept for a retry.
    pub fn on_resume_error(&mut self, reason: String) {
        self.confirmed = None;
        if let Some(negotiation) = self.outstanding.take() {
            negotiation.settle(Err(ResumeFailure::Rejected { reason }));
        }
    }

    /// `edit_ok`: a replay edit re-binds the connection server-side.
    pub fn on_edit_ok(
        &mut self,
        identity: Option<&ConnectionIdentity>,
        conversation: ConversationRef,
    ) {
        let Some(identity) = identity else {
            return;
        };
        self.desired = Some(conversation.clone());
        self.confirmed = Some(ConfirmedBinding {
            identity: identity.clone(),
            conversation,
        });
    }

    pub fn on_transport_lost(&mut self) {
        self.void(ResumeFailure::Connectivity {
            reason: "connection lost".to_string(),
        });
        self.confirmed = None;
    }

    fn void(&mut self, failure: ResumeFailure) {
        if let Some(negotiation) = self.outstanding.take() {
            tracing::debug!(negotiation = negotiation.id.0, failure = %failure, "resume negotiation voided");
            negotiation.settle(Err(failure));
        }
    }
}
