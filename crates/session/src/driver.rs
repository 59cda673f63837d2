//! Owns a `SessionEngine` on one task and feeds it transport events and user commands.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parley_protocol::{Attachment, ConversationRef, RecordId};
use tokio::sync::{mpsc, oneshot};

use crate::engine::{EngineSnapshot, SessionEngine, Submission};
use crate::error::SessionResult;
use crate::events::{EngineEvent, NoticeLevel};
use crate::transport::{Channel, TransportEvent};
use crate::turn::PersistedTurn;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// User intent delivered to the driver.
#[derive(Debug)]
pub enum Command {
    /// The outcome is always answered on `reply`, rejections included.
    Submit {
        text: String,
        attachments: Vec<Attachment>,
        reply: oneshot::Sender<SessionResult<Submission>>,
    },
    ReplayEdit {
        record_id: RecordId,
        text: String,
    },
    Select(Option<ConversationRef>),
    SwitchModel(String),
    Pause,
    Reconnect,
    Snapshot(oneshot::Sender<EngineSnapshot>),
    Shutdown,
}

/// Where persisted turns come from when local history has to be rebuilt.
pub trait HistorySource: Send + Sync + 'static {
    fn fetch_history(
        &self,
        conversation: ConversationRef,
    ) -> BoxFuture<'static, SessionResult<Vec<PersistedTurn>>>;
}

type FetchedHistory = (ConversationRef, SessionResult<Vec<PersistedTurn>>);

/// Runs until shutdown, the command sender is dropped, or the transport stops reporting.
///
/// History fetches run as separate tasks; their results come back through this loop so they
/// never touch engine state concurrently.
pub async fn run_session<C, S, H>(
    mut engine: SessionEngine<C>,
    mut transport: S,
    mut commands: mpsc::UnboundedReceiver<Command>,
    history: Arc<H>,
    output: mpsc::UnboundedSender<EngineEvent>,
) -> SessionEngine<C>
where
    C: Channel,
    S: Stream<Item = TransportEvent> + Unpin,
    H: HistorySource,
{
    let (history_tx, mut history_rx) = mpsc::unbounded_channel::<FetchedHistory>();

    loop {
        let mut stop = false;
        tokio::select! {
            event = transport.next() => match event {
                Some(event) => engine.handle_transport_event(event),
                None => {
                    tracing::info!("transport stopped reporting");
                    stop = true;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => {
                    engine.shutdown();
                    stop = true;
                }
                Some(command) => apply_command(&mut engine, command),
            },
            Some((conversation, fetched)) = history_rx.recv() => match fetched {
                Ok(turns) => {
                    engine.reconcile_history(conversation, turns);
                }
                Err(error) => {
                    tracing::warn!(error = %error, "history refresh failed");
                    engine.push_notice(NoticeLevel::Warning, error.to_string());
                }
            },
        }

        for event in engine.take_events() {
            if let EngineEvent::HistoryRefreshRequested(conversation) = &event {
                let source = Arc::clone(&history);
                let history_tx = history_tx.clone();
                let conversation = conversation.clone();
                tokio::spawn(async move {
                    let fetched = source.fetch_history(conversation.clone()).await;
                    let _ = history_tx.send((conversation, fetched));
                });
            }
            if output.send(event).is_err() {
                tracing::debug!("event receiver dropped; stopping session");
                stop = true;
                break;
            }
        }

        if stop {
            return engine;
        }
    }
}

fn apply_command<C: Channel>(engine: &mut SessionEngine<C>, command: Command) {
    let result = match command {
        Command::Submit {
            text,
            attachments,
            reply,
        } => match reply.send(engine.submit(text, attachments)) {
            Ok(()) => Ok(()),
            // Nobody is waiting for the answer; a rejection still becomes a notice.
            Err(unanswered) => unanswered.map(drop),
        },
        Command::ReplayEdit { record_id, text } => {
            engine.submit_replay_edit(record_id, text).map(drop)
        }
        Command::Select(conversation) => {
            engine.select_conversation(conversation);
            Ok(())
        }
        Command::SwitchModel(model) => engine.switch_model(model),
        Command::Pause => engine.pause().map(drop),
        Command::Reconnect => {
            engine.reconnect();
            Ok(())
        }
        Command::Snapshot(reply) => {
            let _ = reply.send(engine.snapshot());
            Ok(())
        }
        Command::Shutdown => {
            engine.shutdown();
            Ok(())
        }
    };

    if let Err(error) = result {
        tracing::warn!(error = %error, "command rejected");
        engine.push_notice(NoticeLevel::Error, error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::sync::Mutex;

    use parley_protocol::{ClientMessage, ConversationId, Inbound, SessionId};

    use super::*;
    use crate::error::SessionError;
    use crate::transport::{ConnectionGeneration, ConnectionState};

    #[derive(Default)]
    struct RecordingChannel {
        sent: RefCell<Vec<ClientMessage>>,
    }

    impl Channel for RecordingChannel {
        fn send(&self, _generation: ConnectionGeneration, message: &ClientMessage) -> bool {
            self.sent.borrow_mut().push(message.clone());
            true
        }

        fn reconnect(&self) {}

        fn close(&self) {}
    }

    struct FixedHistory {
        requested: Mutex<Vec<ConversationRef>>,
    }

    impl HistorySource for FixedHistory {
        fn fetch_history(
            &self,
            conversation: ConversationRef,
        ) -> BoxFuture<'static, SessionResult<Vec<PersistedTurn>>> {
            if let Ok(mut requested) = self.requested.lock() {
                requested.push(conversation.clone());
            }
            Box::pin(async move {
                Ok(vec![PersistedTurn {
                    record_id: RecordId::new(1),
                    conversation,
                    user_input: "earlier".to_string(),
                    ai_response: "answer".to_string(),
                }])
            })
        }
    }

    fn frame(raw: &str) -> TransportEvent {
        TransportEvent::Frame(Inbound::decode(raw).unwrap())
    }

    #[test]
    fn submit_outcome_goes_back_to_the_caller() {
        let mut engine = SessionEngine::new(RecordingChannel::default());

        let (reply_tx, mut reply_rx) = oneshot::channel();
        apply_command(
            &mut engine,
            Command::Submit {
                text: "  ".to_string(),
                attachments: Vec::new(),
                reply: reply_tx,
            },
        );
        assert!(matches!(
            reply_rx.try_recv(),
            Ok(Err(SessionError::EmptyInput { .. }))
        ));
        assert!(engine.take_events().is_empty());

        let (reply_tx, reply_rx) = oneshot::channel();
        drop(reply_rx);
        apply_command(
            &mut engine,
            Command::Submit {
                text: "  ".to_string(),
                attachments: Vec::new(),
                reply: reply_tx,
            },
        );
        assert!(matches!(
            engine.take_events().as_slice(),
            [EngineEvent::Notice {
                level: NoticeLevel::Error,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn selection_refetches_history_and_shutdown_returns_the_engine() {
        let (transport_tx, transport_rx) = futures::channel::mpsc::unbounded();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let history = Arc::new(FixedHistory {
            requested: Mutex::new(Vec::new()),
        });

        let conversation =
            ConversationRef::new(SessionId::parse("S0").unwrap(), ConversationId::new(7));
        transport_tx
            .unbounded_send(TransportEvent::StateChanged {
                state: ConnectionState::Connected,
                generation: ConnectionGeneration::new(1),
            })
            .unwrap();
        transport_tx
            .unbounded_send(frame(r#"{"type":"session_info","session_id":"S1"}"#))
            .unwrap();
        command_tx
            .send(Command::Select(Some(conversation.clone())))
            .unwrap();

        let session = tokio::spawn({
            let history = Arc::clone(&history);
            async move {
                let engine = run_session(
                    SessionEngine::new(RecordingChannel::default()),
                    transport_rx,
                    command_rx,
                    history,
                    output_tx,
                )
                .await;
                engine.turns().len()
            }
        });

        loop {
            match output_rx.recv().await {
                Some(EngineEvent::HistoryReplaced { turns, .. }) => {
                    assert_eq!(turns, 1);
                    break;
                }
                Some(_) => {}
                None => panic!("session ended before history arrived"),
            }
        }

        command_tx.send(Command::Shutdown).unwrap();
        assert_eq!(session.await.unwrap(), 1);
        assert_eq!(history.requested.lock().unwrap().as_slice(), &[conversation]);
        drop(transport_tx);
    }
}
