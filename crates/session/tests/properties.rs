use std::cell::RefCell;

use parley_protocol::{ClientMessage, ConversationId, ConversationRef, Inbound, RecordId, SessionId};
use parley_session::{
    Channel, ConnectionGeneration, ConnectionState, EngineEvent, ResumeFailure, SessionEngine,
    Submission, TransportEvent, TurnKind, TurnStatus,
};
use pretty_assertions::assert_eq;

#[derive(Default)]
struct FakeChannel {
    sent: RefCell<Vec<ClientMessage>>,
}

impl FakeChannel {
    fn resumes(&self) -> usize {
        self.sent
            .borrow()
            .iter()
            .filter(|message| matches!(message, ClientMessage::ResumeConversation { .. }))
            .count()
    }

    fn last(&self) -> Option<ClientMessage> {
        self.sent.borrow().last().cloned()
    }
}

impl Channel for FakeChannel {
    fn send(&self, _generation: ConnectionGeneration, message: &ClientMessage) -> bool {
        self.sent.borrow_mut().push(message.clone());
        true
    }

    fn reconnect(&self) {}

    fn close(&self) {}
}

struct Harness {
    engine: SessionEngine<FakeChannel>,
}

impl Harness {
    fn connected(generation: u64, session: &str) -> Self {
        let mut harness = Self {
            engine: SessionEngine::new(FakeChannel::default()),
        };
        harness.connect(generation, session);
        harness
    }

    fn connect(&mut self, generation: u64, session: &str) {
        self.state(ConnectionState::Connected, generation);
        self.frame(&format!(
            r#"{{"type":"session_info","session_id":"{session}"}}"#
        ));
    }

    fn state(&mut self, state: ConnectionState, generation: u64) {
        self.engine
            .handle_transport_event(TransportEvent::StateChanged {
                state,
                generation: ConnectionGeneration::new(generation),
            });
    }

    fn frame(&mut self, raw: &str) {
        let inbound = Inbound::decode(raw).unwrap();
        self.engine
            .handle_transport_event(TransportEvent::Frame(inbound));
    }

    fn channel(&self) -> &FakeChannel {
        self.engine.channel()
    }

    /// Completes one exchange and persists it under `record_id`.
    fn exchange(&mut self, text: &str, reply: &str, record_id: i64) {
        self.engine.submit(text, Vec::new()).unwrap();
        self.frame(&format!(r#"{{"type":"user_msg_received","content":"{text}"}}"#));
        self.frame(&format!(r#"{{"type":"ai_response_chunk","content":"{reply}"}}"#));
        self.frame(r#"{"type":"ai_response_end"}"#);
        self.frame(&format!(
            r#"{{"type":"record_saved","record_id":{record_id},"session_id":"S0","conversation_id":7}}"#
        ));
    }
}

fn conversation(session: &str, id: i64) -> ConversationRef {
    ConversationRef::new(SessionId::parse(session).unwrap(), ConversationId::new(id))
}

#[test]
fn concurrent_gates_share_one_negotiation() {
    let mut harness = Harness::connected(1, "S1");
    harness.engine.select_conversation(Some(conversation("S0", 7)));

    let mut first = harness.engine.ensure_bound();
    let mut second = harness.engine.ensure_bound();
    let submission = harness.engine.submit("hello", Vec::new()).unwrap();

    assert_eq!(submission, Submission::AwaitingResume);
    assert_eq!(harness.channel().resumes(), 1);

    harness.frame(r#"{"type":"resume_ok","session_id":"S0","conversation_id":7}"#);

    assert_eq!(first.try_outcome(), Some(Ok(Some(conversation("S0", 7)))));
    assert_eq!(second.try_outcome(), Some(Ok(Some(conversation("S0", 7)))));
    assert!(matches!(harness.channel().last(), Some(ClientMessage::UserMsg { .. })));
}

#[test]
fn reconnect_voids_the_stale_negotiation_and_rebinds_on_the_new_identity() {
    let mut harness = Harness::connected(1, "S1");
    harness.engine.select_conversation(Some(conversation("S0", 7)));
    let mut stale = harness.engine.ensure_bound();

    harness.state(ConnectionState::Reconnecting, 1);
    harness.state(ConnectionState::Connecting, 1);
    harness.connect(2, "S2");

    assert!(matches!(
        stale.try_outcome(),
        Some(Err(ResumeFailure::Connectivity { .. }))
    ));
    assert_eq!(harness.channel().resumes(), 2);
    assert!(harness.engine.snapshot().confirmed.is_none());

    harness.frame(r#"{"type":"resume_ok","session_id":"S0","conversation_id":7}"#);

    let confirmed = harness.engine.snapshot().confirmed.unwrap();
    assert_eq!(confirmed.identity.session_id.as_str(), "S2");
    assert_eq!(confirmed.identity.generation, ConnectionGeneration::new(2));
}

#[test]
fn ensure_bound_is_idempotent_once_confirmed() {
    let mut harness = Harness::connected(1, "S1");
    harness.engine.select_conversation(Some(conversation("S0", 7)));
    harness.frame(r#"{"type":"resume_ok","session_id":"S0","conversation_id":7}"#);
    let sent_before = harness.channel().sent.borrow().len();

    for _ in 0..3 {
        let mut handle = harness.engine.ensure_bound();
        assert_eq!(handle.try_outcome(), Some(Ok(Some(conversation("S0", 7)))));
    }

    assert_eq!(harness.channel().sent.borrow().len(), sent_before);
}

#[test]
fn chunks_render_in_arrival_order() {
    let mut harness = Harness::connected(1, "S1");
    let Submission::Sent(turn) = harness.engine.submit("spell it", Vec::new()).unwrap() else {
        panic!("expected an immediate send");
    };

    harness.frame(r#"{"type":"ai_response_start"}"#);
    for chunk in ["a", "b", "c"] {
        harness.frame(&format!(r#"{{"type":"ai_response_chunk","content":"{chunk}"}}"#));
    }
    harness.frame(r#"{"type":"ai_response_end","content":"xyz"}"#);

    let snapshot = harness.engine.snapshot();
    assert_eq!(snapshot.turns[0].id, turn);
    assert_eq!(snapshot.turns[0].response, "abc");
    assert_eq!(snapshot.turns[0].status(), TurnStatus::Completed);
}

#[test]
fn replay_edit_truncates_the_tail_and_adopts_the_edited_binding() {
    let mut harness = Harness::connected(1, "S1");
    harness.engine.select_conversation(Some(conversation("S0", 7)));
    harness.frame(r#"{"type":"resume_ok","session_id":"S0","conversation_id":7}"#);
    harness.exchange("one", "1", 101);
    harness.exchange("two", "2", 102);
    harness.exchange("three", "3", 103);
    harness.engine.take_events();

    harness
        .engine
        .submit_replay_edit(RecordId::new(102), "two, edited")
        .unwrap();

    let turns = harness.engine.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].user_text, "one");
    assert_eq!(
        turns[1].kind,
        TurnKind::ReplayEdit {
            supersedes: RecordId::new(102)
        }
    );
    assert_eq!(
        harness.channel().last(),
        Some(ClientMessage::ReplayEdit {
            session_id: SessionId::parse("S0").unwrap(),
            conversation_id: ConversationId::new(7),
            from_record_id: RecordId::new(102),
            new_user_input: "two, edited".to_string(),
        })
    );
    assert!(harness.engine.take_events().contains(&EngineEvent::TurnsTruncated {
        from: RecordId::new(102),
        removed: 2
    }));

    harness.frame(r#"{"type":"edit_ok","session_id":"S0","conversation_id":9}"#);

    let snapshot = harness.engine.snapshot();
    assert_eq!(snapshot.desired, Some(conversation("S0", 9)));
    assert_eq!(
        snapshot.confirmed.map(|binding| binding.conversation),
        Some(conversation("S0", 9))
    );
}

#[test]
fn resume_error_forces_a_fresh_request() {
    let mut harness = Harness::connected(1, "S1");
    harness.engine.select_conversation(Some(conversation("S0", 7)));
    harness.frame(r#"{"type":"resume_error","reason":"conversation not found"}"#);
    assert_eq!(harness.channel().resumes(), 1);

    let handle = harness.engine.ensure_bound();

    assert!(handle.is_pending());
    assert_eq!(harness.channel().resumes(), 2);
    assert_eq!(harness.engine.snapshot().desired, Some(conversation("S0", 7)));
}

#[test]
fn pause_then_late_chunk_then_end_completes_the_turn() {
    let mut harness = Harness::connected(1, "S1");
    harness.engine.submit("long answer please", Vec::new()).unwrap();
    harness.frame(r#"{"type":"ai_response_start"}"#);
    harness.frame(r#"{"type":"ai_response_chunk","content":"first "}"#);

    let paused = harness.engine.pause().unwrap();

    assert!(paused.is_some());
    assert!(!harness.engine.snapshot().generating);
    assert!(matches!(harness.channel().last(), Some(ClientMessage::Pause)));

    harness.frame(r#"{"type":"ai_response_chunk","content":"late"}"#);
    harness.frame(r#"{"type":"ai_response_end"}"#);

    let turn = &harness.engine.turns()[0];
    assert_eq!(turn.response, "first late");
    assert_eq!(turn.status(), TurnStatus::Completed);
    assert!(harness.engine.submit("next", Vec::new()).is_ok());
}

#[test]
fn unknown_tags_are_ignored_without_side_effects() {
    let mut harness = Harness::connected(1, "S1");
    harness.engine.take_events();

    harness.frame(r#"{"type":"brand_new_feature","payload":1}"#);

    assert!(harness.engine.take_events().is_empty());
    assert_eq!(harness.engine.snapshot().state, ConnectionState::Connected);
}
