//! Streaming conversation session engine.
//!
//! One persistent duplex connection carries a tagged JSON protocol. The engine reconciles the
//! conversation the user wants resumed against the identity the server assigns on every
//! (re)connect, gates outgoing messages on that binding, and tracks the single in-flight turn.
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod registry;
pub mod resume;
pub mod transport;
pub mod turn;

pub use driver::{BoxFuture, Command, HistorySource, run_session};
pub use engine::{EngineSnapshot, SessionEngine, Submission};
pub use error::{ResumeFailure, SessionError, SessionResult};
pub use events::{EngineEvent, NoticeLevel};
pub use flow::{FlowOutcome, FlowStage, ThinkingFlow, ToolStatus};
pub use registry::{ConnectionIdentity, SessionRegistry};
pub use resume::{ConfirmedBinding, ResumeCoordinator, ResumeHandle, ResumeOutcome};
pub use transport::{
    Channel, ConnectionGeneration, ConnectionState, ReconnectAttempt, ReconnectPolicy,
    TransportConfig, TransportEvent, TransportEvents, TransportHandle, WsTransport,
};
pub use turn::{PersistedTurn, RecordBinding, Turn, TurnId, TurnKind, TurnPhase, TurnStatus};
