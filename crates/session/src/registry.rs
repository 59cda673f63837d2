use parley_protocol::SessionId;

use crate::transport::ConnectionGeneration;

/// Identity of the live link: which handshake, and what the server called it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    pub generation: ConnectionGeneration,
    pub session_id: SessionId,
}

/// Holds the server-assigned session identity for the current connection only.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    current: Option<ConnectionIdentity>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&ConnectionIdentity> {
        self.current.as_ref()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.current.as_ref().map(|identity| &identity.session_id)
    }

    /// Records the identity announced by `session_info`; returns the one it replaced.
    pub fn establish(
        &mut self,
        generation: ConnectionGeneration,
        session_id: SessionId,
    ) -> Option<ConnectionIdentity> {
        self.current.replace(ConnectionIdentity {
            generation,
            session_id,
        })
    }

    /// Drops the identity; called on every transition away from `Connected`.
    pub fn invalidate(&mut self) -> Option<ConnectionIdentity> {
        self.current.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_new_session_replaces_the_previous_identity() {
        let mut registry = SessionRegistry::new();
        assert!(registry.establish(ConnectionGeneration::new(1), SessionId::parse("S1").unwrap()).is_none());

        let replaced = registry
            .establish(ConnectionGeneration::new(2), SessionId::parse("S2").unwrap())
            .unwrap();
        assert_eq!(replaced.session_id.as_str(), "S1");
        assert_eq!(registry.session_id().map(SessionId::as_str), Some("S2"));

        registry.invalidate();
        assert!(registry.current().is_none());
    }
}
