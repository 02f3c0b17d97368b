use garden_core::wire::RegisterPayload;
use garden_core::ClientCommand;
use std::collections::BTreeSet;

/// Online identities as last broadcast by the server.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: BTreeSet<String>,
    local_identity: Option<String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the set wholesale. Returns true when membership changed.
    pub fn replace(&mut self, users: Vec<String>) -> bool {
        let next: BTreeSet<String> = users
            .into_iter()
            .map(|user| user.trim().to_string())
            .filter(|user| !user.is_empty())
            .collect();
        if next == self.online {
            return false;
        }
        self.online = next;
        true
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    pub fn online(&self) -> Vec<String> {
        self.online.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    /// Remembers the local identity and returns the registration to send.
    pub fn register(&mut self, user_id: &str) -> ClientCommand {
        self.local_identity = Some(user_id.to_string());
        registration(user_id)
    }

    pub fn local_identity(&self) -> Option<&str> {
        self.local_identity.as_deref()
    }

    /// Registration to re-send after the channel reconnects.
    pub fn reregistration(&self) -> Option<ClientCommand> {
        self.local_identity.as_deref().map(registration)
    }
}

fn registration(user_id: &str) -> ClientCommand {
    ClientCommand::Register(RegisterPayload {
        user_id: user_id.to_string(),
    })
}
