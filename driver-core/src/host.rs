use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Cluster-issued identifier of a logical node, independent of its address.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IdentityToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdentityToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for IdentityToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What a freshly opened connection reports about the node answering on it.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub cluster_name: String,
    pub token: IdentityToken,
}

impl NodeIdentity {
    pub fn new(cluster_name: impl Into<String>, token: impl Into<IdentityToken>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            token: token.into(),
        }
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.cluster_name, self.token)
    }
}

/// Monotonically assigned record number. A new identity at an old address
/// always gets a new generation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Display for Generation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum HostState {
    Up,
    Down,
    Removed,
}

impl HostState {
    /// `Up` and `Down` move freely between each other, `Removed` is terminal.
    pub fn can_transition_to(&self, next: HostState) -> bool {
        !matches!(self, HostState::Removed) && *self != next
    }
}

impl Display for HostState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HostState::Up => "UP",
            HostState::Down => "DOWN",
            HostState::Removed => "REMOVED",
        };
        write!(f, "{}", name)
    }
}

/// Address plus generation. Components other than the registry hold these and
/// re-resolve them before acting.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct HostRef {
    pub address: SocketAddr,
    pub generation: Generation,
}

impl Display for HostRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.address, self.generation)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub address: SocketAddr,
    pub identity_token: IdentityToken,
    pub generation: Generation,
    pub state: HostState,
    pub last_seen_identity_token: IdentityToken,
    pub identity_suspect: bool,
    pub missed_refreshes: u32,
}

impl Host {
    pub(crate) fn new(
        address: SocketAddr,
        identity_token: IdentityToken,
        generation: Generation,
        state: HostState,
    ) -> Self {
        Self {
            address,
            last_seen_identity_token: identity_token.clone(),
            identity_token,
            generation,
            state,
            identity_suspect: false,
            missed_refreshes: 0,
        }
    }

    pub fn host_ref(&self) -> HostRef {
        HostRef {
            address: self.address,
            generation: self.generation,
        }
    }

    /// Applies `next` when the state machine allows it.
    pub(crate) fn transition_to(&mut self, next: HostState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == HostState::Up
    }

    pub fn is_down(&self) -> bool {
        self.state == HostState::Down
    }

    pub fn is_removed(&self) -> bool {
        self.state == HostState::Removed
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Host({}{}, {}, {})",
            self.address, self.generation, self.identity_token, self.state
        )
    }
}
