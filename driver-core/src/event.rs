use std::fmt::{Display, Formatter};

use crate::host::{Host, HostRef};

/// Change notifications published by the registry, in mutation order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HostEvent {
    Added(Host),
    Up(Host),
    Down(Host),
    Removed(Host),
}

impl HostEvent {
    pub fn host(&self) -> &Host {
        match self {
            HostEvent::Added(host)
            | HostEvent::Up(host)
            | HostEvent::Down(host)
            | HostEvent::Removed(host) => host,
        }
    }

    pub fn host_ref(&self) -> HostRef {
        self.host().host_ref()
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::Added(_) => "Added",
            HostEvent::Up(_) => "Up",
            HostEvent::Down(_) => "Down",
            HostEvent::Removed(_) => "Removed",
        }
    }
}

impl Display for HostEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.host())
    }
}
