use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::host::Host;

/// Immutable view of every non removed host, ordered by address.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    hosts: Vec<Host>,
}

impl TopologySnapshot {
    pub(crate) fn new(hosts: Vec<Host>) -> Self {
        debug_assert!(hosts.iter().all(|host| !host.is_removed()));
        Self { hosts }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter()
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&Host> {
        self.hosts
            .binary_search_by_key(address, |host| host.address)
            .ok()
            .map(|index| &self.hosts[index])
    }

    pub fn up_hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(|host| host.is_up())
    }

    pub fn down_hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(|host| host.is_down())
    }

    pub fn up_count(&self) -> usize {
        self.up_hosts().count()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl Display for TopologySnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TopologySnapshot [{}]", self.hosts.iter().join(", "))
    }
}

impl<'a> IntoIterator for &'a TopologySnapshot {
    type Item = &'a Host;
    type IntoIter = std::slice::Iter<'a, Host>;

    fn into_iter(self) -> Self::IntoIter {
        self.hosts.iter()
    }
}
