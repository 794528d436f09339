use std::net::SocketAddr;

use itertools::Itertools;
use thiserror::Error;

use crate::host::{Generation, NodeIdentity};

pub type Result<T, E = TopologyError> = core::result::Result<T, E>;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum TopologyError {
    #[error("no reachable host among [{}]", .tried.iter().join(", "))]
    NoReachableHost { tried: Vec<SocketAddr> },
    #[error("host {address} answered as {observed}, expected {expected}")]
    IdentityMismatch {
        address: SocketAddr,
        expected: NodeIdentity,
        observed: NodeIdentity,
    },
    #[error("connect to {address} failed: {reason}")]
    TransientConnectFailure { address: SocketAddr, reason: String },
    #[error("reconciliation skipped: {reason}")]
    ReconciliationSkipped { reason: String },
    #[error("host record {address}{generation} is no longer current")]
    StaleHost {
        address: SocketAddr,
        generation: Generation,
    },
    #[error("cluster is closed")]
    ClusterClosed,
}

impl TopologyError {
    pub(crate) fn transient(address: SocketAddr, reason: impl ToString) -> Self {
        TopologyError::TransientConnectFailure {
            address,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn skipped(reason: impl ToString) -> Self {
        TopologyError::ReconciliationSkipped {
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::TopologyError;
    use crate::host::NodeIdentity;

    #[test]
    fn test_display() -> anyhow::Result<()> {
        let error = TopologyError::NoReachableHost {
            tried: vec!["127.0.0.1:1".parse()?, "127.0.0.2:1".parse()?],
        };
        assert_eq!(error.to_string(), "no reachable host among [127.0.0.1:1, 127.0.0.2:1]");
        let error = TopologyError::IdentityMismatch {
            address: "127.0.0.1:1".parse()?,
            expected: NodeIdentity::new("main", "a"),
            observed: NodeIdentity::new("other", "b"),
        };
        assert_eq!(error.to_string(), "host 127.0.0.1:1 answered as other/b, expected main/a");
        Ok(())
    }
}
