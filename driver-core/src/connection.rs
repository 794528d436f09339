use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::host::{IdentityToken, NodeIdentity};

/// One row of a topology query, the reporter's view of a cluster member.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerRow {
    pub address: SocketAddr,
    pub identity_token: IdentityToken,
    pub reachable: bool,
}

impl PeerRow {
    pub fn new(
        address: SocketAddr,
        identity_token: impl Into<IdentityToken>,
        reachable: bool,
    ) -> Self {
        Self {
            address,
            identity_token: identity_token.into(),
            reachable,
        }
    }
}

/// An established connection to a node, as provided by the wire protocol layer.
#[async_trait]
pub trait Connection: Debug + Send + Sync {
    fn address(&self) -> SocketAddr;

    /// Asks the remote who it is.
    async fn node_identity(&self) -> anyhow::Result<NodeIdentity>;

    /// Peer table of the remote, including itself.
    async fn topology(&self) -> anyhow::Result<Vec<PeerRow>>;

    /// Resolves once the connection is closed by either side.
    async fn closed(&self);

    async fn close(&self);
}

#[async_trait]
pub trait Connector: Debug + Send + Sync {
    async fn connect(&self, address: SocketAddr) -> anyhow::Result<Arc<dyn Connection>>;
}

/// Connects to `address` and reads the remote's identity, both bounded by
/// `timeout`. The connection is closed again when the identity cannot be read.
pub async fn probe(
    connector: &dyn Connector,
    address: SocketAddr,
    timeout: Duration,
) -> Result<(Arc<dyn Connection>, NodeIdentity), TopologyError> {
    let connection = match tokio::time::timeout(timeout, connector.connect(address)).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(error)) => return Err(TopologyError::transient(address, format!("{:#}", error))),
        Err(_) => {
            let reason = format!("timed out after {:?}", timeout);
            return Err(TopologyError::transient(address, reason));
        }
    };
    match tokio::time::timeout(timeout, connection.node_identity()).await {
        Ok(Ok(identity)) => Ok((connection, identity)),
        Ok(Err(error)) => {
            connection.close().await;
            Err(TopologyError::transient(address, format!("identity query failed: {:#}", error)))
        }
        Err(_) => {
            connection.close().await;
            Err(TopologyError::transient(address, "identity query timed out"))
        }
    }
}
