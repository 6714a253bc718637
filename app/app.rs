use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wagerpool::{
    custody::{Custody, MemoryCustody, RpcCustody},
    node::{self, Node},
};

use crate::cli::Config;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Custody(#[from] wagerpool::custody::Error),
    #[error(transparent)]
    Node(#[from] node::Error),
}

#[derive(Clone)]
pub struct App {
    pub node: Node,
    /// Cancelled to stop the server
    pub shutdown: CancellationToken,
}

impl App {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let custody: Arc<dyn Custody> = match &config.custody_url {
            Some(url) => Arc::new(RpcCustody::new(url, config.custody_timeout)?),
            None => {
                tracing::warn!(
                    "no custody service configured, vault funds are held in memory"
                );
                Arc::new(MemoryCustody::new())
            }
        };
        let node = Node::new(config.node.clone(), custody)?;
        Ok(Self {
            node,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the periodic timeline sweep, stopping on shutdown
    pub fn spawn_timeline_task(&self, period: std::time::Duration) {
        let node = self.node.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = node.run_timeline_task(period) => (),
                () = shutdown.cancelled() => {
                    tracing::debug!("timeline task stopped");
                }
            }
        });
    }
}
