// Node-to-node delivery of encoded entities. The in-process transport is one
// bounded channel per owner node.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("node {0} does not exist")]
    UnknownNode(usize),
    #[error("node {0} stopped receiving")]
    Closed(usize),
    #[error("node {node} unavailable: {reason}")]
    Unavailable { node: usize, reason: String },
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    fn nodes(&self) -> usize;
    async fn send(&self, node: usize, frame: Bytes) -> Result<(), TransportError>;
}

pub struct ChannelTransport {
    nodes: Vec<mpsc::Sender<Bytes>>,
}

impl ChannelTransport {
    /// Transport plus the receiving end of every node, indexed by node.
    pub fn new(nodes: usize, capacity: usize) -> (Self, Vec<mpsc::Receiver<Bytes>>) {
        let (senders, receivers) = (0..nodes.max(1)).map(|_| mpsc::channel(capacity)).unzip();
        (Self { nodes: senders }, receivers)
    }
}

#[async_trait]
impl RemoteTransport for ChannelTransport {
    fn nodes(&self) -> usize {
        self.nodes.len()
    }

    async fn send(&self, node: usize, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.nodes.get(node).ok_or(TransportError::UnknownNode(node))?;
        tx.send(frame).await.map_err(|_| TransportError::Closed(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_reach_their_node() {
        let (transport, mut receivers) = ChannelTransport::new(2, 4);
        transport.send(1, Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(receivers[1].recv().await.unwrap(), Bytes::from_static(b"x"));
        assert!(receivers[0].try_recv().is_err());
        assert_eq!(
            transport.send(5, Bytes::new()).await,
            Err(TransportError::UnknownNode(5))
        );
    }

    #[tokio::test]
    async fn dropped_receiver_reports_closed() {
        let (transport, receivers) = ChannelTransport::new(1, 1);
        drop(receivers);
        assert_eq!(
            transport.send(0, Bytes::new()).await,
            Err(TransportError::Closed(0))
        );
    }
}
