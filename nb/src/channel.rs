//! In-process bidirectional message channel
//!
//! A channel connects one context to the broker. Messages are delivered in
//! send order; dropping (or closing) either end is observed by the other end
//! as `recv` returning `None` and `send` failing.

use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::ipc::messages::{BrokerMessage, ClientMessage};

/// Broker side of a channel, handed to `CoordinatorHandle::add_session`
#[derive(Debug)]
pub struct BrokerEnd {
    pub(crate) tx: mpsc::Sender<BrokerMessage>,
    pub(crate) rx: mpsc::Receiver<ClientMessage>,
}

/// Context side of a channel
#[derive(Debug)]
pub struct ClientEnd {
    tx: mpsc::Sender<ClientMessage>,
    rx: mpsc::Receiver<BrokerMessage>,
}

/// Create a connected pair of channel ends
pub fn pair(buffer: usize) -> (BrokerEnd, ClientEnd) {
    let (to_client_tx, to_client_rx) = mpsc::channel(buffer.max(1));
    let (to_broker_tx, to_broker_rx) = mpsc::channel(buffer.max(1));
    (
        BrokerEnd {
            tx: to_client_tx,
            rx: to_broker_rx,
        },
        ClientEnd {
            tx: to_broker_tx,
            rx: to_client_rx,
        },
    )
}

impl BrokerEnd {
    pub(crate) fn split(self) -> (mpsc::Sender<BrokerMessage>, mpsc::Receiver<ClientMessage>) {
        (self.tx, self.rx)
    }
}

impl ClientEnd {
    /// Send a message to the broker
    pub async fn send(&self, msg: ClientMessage) -> Result<(), BrokerError> {
        self.tx.send(msg).await.map_err(|_| BrokerError::ChannelClosed)
    }

    /// Receive the next message from the broker, or `None` once the broker side closed
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }

    /// Split into a cloneable sender and the receiver
    pub fn split(self) -> (mpsc::Sender<ClientMessage>, mpsc::Receiver<BrokerMessage>) {
        (self.tx, self.rx)
    }
}
