//! Client connection seam.

use crate::types::{ClientId, QueueEvent};
use crossbeam_channel::{bounded, Receiver, Sender, SendTimeoutError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Result of handing one event to a client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Ack,
    Timeout,
    Closed,
}

/// Delivers events to connected clients.
pub trait ClientTransport: Send + Sync {
    fn send(&self, client: &ClientId, event: &QueueEvent) -> SendOutcome;
}

/// In-process transport backed by one bounded channel per client.
///
/// A full channel past `send_timeout` reports `Timeout`; a dropped
/// [`ClientConnection`] reports `Closed`.
pub struct ChannelTransport {
    clients: RwLock<HashMap<ClientId, Sender<QueueEvent>>>,
    send_timeout: Duration,
}

impl ChannelTransport {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Open (or reopen) a connection for `client`.
    pub fn connect(&self, client: ClientId, buffer_size: usize) -> ClientConnection {
        let (sender, receiver) = bounded(buffer_size);
        self.clients.write().insert(client.clone(), sender);
        ClientConnection { client, receiver }
    }

    /// Close the server side of a connection.
    pub fn disconnect(&self, client: &ClientId) {
        self.clients.write().remove(client);
    }

    pub fn is_connected(&self, client: &ClientId) -> bool {
        self.clients.read().contains_key(client)
    }
}

impl ClientTransport for ChannelTransport {
    fn send(&self, client: &ClientId, event: &QueueEvent) -> SendOutcome {
        let sender = match self.clients.read().get(client) {
            Some(sender) => sender.clone(),
            None => return SendOutcome::Closed,
        };

        match sender.send_timeout(event.clone(), self.send_timeout) {
            Ok(()) => SendOutcome::Ack,
            Err(SendTimeoutError::Timeout(_)) => SendOutcome::Timeout,
            Err(SendTimeoutError::Disconnected(_)) => {
                self.clients.write().remove(client);
                SendOutcome::Closed
            }
        }
    }
}

/// Client end of a [`ChannelTransport`] connection.
pub struct ClientConnection {
    pub client: ClientId,
    pub receiver: Receiver<QueueEvent>,
}

impl ClientConnection {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<QueueEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<QueueEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<QueueEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<QueueEvent> {
        self.receiver.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemberId;

    #[test]
    fn test_outcomes() {
        let transport = ChannelTransport::new(Duration::from_millis(10));
        let client = ClientId::new("c");
        let marker = QueueEvent::marker(MemberId(1), 1);

        assert_eq!(transport.send(&client, &marker), SendOutcome::Closed);

        let conn = transport.connect(client.clone(), 1);
        assert_eq!(transport.send(&client, &marker), SendOutcome::Ack);
        assert_eq!(transport.send(&client, &marker), SendOutcome::Timeout);
        assert_eq!(conn.drain().len(), 1);

        drop(conn);
        assert_eq!(transport.send(&client, &marker), SendOutcome::Closed);
        assert!(!transport.is_connected(&client));
    }
}
