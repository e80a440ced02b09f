//! Outbound path: serialize → seal → frame → queue on the client's writer.
//!
//! Every send is fire-and-forget. A client is always resolved by identity at
//! the moment of sending; nothing here keeps a session reference.

use bytes::Bytes;

use crate::cipher::Cipher;
use crate::error::{HomewireError, Result};
use crate::protocol::{self, Outbound};
use crate::registry::ConnectionRegistry;

/// Result of a fan-out send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

/// Turns outbound documents into wire frames and hands them to sessions.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    cipher: Cipher,
}

impl Outbox {
    pub fn new(cipher: Cipher) -> Self {
        Self { cipher }
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    /// Build the complete wire frame for `message`.
    pub fn prepare(&self, message: &Outbound) -> Result<Bytes> {
        let json = message.to_json()?;
        let sealed = self.cipher.seal(&json)?;
        Ok(protocol::encode(&sealed))
    }

    /// Send `message` to one client.
    pub fn send_to(&self, registry: &ConnectionRegistry, identity: &str, message: &Outbound) -> Result<()> {
        let session = registry
            .lookup(identity)
            .ok_or_else(|| HomewireError::UnknownClient(identity.to_string()))?;
        let frame = self.prepare(message)?;
        session.send(frame)
    }

    /// Send `message` to every occupied slot.
    ///
    /// Individual failures are logged and counted, never propagated, so one
    /// bad peer cannot block delivery to the rest.
    pub fn fan_out(&self, registry: &ConnectionRegistry, message: &Outbound) -> Result<FanOut> {
        let frame = self.prepare(message)?;
        let mut result = FanOut::default();

        for session in registry.sessions() {
            match session.send(frame.clone()) {
                Ok(()) => result.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        identity = %session.identity(),
                        queued = session.queued(),
                        "Broadcast send failed: {}",
                        e
                    );
                    result.failed += 1;
                }
            }
        }

        tracing::debug!(
            delivered = result.delivered,
            failed = result.failed,
            "Broadcast fanned out"
        );
        Ok(result)
    }
}
