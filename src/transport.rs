//! The boundary between the authentication engine and the underlying SSH transport.

use futures::Future;

use crate::{
    msg::{DisconnectReason, Packet},
    Result,
};

/// A direction of the transport, relative to the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Packets received from the peer.
    Incoming,

    /// Packets sent to the peer.
    Outgoing,
}

/// An established SSH transport, over which the `SSH-USERAUTH` service runs.
///
/// The engine never frames, encrypts or compresses packets itself,
/// it only exchanges decrypted payloads through this trait.
pub trait Transport {
    /// Send a single packet to the peer.
    fn send(&mut self, packet: Packet) -> impl Future<Output = Result<()>>;

    /// Receive the next packet from the peer.
    fn recv(&mut self) -> impl Future<Output = Result<Packet>>;

    /// Send a disconnection message to the peer and tear down the transport.
    fn disconnect(
        &mut self,
        reason: DisconnectReason,
        description: &str,
    ) -> impl Future<Output = Result<()>>;

    /// Whether the provided direction of the transport is currently encrypted.
    fn is_encrypted(&self, direction: Direction) -> bool;

    /// The session identifier, the exchange hash of the first key-exchange.
    fn session_id(&self) -> &[u8];

    /// Hand the transport to the next service once authenticated.
    fn set_service(&mut self, name: &str);
}
