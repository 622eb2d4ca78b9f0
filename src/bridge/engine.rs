//! Game Engine Boundary
//!
//! The engine owns its own linear memory. Delivering a packet means
//! allocating a buffer there, copying the datagram in, invoking the
//! native receive entry point and releasing the buffer.

use tracing::warn;

use crate::codec::packet::Packet;

/// Offset of a buffer inside engine memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnginePtr(pub usize);

/// The engine's native packet path.
pub trait GameEngine: Send + 'static {
    /// Allocate `len` bytes; `None` when the engine is out of memory.
    fn alloc(&mut self, len: usize) -> Option<EnginePtr>;

    /// Copy `bytes` into a buffer from [`alloc`](Self::alloc).
    fn write(&mut self, ptr: EnginePtr, bytes: &[u8]);

    /// Hand a received datagram to the engine.
    fn receive_packet(&mut self, from: u32, ptr: EnginePtr, len: usize);

    /// Release a buffer.
    fn free(&mut self, ptr: EnginePtr);
}

/// Marshal one packet into the engine.
///
/// Returns `false` when allocation failed and the packet was dropped.
pub fn deliver_packet<E: GameEngine + ?Sized>(engine: &mut E, packet: &Packet) -> bool {
    let len = packet.data.len();
    let Some(ptr) = engine.alloc(len) else {
        warn!(from = packet.from, len, "engine allocation failed, packet dropped");
        return false;
    };
    engine.write(ptr, &packet.data);
    engine.receive_packet(packet.from, ptr, len);
    engine.free(ptr);
    true
}
