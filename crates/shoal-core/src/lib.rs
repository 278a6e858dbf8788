//! shoal-core — wire format, chunk digests, peer roster, and inventory.
//! All other Shoal crates depend on this one.

pub mod chunk;
pub mod config;
pub mod inventory;
pub mod roster;
pub mod wire;

pub use chunk::{ChunkHash, CHUNK_SIZE};
pub use wire::{Packet, PacketType};
