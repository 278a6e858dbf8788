//! Reliable chunk transfer — the sender and receiver state machines
//! layered over raw datagrams.

pub mod receive;
pub mod upload;
