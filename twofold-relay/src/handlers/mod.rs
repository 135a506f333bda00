//! HTTP handlers.

pub mod rendezvous;
pub mod time;
