//! telecall - video-call signaling and frame relay
//!
//! Transport layer for two-party therapy video calls: tokenized invitation
//! links, presence over a pub/sub room, still-frame video relay and the
//! connection lifecycle that ties them together.

pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod invite;
pub mod media;
pub mod presence;
pub mod session;
