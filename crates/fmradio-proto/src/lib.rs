//! Shared types between the FM radio daemon and its clients: the framed JSON
//! control protocol, the configuration file model, platform paths and the
//! published state snapshot.

pub mod config;
pub mod freq;
pub mod platform;
pub mod protocol;
pub mod state;
