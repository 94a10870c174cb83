//! Waypath node: hosts a transport core behind channel handles.

pub mod config;
pub mod peerstore;
pub mod service;

pub use service::{Command, CommunicatorEvent, CoreEvent, Service};
