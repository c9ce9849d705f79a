//! Gateway Protocol Definitions
//!
//! This crate defines the commands exchanged between a frontend and a backend
//! over a single physical link, and their binary wire encoding.

pub mod command;

pub use command::{ClientId, Command, CommandTag, ProtoError, WaitId};

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
