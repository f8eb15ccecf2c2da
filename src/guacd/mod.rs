//! Guacamole daemon client: framing and handshake.
//!
//! ```text
//! instruction.rs — Instruction, encode/parse, InstructionReader
//! tunnel.rs      — GuacdConfig, handshake state machine, split read/write halves
//! ```

pub mod instruction;
pub mod tunnel;

use thiserror::Error;

pub use instruction::{Instruction, InstructionReader};
pub use tunnel::{GuacdConfig, GuacdReader, GuacdTunnel, GuacdWriter, VERSION};

#[derive(Debug, Error)]
pub enum GuacdError {
    #[error("guacd io: {0}")]
    Io(#[from] std::io::Error),
    #[error("guacd dial timed out")]
    Timeout,
    #[error("guacd closed the connection")]
    Closed,
    #[error("malformed instruction: {0}")]
    Malformed(String),
    #[error("expect instruction \"{expected}\" but got \"{got}\"")]
    Unexpected { expected: String, got: String },
    #[error("empty connection id")]
    EmptyConnectionId,
}
