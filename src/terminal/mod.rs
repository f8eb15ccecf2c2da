//! Terminal emulation and command audit.
//!
//! ```text
//! screen.rs — character grid driven by vte
//! parser.rs — CommandParser: prompt/command/result extraction, forbidden rules
//! ```

pub mod parser;
pub mod screen;

pub use parser::{Blocked, CommandParser, ForbiddenRule, ParserOptions, DEFAULT_SCRUB_MARKERS};
pub use screen::Emulator;
