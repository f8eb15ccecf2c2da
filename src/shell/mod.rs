//! Local process management for CLI-backed sessions.
//!
//! Database sessions run the vendor CLI (`redis-cli`, `mysql`, `psql`,
//! `mongosh`) inside a PTY so the user gets line editing and a prompt the
//! terminal parser can follow.

pub mod pty;

use std::path::Path;

/// Whether `program` resolves to an executable on `PATH` (or is a path
/// that exists).
pub fn program_available(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).exists();
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
    })
}
