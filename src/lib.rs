#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::too_many_arguments)]

//! jumpgate library: the connection fabric of a bastion host.
//!
//! The binary wires these together; they are exposed for embedding and for
//! tests:
//! - `connect` — session orchestrator, monitor attach, admin close
//! - `protocols` — SSH, Telnet, database CLI and guacd adapters
//! - `tunnel` — pooled SSH gateway clients and per-session tunnels
//! - `terminal` — ANSI parser, command audit, forbidden-command checks
//! - `guacd` — Guacamole protocol codec and handshake
//! - `recorder` / `storage` — asciinema recordings and replay storage
//! - `sshd` — SSH server front-end for native clients
//! - `routes` / `auth` — HTTP and WebSocket surface

pub mod auth;
pub mod config;
pub mod connect;
pub mod error;
pub mod guacd;
pub mod model;
pub mod policy;
pub mod protocols;
pub mod recorder;
pub mod routes;
pub mod schedule;
pub mod sessions;
pub mod shell;
pub mod signer;
pub mod ssh;
pub mod sshd;
pub mod state;
pub mod storage;
pub mod store;
pub mod terminal;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use connect::Orchestrator;
pub use error::ApiError;
pub use state::AppState;
