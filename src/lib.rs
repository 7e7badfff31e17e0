//! Sandbridge - workspace-confined terminals and agent runs behind an
//! authenticating gateway.
//!
//! Two servers live in this crate:
//!   * the sandbox host (`http_server`), which owns the workspaces, spawns
//!     processes and serves pseudo-terminal sessions over WebSocket;
//!   * the gateway (`gateway`), which authenticates callers, checks project
//!     ownership and bridges them to the sandbox host.

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

pub mod config;
pub mod error;
pub mod gateway;
pub mod http_server;
pub mod path_guard;
pub mod process;
pub mod registry;
pub mod relay;
pub mod state;
pub mod terminal;
pub mod validate;
pub mod workspace;

pub use error::{Error, Result};
