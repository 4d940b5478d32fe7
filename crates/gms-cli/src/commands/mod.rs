//! CLI subcommands.

pub mod authenticate;

use std::path::PathBuf;

/// Where to reach the game manager server.
pub struct Target {
    pub host: String,
    pub port: u16,
    pub root_cert: Option<PathBuf>,
}
