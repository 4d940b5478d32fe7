//! gms-server: game manager server.
//!
//! Accepts client connections, gives each one a [`structure::Structure`]
//! and serializes every inbound message and structure event through one
//! dispatch queue. The [`game_manager`] structure relays client
//! authentication to an upstream authentication server.

pub mod config;
pub mod game_manager;
pub mod server;
pub mod structure;

pub use config::{ConfigOverrides, ServerConfig};
pub use game_manager::{
    AuthState, GameManagerStructure, GameManagerStructureFactory,
    GameManagerStructureFactoryBuilder,
};
pub use server::ServerMessenger;
pub use structure::{Structure, StructureContext, StructureEvents, StructureFactory};
