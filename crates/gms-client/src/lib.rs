//! gms-client: client side of the game manager service protocol.
//!
//! Used by game clients to talk to the game manager server, and by the game
//! manager server itself to talk to the client authentication server.
//!
//! ```no_run
//! use gms_client::ClientMessengerFactory;
//! use gms_core::messages::GameManagerMessage;
//! use gms_core::{ClientSocketConfig, EndpointConfig, HostPointer};
//!
//! # async fn example() -> gms_core::GmsResult<()> {
//! let factory = ClientMessengerFactory::<GameManagerMessage>::new(
//!     HostPointer::new("localhost", 35125),
//!     ClientSocketConfig::default(),
//!     EndpointConfig::default(),
//! );
//! let messenger = factory.get_client_messenger();
//! messenger.connect().await?;
//! messenger.on_receive(|m| println!("{m:?}"), |e| eprintln!("{e}"))?;
//! messenger.send(&GameManagerMessage::AuthenticateClientRequest).await?;
//! messenger.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod messenger;

pub use messenger::{ClientMessenger, ClientMessengerFactory};

// Re-export gms-core error types for convenience.
pub use gms_core::{GmsError, GmsResult};
