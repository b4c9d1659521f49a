//! Async client protocol engine for Loxone Miniserver home automation
//! systems.
//!
//! The Miniserver speaks a proprietary binary framing protocol over a
//! persistent WebSocket, with JSON command/response payloads layered on
//! top. This crate implements the client side of that protocol:
//!
//! - connection lifecycle with a firmware-dependent authentication
//!   handshake (password or token, optionally encrypted commands)
//! - strict single-in-flight command/response correlation
//! - continuous decoding of unsolicited binary state frames
//! - fan-out of value/text state updates to registered subscribers
//!
//! # Example
//!
//! ```no_run
//! use loxone_client::{
//!     ConnectionConfig, Credentials, MiniserverAddress, MiniserverConnection,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> loxone_client::Result<()> {
//! let config = ConnectionConfig::new(MiniserverAddress::new("192.168.1.77"));
//! let connection = MiniserverConnection::new(config);
//! connection.set_credentials(Credentials::new("app", "secret"))?;
//!
//! connection.open(CancellationToken::new()).await?;
//! let structure = connection.download_structure_file().await?;
//! connection.enable_status_updates().await?;
//!
//! let uuid = structure.controls().keys().next().copied().unwrap();
//! let response = connection.command(uuid, "on").await?;
//! println!("status {}", response.code);
//!
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod client;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod events;
pub mod structure;
pub mod uuid;

// Re-export main types for convenience
pub use client::auth::AuthToken;
pub use client::command::LxResponse;
pub use client::message::{MessageHeader, MessageIdentifier, TextState, ValueState};
pub use client::{ConnectionState, FirmwareVersion, MiniserverConnection, MiniserverInfo};
pub use config::{AuthenticationMethod, ConnectionConfig, Credentials, MiniserverAddress};
pub use context::MiniserverContext;
pub use crypto::CommandEncryption;
pub use error::{LoxoneError, Result};
pub use events::{EventRouter, SubscriberTable};
pub use structure::StructureFile;
pub use uuid::Uuid;
