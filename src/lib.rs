//! # openq
//!
//! Client-side engine for a proprietary instant-messaging wire protocol:
//! tag-framed binary envelopes, a symmetric payload cipher, sequence-numbered
//! request/reply transactions and a multi-round login handshake, carried over
//! TCP or UDP, optionally through an HTTP CONNECT proxy.
//!
//! The crate is layered bottom-up:
//!
//! - [`core`]: the wire format, envelope encoding, stream reassembly with
//!   resynchronization, and the payload cipher;
//! - [`protocol`]: sans-IO logic, command ids, the transaction table, the
//!   login state machine and post-login routing;
//! - [`transport`]: name resolution, proxy tunnelling and the TCP/UDP link
//!   with its server-rotation policy;
//! - [`service`]: the runnable client task tying it all together behind a
//!   pair of channels.
//!
//! ## Quick start
//!
//! ```no_run
//! use openq::config::EngineConfig;
//! use openq::service::client::{Client, ClientEvent};
//!
//! # async fn run() -> openq::error::Result<()> {
//! let config = EngineConfig::default_with_overrides(|c| {
//!     c.network.servers = vec!["im.example.net".into()];
//! });
//! let (client, mut events) = Client::spawn(config, 10001, "password")?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ClientEvent::LoggedIn { uid } => println!("online as {uid}"),
//!         ClientEvent::Protocol(ev) => println!("{ev:?}"),
//!         _ => {}
//!     }
//! }
//! client.join().await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;

pub use config::EngineConfig;
pub use error::{ProtocolError, Result};
pub use protocol::command::{Command, UpdateClass};
pub use protocol::dispatcher::Event;
pub use service::client::{Client, ClientCommand, ClientEvent};
pub use session::{Captcha, Session};
