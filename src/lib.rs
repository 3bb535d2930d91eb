#![doc = concat!(
    "[![crates.io](https://img.shields.io/crates/v/", env!("CARGO_PKG_NAME"), ")](https://crates.io/crates/", env!("CARGO_PKG_NAME"), ")",
    " ",
    "[![docs.rs](https://img.shields.io/docsrs/", env!("CARGO_PKG_NAME"), ")](https://docs.rs/", env!("CARGO_PKG_NAME"), ")",
    " ",
    "![license](https://img.shields.io/crates/l/", env!("CARGO_PKG_NAME"), ")"
)]
#![doc = ""]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! The authenticators never touch a socket, they exchange decrypted payloads
//! through an implementation of [`transport::Transport`], and either process packets
//! one at a time with `dispatch`, or drive the whole exchange with `serve`.
//!
//! ### Server-side
//!
//! see [`server::Server`], verifying claims with a [`broker::Broker`],
//! or a blocking [`broker::Checker`] run on a [`pool::Pool`].
//!
//! ### Client-side
//!
//! see [`client::Client`], drawing credentials from a [`client::Secrets`] source.
//!
//! ### Reconnection
//!
//! see [`backoff::Reconnect`].
//!
//! [`SSH-USERAUTH`]: https://datatracker.ietf.org/doc/html/rfc4252

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    clippy::unwrap_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo,
    clippy::undocumented_unsafe_blocks
)]
#![forbid(unsafe_code)]

/// The name of the authentication service itself.
pub const SERVICE_NAME: &str = "ssh-userauth";

/// The name of the connection service, started by default once authenticated.
pub const CONNECTION_SERVICE_NAME: &str = "ssh-connection";

mod error;
pub use error::{Error, Result};

pub mod msg;

mod method;
pub use method::Method;

pub mod transport;

pub mod broker;

pub mod client;
pub mod server;

pub mod backoff;
pub mod pool;
