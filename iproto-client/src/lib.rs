//! # iproto-client
//!
//! Client library for iproto servers.
//!
//! This crate provides:
//! - Connection setup: TCP connect, greeting, `chap-sha1` authentication
//! - A request multiplexer sharing one connection between many callers
//! - A typed API for the common data commands

pub mod client;
pub mod connection;
pub mod error;
pub mod mux;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
pub use mux::{Multiplexer, SyncGenerator};
