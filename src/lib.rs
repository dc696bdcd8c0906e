//! math-proxy: a Stratum mining proxy that validates shares before relaying
//! them upstream.
//!
//! Miners connect over line-delimited JSON-RPC. Every submitted share is
//! hashed and compared against the session's difficulty target; only shares
//! that meet it are forwarded.

pub mod config;
pub mod error;
pub mod hasher;
pub mod job;
pub mod protocols;
pub mod registry;
pub mod server;
pub mod share;
pub mod u256;
pub mod upstream;
