//! frpc-fleet - provisions the frpc tunnel client and supervises one frpc
//! process per server profile
//!
//! This library provides:
//! - Download of the latest frpc release for the host platform
//! - Installation from an uploaded zip or tar.gz archive
//! - One supervised frpc process per server id, with its own config and log file
//! - Log tailing and status queries for every supervised server
//! - An authenticated HTTP control API over all of the above

pub mod admin;
pub mod archive;
pub mod config;
pub mod error;
pub mod process;
pub mod provision;
pub mod release;
