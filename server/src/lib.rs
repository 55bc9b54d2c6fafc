pub extern crate actix_web;

pub mod ban;
pub mod banlist_file;
pub mod config;
pub mod connection;
mod connection_tx_storage;
pub mod handlers;
pub mod json_api;
pub mod recording;
pub mod server;
pub mod session;
pub mod session_registry;
pub mod snapshot;
