pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod intake;
pub mod kafka;
pub mod models;
pub mod processor;
pub mod spatial;

#[cfg(test)]
mod test_support;

pub use client::FleetClient;
pub use intake::{AckLevel, Depot, FleetModule};
