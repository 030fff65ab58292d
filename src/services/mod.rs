//! # Services Module
//!
//! External service integrations for the staking CLI.
//!
//! ## Components
//!
//! - **Explorer Client**: esplora block explorer API for UTXOs, fees, chain tip and broadcast

pub mod explorer_client;

pub use explorer_client::{ChainBackend, EsploraClient, FeeEstimates};
