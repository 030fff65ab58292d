//! # btc-staking: Bitcoin Taproot Staking Library
//!
//! Builds the scripts, Taproot outputs and transactions of a staking
//! protocol in which a staker locks bitcoin under a timelock, can exit early
//! with the approval of an M-of-N covenant committee, and can be slashed by
//! the committee together with a finality provider.
//!
//! The [`staking`] module is pure: it never touches the network or disk.
//! Chain access lives in [`services`] and local records in [`storage`].

pub mod config;
pub mod error;
pub mod services;
pub mod staking;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use error::{StakingError, StakingResult};
pub use services::{ChainBackend, EsploraClient};
pub use staking::{
    CovenantQuorum, CovenantSigner, StakingParameters, StakingTransactionBuilder, WitnessAssembler,
};
pub use storage::{StakingRecord, StakingStore, WithdrawalStatus};
