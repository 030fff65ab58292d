//! # Error Types for the Staking Engine
//!
//! Every failure in script building, tree construction, transaction assembly,
//! signature collection and the explorer/storage collaborators is reported
//! through [`StakingError`]. Nothing is truncated or swallowed: a failure at
//! any stage aborts the pipeline that produced it.

use thiserror::Error;

/// Main error type for all staking operations
#[derive(Debug, Error)]
pub enum StakingError {
    /// Malformed staking parameters (rejected before any script work)
    #[error("Invalid staking parameters: {message}")]
    InvalidParameters { message: String },

    /// Degenerate or inconsistent Taproot script tree
    #[error("Script tree error: {message}")]
    ScriptTree { message: String },

    /// Funding UTXOs cannot cover the staking amount plus fee
    #[error("Insufficient funds: required {required} sats, available {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    /// Supplied prevout script does not match the derived Taproot scriptPubKey
    #[error("Script mismatch: expected {expected}, got {actual}")]
    ScriptMismatch { expected: String, actual: String },

    /// Not enough valid covenant signatures for a covenant-gated path
    #[error("Covenant threshold not met: required {required} valid signatures, collected {collected}")]
    ThresholdNotMet { required: usize, collected: usize },

    /// Staker authorization is mandatory on every spending path
    #[error("Missing staker signature for {path} path")]
    MissingStakerSignature { path: String },

    /// Chain height is below the height required by the timelock
    #[error("Timelock not matured: spendable at height {required_height}, chain is at {current_height}")]
    TimelockNotMatured {
        required_height: u32,
        current_height: u32,
    },

    /// Unbonding request payload disagrees with the transactions it references
    #[error("Invalid unbonding request: {message}")]
    InvalidRequest { message: String },

    /// Sighash computation or signature production failures
    #[error("Signing failed: {message}")]
    Signing { message: String },

    /// Script-path witness failed local verification
    #[error("Script verification failed: {message}")]
    ScriptVerification { message: String },

    /// Errors during transaction construction or decoding
    #[error("Transaction error: {message}")]
    Transaction { message: String },

    /// Network request failures (explorer API)
    #[error("Network request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    /// Explorer rejected the request; the remote body is passed through
    #[error("Explorer request failed: HTTP {status} - {body}")]
    Explorer { status: u16, body: String },

    /// Address parsing and validation errors
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    /// Staking record store failures
    #[error("Staking store error: {message}")]
    Storage { message: String },

    /// File I/O operations
    #[error("File operation failed: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON processing error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Result type alias for staking operations
pub type StakingResult<T> = Result<T, StakingError>;

impl StakingError {
    /// Create an invalid-parameters error
    pub fn params(message: impl Into<String>) -> Self {
        Self::InvalidParameters {
            message: message.into(),
        }
    }

    /// Create a script tree error
    pub fn tree(message: impl Into<String>) -> Self {
        Self::ScriptTree {
            message: message.into(),
        }
    }

    /// Create a signing error
    pub fn signing(message: impl Into<String>) -> Self {
        Self::Signing {
            message: message.into(),
        }
    }

    /// Create a transaction construction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create an invalid unbonding request error
    pub fn request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a script verification error
    pub fn verification(message: impl Into<String>) -> Self {
        Self::ScriptVerification {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Check if the caller may simply retry later (network or chain-height issues)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StakingError::Network { .. }
                | StakingError::Explorer { .. }
                | StakingError::TimelockNotMatured { .. }
        )
    }

    /// Check if the caller can recover by supplying more signatures or funds
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StakingError::ThresholdNotMet { .. }
                | StakingError::MissingStakerSignature { .. }
                | StakingError::InsufficientFunds { .. }
        )
    }

    /// Check if this error indicates stale or forged input data
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            StakingError::ScriptMismatch { .. }
                | StakingError::InvalidRequest { .. }
                | StakingError::ScriptVerification { .. }
        )
    }
}
