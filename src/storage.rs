//! # Staking Records
//!
//! Local persistence of broadcast stakes. The collection is a single JSON
//! array; every append or update rewrites the whole file. Records are
//! addressed by their position in the array or by staking txid.

use crate::error::{StakingError, StakingResult};
use crate::staking::{ScriptSet, StakingParameters};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Lifecycle state of a stake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Staked,
    UnbondingRequested,
    Withdrawn,
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WithdrawalStatus::Staked => write!(f, "staked"),
            WithdrawalStatus::UnbondingRequested => write!(f, "unbonding-requested"),
            WithdrawalStatus::Withdrawn => write!(f, "withdrawn"),
        }
    }
}

/// Persisted outcome of a broadcast staking transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingRecord {
    pub txid: String,
    pub staking_tx_hex: String,
    pub params: StakingParameters,
    pub scripts: ScriptSet,
    pub staking_amount: u64,
    pub fee: u64,
    pub fee_rate: u64,
    pub lock_height: Option<u32>,
    pub status: WithdrawalStatus,
    #[serde(default)]
    pub unbonding_txid: Option<String>,
    #[serde(default)]
    pub withdrawal_txid: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// JSON file holding every [`StakingRecord`]
#[derive(Debug, Clone)]
pub struct StakingStore {
    path: PathBuf,
}

impl StakingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records; a missing file is an empty collection
    pub fn load(&self) -> StakingResult<Vec<StakingRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(&self.path)?;
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&json)?)
    }

    fn save(&self, records: &[StakingRecord]) -> StakingResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(records)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn append(&self, record: StakingRecord) -> StakingResult<()> {
        let mut records = self.load()?;
        if records.iter().any(|existing| existing.txid == record.txid) {
            return Err(StakingError::storage(format!(
                "Staking record {} already exists",
                record.txid
            )));
        }
        log::debug!("Appending staking record {}", record.txid);
        records.push(record);
        self.save(&records)
    }

    /// Record at `index` in append order
    pub fn get(&self, index: usize) -> StakingResult<Option<StakingRecord>> {
        Ok(self.load()?.into_iter().nth(index))
    }

    pub fn find(&self, txid: &str) -> StakingResult<Option<StakingRecord>> {
        Ok(self.load()?.into_iter().find(|record| record.txid == txid))
    }

    /// Look up by array index when `key` is a decimal number, otherwise by txid
    pub fn lookup(&self, key: &str) -> StakingResult<Option<StakingRecord>> {
        match key.parse::<usize>() {
            Ok(index) if key.len() < 64 => self.get(index),
            _ => self.find(key),
        }
    }

    /// Move a stake to `status`, attaching the spending txid when given
    pub fn update_status(
        &self,
        txid: &str,
        status: WithdrawalStatus,
        spending_txid: Option<String>,
    ) -> StakingResult<StakingRecord> {
        let mut records = self.load()?;
        let record = records
            .iter_mut()
            .find(|record| record.txid == txid)
            .ok_or_else(|| StakingError::storage(format!("No staking record for {}", txid)))?;

        record.status = status;
        match status {
            WithdrawalStatus::UnbondingRequested => {
                if spending_txid.is_some() {
                    record.unbonding_txid = spending_txid;
                }
            }
            WithdrawalStatus::Withdrawn => {
                if spending_txid.is_some() {
                    record.withdrawal_txid = spending_txid;
                }
            }
            WithdrawalStatus::Staked => {}
        }
        let updated = record.clone();

        self.save(&records)?;
        log::info!("Staking record {} is now {}", txid, status);
        Ok(updated)
    }
}
