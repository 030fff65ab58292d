//! # btc-staking: Bitcoin Taproot Staking CLI
//!
//! Command line front end for the staking library. It locks bitcoin in a
//! Taproot staking output, asks the covenant committee to co-sign early
//! unbonding, and withdraws matured outputs.
//!
//! ## Staking Flow
//!
//! ```text
//! ┌─────────────┐   stake   ┌─────────────┐   unbond + cosign   ┌─────────────┐
//! │   Staker    │ ────────> │   Staking   │ ──────────────────> │  Unbonding  │
//! │   Wallet    │           │   Output    │                     │   Output    │
//! └─────────────┘           └─────────────┘                     └─────────────┘
//!                                  │                                   │
//!                                  │ withdraw --from timelock          │ withdraw --from unbonded
//!                                  ▼                                   ▼
//!                           ┌─────────────┐                     ┌─────────────┐
//!                           │   Staker    │                     │   Staker    │
//!                           │   Wallet    │                     │   Wallet    │
//!                           └─────────────┘                     └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Inspect scripts and addresses for a parameter file
//! btc-staking scripts --params params.json
//!
//! # Fund and broadcast the staking transaction
//! btc-staking stake --params params.json --secret <staker-secret-hex> --broadcast
//!
//! # Staker asks for early unbonding; committee co-signs
//! btc-staking unbond --txid <staking-txid> --secret <staker-secret-hex> --out request.json
//! btc-staking cosign --request request.json --params params.json \
//!     --covenant-secret <hex> --covenant-secret <hex> --broadcast
//!
//! # Withdraw once the timelock has matured
//! btc-staking withdraw --txid <staking-txid> --from unbonded --secret <staker-secret-hex> --broadcast
//! ```
//!
//! ## Environment
//!
//! - `ESPLORA_URL`: explorer API base (default: mempool.space signet)
//! - `BITCOIN_NETWORK`: bitcoin, testnet, signet or regtest
//! - `STAKING_DATA_FILE`: staking record file (default: `~/.btc-staking/staking_records.json`)

use anyhow::{anyhow, bail, Context, Result};
use bitcoin::{
    consensus::encode::{deserialize, serialize_hex},
    key::Keypair,
    secp256k1::Secp256k1,
    Amount, OutPoint, ScriptBuf, Transaction,
};
use btc_staking::{
    config::AppConfig,
    services::{ChainBackend, EsploraClient},
    staking::{
        create_unbonding_request, ensure_matured, process_unbonding_request, sign_key_path_inputs,
        staker_address, verify_script_path_input, CovenantSigner, LocalCovenantSigner, SpendPath,
        SpendSignatures, StakingParameters, StakingTransactionBuilder, UnbondingRequest,
        WithdrawalSource, WitnessAssembler,
    },
    storage::{StakingRecord, StakingStore, WithdrawalStatus},
    utils::{address, amount, time, txid as txid_utils},
    StakingError,
};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Output a withdrawal spends
#[derive(Clone, Copy, Debug, ValueEnum)]
enum WithdrawFrom {
    /// Unbonding output, after the unbonding timelock
    Unbonded,
    /// Staking output, after the staking timelock
    Timelock,
}

impl From<WithdrawFrom> for WithdrawalSource {
    fn from(value: WithdrawFrom) -> Self {
        match value {
            WithdrawFrom::Unbonded => WithdrawalSource::Unbonded,
            WithdrawFrom::Timelock => WithdrawalSource::StakingTimelock,
        }
    }
}

#[derive(Parser)]
#[command(name = "btc-staking")]
#[command(about = "Bitcoin Taproot staking with covenant-gated unbonding")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the scripts and addresses derived from a parameter file
    Scripts {
        /// Staking parameter file (JSON)
        #[arg(short, long)]
        params: PathBuf,
    },
    /// Fund and sign a staking transaction
    Stake {
        /// Staking parameter file (JSON)
        #[arg(short, long)]
        params: PathBuf,
        /// Staker secret key (hex)
        #[arg(long)]
        secret: String,
        /// Broadcast and record the transaction
        #[arg(long, default_value_t = false)]
        broadcast: bool,
    },
    /// Create a staker-signed unbonding request
    Unbond {
        /// Staking transaction ID or record index
        #[arg(long)]
        txid: String,
        /// Staker secret key (hex)
        #[arg(long)]
        secret: String,
        /// Unbonding fee in sats (estimated from the fee rate when omitted)
        #[arg(long)]
        fee: Option<u64>,
        /// Write the request here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Co-sign an unbonding request as the covenant committee
    Cosign {
        /// Unbonding request file (JSON)
        #[arg(short, long)]
        request: PathBuf,
        /// Staking parameter file (JSON)
        #[arg(short, long)]
        params: PathBuf,
        /// Covenant member secret key (hex), repeat once per member
        #[arg(long = "covenant-secret", required = true)]
        covenant_secrets: Vec<String>,
        /// Unbonding fee in sats (estimated from the fee rate when omitted)
        #[arg(long)]
        fee: Option<u64>,
        /// Broadcast the co-signed transaction
        #[arg(long, default_value_t = false)]
        broadcast: bool,
    },
    /// Withdraw a matured output back to the staker
    Withdraw {
        /// Staking transaction ID or record index
        #[arg(long)]
        txid: String,
        /// Output to withdraw from
        #[arg(long, value_enum, default_value = "unbonded")]
        from: WithdrawFrom,
        /// Staker secret key (hex)
        #[arg(long)]
        secret: String,
        /// Destination address (defaults to the staker's key-path address)
        #[arg(long)]
        destination: Option<String>,
        /// Broadcast and mark the record withdrawn
        #[arg(long, default_value_t = false)]
        broadcast: bool,
    },
    /// List local staking records
    Records,
    /// Show recommended network fee rates
    Fees,
    /// Show the current block height
    Height,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    log::debug!(
        "Using {} on {} with records at {}",
        config.esplora_url,
        config.network,
        config.data_file.display()
    );

    match cli.command {
        Commands::Scripts { params } => {
            show_scripts(&params)?;
        }
        Commands::Stake {
            params,
            secret,
            broadcast,
        } => {
            stake(&config, &params, &secret, broadcast).await?;
        }
        Commands::Unbond {
            txid,
            secret,
            fee,
            out,
        } => {
            unbond(&config, &txid, &secret, fee, out.as_deref())?;
        }
        Commands::Cosign {
            request,
            params,
            covenant_secrets,
            fee,
            broadcast,
        } => {
            cosign(&config, &request, &params, &covenant_secrets, fee, broadcast).await?;
        }
        Commands::Withdraw {
            txid,
            from,
            secret,
            destination,
            broadcast,
        } => {
            withdraw(&config, &txid, from, &secret, destination.as_deref(), broadcast).await?;
        }
        Commands::Records => {
            list_records(&config)?;
        }
        Commands::Fees => {
            let fees = EsploraClient::new(&config.esplora_url)?.get_network_fees().await?;
            println!("Recommended fee rates (sat/vB):");
            println!("  Fastest:   {}", fees.fastest_fee);
            println!("  Half hour: {}", fees.half_hour_fee);
            println!("  Hour:      {}", fees.hour_fee);
            println!("  Economy:   {}", fees.economy_fee);
            println!("  Minimum:   {}", fees.minimum_fee);
        }
        Commands::Height => {
            let height = EsploraClient::new(&config.esplora_url)?.get_block_height().await?;
            println!("{}", height);
        }
    }

    Ok(())
}

fn load_params(path: &Path) -> Result<StakingParameters> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameter file {}", path.display()))?;
    let params: StakingParameters = serde_json::from_str(&json)
        .with_context(|| format!("Invalid parameter file {}", path.display()))?;
    params.validate()?;
    Ok(params)
}

fn parse_keypair(secret: &str) -> Result<Keypair> {
    Keypair::from_seckey_str(&Secp256k1::new(), secret.trim())
        .map_err(|e| anyhow!("Invalid secret key: {}", e))
}

fn staker_keypair(secret: &str, params: &StakingParameters) -> Result<Keypair> {
    let keypair = parse_keypair(secret)?;
    if keypair.x_only_public_key().0 != params.staker_key {
        bail!("Secret key does not belong to staker key {}", params.staker_key);
    }
    Ok(keypair)
}

fn decode_transaction(tx_hex: &str) -> Result<Transaction> {
    let bytes = hex::decode(tx_hex.trim()).context("Transaction is not valid hex")?;
    deserialize(&bytes).context("Transaction does not decode")
}

/// Resolve a record by array index or by staking txid
fn require_record(store: &StakingStore, key: &str) -> Result<StakingRecord> {
    if key.parse::<usize>().is_err() {
        txid_utils::validate(key)?;
    }
    store
        .lookup(key)?
        .ok_or_else(|| anyhow!("No staking record for {} in {}", key, store.path().display()))
}

fn show_scripts(params_file: &Path) -> Result<()> {
    let builder = StakingTransactionBuilder::new(load_params(params_file)?)?;
    let scripts = builder.scripts();

    println!("📜 Staking Scripts:");
    println!("  Timelock:           {}", scripts.timelock.to_hex_string());
    println!("  Unbonding:          {}", scripts.unbonding.to_hex_string());
    println!("  Slashing:           {}", scripts.slashing.to_hex_string());
    println!("  Unbonding timelock: {}", scripts.unbonding_timelock.to_hex_string());
    println!("  Data embed:         {}", scripts.data_embed.to_hex_string());
    println!();
    println!("🏛️  Addresses:");
    println!("  Staking:   {}", builder.staking_output().address);
    println!("  Unbonding: {}", builder.unbonding_output().address);
    println!(
        "  Staker:    {}",
        staker_address(builder.params().staker_key, builder.params().network)
    );
    Ok(())
}

async fn stake(config: &AppConfig, params_file: &Path, secret: &str, broadcast: bool) -> Result<()> {
    let params = load_params(params_file)?;
    let keypair = staker_keypair(secret, &params)?;
    let builder = StakingTransactionBuilder::new(params)?;
    let backend = EsploraClient::new(&config.esplora_url)?;

    let funding_address = staker_address(builder.params().staker_key, builder.params().network);
    let height = backend.get_block_height().await?;
    println!(
        "Staking {} from {} at height {}",
        amount::format_dual(builder.params().staking_amount),
        address::format_short(&funding_address.to_string()),
        height
    );

    // the fee depends on how many inputs are selected, so widen the target until it fits
    let mut target = builder.params().staking_amount;
    let unsigned = loop {
        let utxos = backend
            .get_funding_utxos(&funding_address.to_string(), target)
            .await?;
        if utxos.is_empty() {
            let balance = backend.get_address_balance(&funding_address.to_string()).await?;
            return Err(StakingError::InsufficientFunds {
                required: target,
                available: balance,
            }
            .into());
        }
        match builder.build_staking(&utxos, funding_address.script_pubkey(), Some(height)) {
            Err(StakingError::InsufficientFunds { required, .. }) if required > target => {
                target = required;
            }
            result => break result?,
        }
    };

    let signed = sign_key_path_inputs(&unsigned, &keypair)?;
    let tx_hex = serialize_hex(&signed);
    println!("📄 Staking transaction {}", signed.compute_txid());
    println!("   Fee: {}", amount::format_sats(unsigned.fee.to_sat()));
    println!("   PSBT: {}", unsigned.psbt_hex());
    println!("   Hex: {}", tx_hex);

    if !broadcast {
        println!("Run again with --broadcast to publish it");
        return Ok(());
    }

    let txid = backend.broadcast(&tx_hex).await?;
    let store = StakingStore::new(&config.data_file);
    store.append(StakingRecord {
        txid: txid.to_string(),
        staking_tx_hex: tx_hex,
        params: builder.params().clone(),
        scripts: builder.scripts().clone(),
        staking_amount: builder.params().staking_amount,
        fee: unsigned.fee.to_sat(),
        fee_rate: builder.params().fee_rate,
        lock_height: Some(height),
        status: WithdrawalStatus::Staked,
        unbonding_txid: None,
        withdrawal_txid: None,
        created_at: Utc::now(),
    })?;
    println!("✅ Broadcast {}", txid);
    println!("📁 Recorded in {}", store.path().display());
    Ok(())
}

fn unbond(
    config: &AppConfig,
    txid: &str,
    secret: &str,
    fee: Option<u64>,
    out: Option<&Path>,
) -> Result<()> {
    let store = StakingStore::new(&config.data_file);
    let record = require_record(&store, txid)?;
    if record.status != WithdrawalStatus::Staked {
        bail!("Stake {} is already {}", txid, record.status);
    }

    let keypair = staker_keypair(secret, &record.params)?;
    let builder = StakingTransactionBuilder::new(record.params.clone())?;
    let staking_tx = decode_transaction(&record.staking_tx_hex)?;
    let vout = staking_vout(&builder, &staking_tx)?;
    let fee = match fee {
        Some(sats) => Amount::from_sat(sats),
        None => builder.estimate_unbonding_fee()?,
    };

    let (request, unsigned) = create_unbonding_request(&builder, &staking_tx, vout, fee, &keypair)?;
    let json = request.to_json()?;
    match out {
        Some(path) => {
            fs::write(path, &json)
                .with_context(|| format!("Failed to write request to {}", path.display()))?;
            println!("📁 Unbonding request written to {}", path.display());
        }
        None => println!("{}", json),
    }

    store.update_status(
        &record.txid,
        WithdrawalStatus::UnbondingRequested,
        Some(unsigned.txid().to_string()),
    )?;
    println!(
        "Unbonding {} with fee {}",
        txid_utils::format_short(&unsigned.txid().to_string()),
        amount::format_sats(fee.to_sat())
    );
    Ok(())
}

async fn cosign(
    config: &AppConfig,
    request_file: &Path,
    params_file: &Path,
    covenant_secrets: &[String],
    fee: Option<u64>,
    broadcast: bool,
) -> Result<()> {
    let json = fs::read_to_string(request_file)
        .with_context(|| format!("Failed to read request {}", request_file.display()))?;
    let request = UnbondingRequest::from_json(&json)?;
    let builder = StakingTransactionBuilder::new(load_params(params_file)?)?;
    let backend = EsploraClient::new(&config.esplora_url)?;

    let staking_txid = txid_utils::validate(&request.staking_tx_hash_hex)?;
    let staking_tx = backend.get_transaction(&staking_txid).await?;
    let fee = match fee {
        Some(sats) => Amount::from_sat(sats),
        None => builder.estimate_unbonding_fee()?,
    };

    let signers = covenant_secrets
        .iter()
        .map(|secret| -> Result<Arc<dyn CovenantSigner>> {
            let signer = LocalCovenantSigner::from_secret_hex(secret)?;
            if !builder.quorum().is_member(&signer.public_key()) {
                bail!("Key {} is not in the covenant committee", signer.public_key());
            }
            Ok(Arc::new(signer) as Arc<dyn CovenantSigner>)
        })
        .collect::<Result<Vec<_>>>()?;

    let signed = process_unbonding_request(&builder, &request, &staking_tx, fee, &signers).await?;
    let tx_hex = serialize_hex(&signed);
    println!("📄 Co-signed unbonding transaction {}", signed.compute_txid());
    println!("   Hex: {}", tx_hex);

    if broadcast {
        let txid = backend.broadcast(&tx_hex).await?;
        println!("✅ Broadcast {}", txid);
    }
    Ok(())
}

async fn withdraw(
    config: &AppConfig,
    txid: &str,
    from: WithdrawFrom,
    secret: &str,
    destination: Option<&str>,
    broadcast: bool,
) -> Result<()> {
    let store = StakingStore::new(&config.data_file);
    let record = require_record(&store, txid)?;
    if record.status == WithdrawalStatus::Withdrawn {
        bail!("Stake {} is already withdrawn", txid);
    }

    let keypair = staker_keypair(secret, &record.params)?;
    let builder = StakingTransactionBuilder::new(record.params.clone())?;
    let backend = EsploraClient::new(&config.esplora_url)?;
    let source = WithdrawalSource::from(from);

    let (outpoint, prevout) = match source {
        WithdrawalSource::Unbonded => {
            let unbonding_txid = record
                .unbonding_txid
                .as_deref()
                .ok_or_else(|| anyhow!("Stake {} has no unbonding transaction", txid))?;
            let unbonding_tx = backend
                .get_transaction(&txid_utils::validate(unbonding_txid)?)
                .await?;
            let prevout = unbonding_tx
                .output
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("Unbonding transaction has no outputs"))?;
            (
                OutPoint {
                    txid: unbonding_tx.compute_txid(),
                    vout: 0,
                },
                prevout,
            )
        }
        WithdrawalSource::StakingTimelock => {
            let staking_tx = decode_transaction(&record.staking_tx_hex)?;
            let vout = staking_vout(&builder, &staking_tx)?;
            (
                OutPoint {
                    txid: staking_tx.compute_txid(),
                    vout,
                },
                staking_tx.output[vout as usize].clone(),
            )
        }
    };

    let destination: ScriptBuf = match destination {
        Some(addr) => {
            let parsed = address::validate_and_parse(addr, record.params.network)?;
            if !address::is_taproot_address(addr) {
                log::warn!("Withdrawing to non-Taproot address {}", address::format_short(addr));
            }
            parsed.script_pubkey()
        }
        None => staker_address(record.params.staker_key, record.params.network).script_pubkey(),
    };

    let required = source.required_height(builder.params());
    let current = backend.get_block_height().await?;
    ensure_matured(required, current).with_context(|| {
        format!(
            "{} blocks left before withdrawal",
            time::blocks_remaining(current, required)
        )
    })?;

    let unsigned = builder.build_withdrawal(source, outpoint, prevout, destination)?;
    let leaf = unsigned
        .spend_leaf
        .as_ref()
        .ok_or_else(|| anyhow!("Withdrawal does not spend a script leaf"))?;
    let witness = WitnessAssembler::new(builder.quorum()).assemble(
        SpendPath::Timelock,
        &SpendSignatures::staker_only(unsigned.sign_script_path(&keypair)?),
        &leaf.script,
        &leaf.control_block,
    )?;
    let signed = unsigned.finalize(witness);
    verify_script_path_input(&signed, 0, &unsigned.prevouts)?;

    let tx_hex = serialize_hex(&signed);
    println!("📄 Withdrawal transaction {}", signed.compute_txid());
    println!("   Amount: {}", amount::format_dual(signed.output[0].value.to_sat()));
    println!("   Hex: {}", tx_hex);

    if broadcast {
        let withdrawal_txid = backend.broadcast(&tx_hex).await?;
        store.update_status(
            &record.txid,
            WithdrawalStatus::Withdrawn,
            Some(withdrawal_txid.to_string()),
        )?;
        println!("✅ Broadcast {}", withdrawal_txid);
    }
    Ok(())
}

fn list_records(config: &AppConfig) -> Result<()> {
    let store = StakingStore::new(&config.data_file);
    let records = store.load()?;
    if records.is_empty() {
        println!("No staking records in {}", store.path().display());
        return Ok(());
    }

    println!("📋 Staking records ({}):", records.len());
    for (index, record) in records.iter().enumerate() {
        println!(
            "  [{}] {}  {:>22}  {:<20}  {}",
            index,
            txid_utils::format_short(&record.txid),
            amount::format_dual(record.staking_amount),
            record.status.to_string(),
            time::format_timestamp(&record.created_at)
        );
        if let Some(unbonding) = &record.unbonding_txid {
            println!("      unbonding:  {}", unbonding);
        }
        if let Some(withdrawal) = &record.withdrawal_txid {
            println!("      withdrawal: {}", withdrawal);
        }
    }
    Ok(())
}

/// Index of the staking output inside the staking transaction
fn staking_vout(builder: &StakingTransactionBuilder, staking_tx: &Transaction) -> Result<u32> {
    let script_pubkey = builder.staking_output().script_pubkey();
    staking_tx
        .output
        .iter()
        .position(|output| output.script_pubkey == script_pubkey)
        .map(|index| index as u32)
        .ok_or_else(|| anyhow!("Transaction {} has no staking output", staking_tx.compute_txid()))
}
