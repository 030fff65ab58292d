//! # Staking Module
//!
//! Taproot staking with covenant-gated exits.
//!
//! ## Components
//!
//! - **Params**: staking parameters and their invariants
//! - **Scripts**: timelock, unbonding, slashing and data-embed scripts
//! - **Taproot**: script trees, output keys, addresses and control blocks
//! - **Covenant**: concurrent threshold signature collection
//! - **Witness**: witness stacks for each spending path
//! - **Transactions**: staking, unbonding, withdrawal and slashing skeletons
//! - **Interpreter**: local tapscript verification before broadcast
//! - **Unbonding**: staker requests and covenant-side co-signing

pub mod covenant;
pub mod interpreter;
pub mod params;
pub mod scripts;
pub mod taproot;
pub mod transactions;
pub mod unbonding;
pub mod witness;


pub use covenant::{CovenantQuorum, CovenantSignatureSet, CovenantSigner, LocalCovenantSigner};
pub use interpreter::verify_script_path_input;
pub use params::{parse_x_only_key, MagicBytes, StakingParameters};
pub use scripts::{build_scripts, ScriptSet};
pub use taproot::{build_tree, TaprootOutput, TreeRole};
pub use transactions::{
    ensure_matured, sign_key_path_inputs, staker_address, FundingUtxo, SlashingSource,
    StakingTransactionBuilder, UnsignedTransaction, WithdrawalSource,
};
pub use unbonding::{create_unbonding_request, process_unbonding_request, UnbondingRequest};
pub use witness::{SpendPath, SpendSignatures, WitnessAssembler};
