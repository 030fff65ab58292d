//! # Taproot Script Trees
//!
//! Assembles staking scripts into BIP-341 script trees behind the NUMS
//! internal key, so the outputs can only be spent through a script path.
//!
//! ```text
//! staking output:          unbonding output:
//!
//!        root                     root
//!       /    \                   /    \
//!  slashing  branch         slashing  unbonding
//!            /    \                   timelock
//!     unbonding  timelock
//! ```
//!
//! Leaf and branch hashes, the tweak and the control blocks are computed
//! here directly from the tree shape; `TaprootBuilder` is only used in tests
//! as a cross-check.

use crate::config::staking::UNSPENDABLE_KEY_PATH_KEY;
use crate::error::{StakingError, StakingResult};
use crate::staking::scripts::ScriptSet;
use bitcoin::{
    key::{TapTweak, TweakedPublicKey},
    secp256k1::{Parity, Secp256k1, XOnlyPublicKey},
    taproot::{ControlBlock, LeafVersion, TapLeafHash, TapNodeHash, TaprootMerkleBranch},
    Address, Network, Script, ScriptBuf,
};
use std::collections::{BTreeMap, HashSet};

/// Binary script tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapTree {
    Leaf(ScriptBuf),
    Branch(Box<TapTree>, Box<TapTree>),
}

impl TapTree {
    pub fn leaf(script: ScriptBuf) -> Self {
        TapTree::Leaf(script)
    }

    pub fn branch(left: TapTree, right: TapTree) -> Self {
        TapTree::Branch(Box::new(left), Box::new(right))
    }

    /// Number of leaves in the tree
    pub fn leaf_count(&self) -> usize {
        match self {
            TapTree::Leaf(_) => 1,
            TapTree::Branch(left, right) => left.leaf_count() + right.leaf_count(),
        }
    }
}

/// Which output a tree is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeRole {
    /// `[slashing, [unbonding, timelock]]`
    Staking,
    /// `[slashing, unbonding_timelock]`
    Unbonding,
}

impl TreeRole {
    /// Tree shape for this role
    pub fn tree(&self, scripts: &ScriptSet) -> TapTree {
        match self {
            TreeRole::Staking => TapTree::branch(
                TapTree::leaf(scripts.slashing.clone()),
                TapTree::branch(
                    TapTree::leaf(scripts.unbonding.clone()),
                    TapTree::leaf(scripts.timelock.clone()),
                ),
            ),
            TreeRole::Unbonding => TapTree::branch(
                TapTree::leaf(scripts.slashing.clone()),
                TapTree::leaf(scripts.unbonding_timelock.clone()),
            ),
        }
    }
}

/// A script leaf with its hash and Merkle path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapLeafInfo {
    pub script: ScriptBuf,
    pub leaf_hash: TapLeafHash,
    /// Sibling hashes ordered from the leaf up to the root
    pub merkle_path: Vec<TapNodeHash>,
}

/// Fully derived Taproot output for one script tree
#[derive(Debug, Clone)]
pub struct TaprootOutput {
    pub internal_key: XOnlyPublicKey,
    pub tree: TapTree,
    pub leaves: Vec<TapLeafInfo>,
    pub merkle_root: TapNodeHash,
    pub output_key: TweakedPublicKey,
    pub output_key_parity: Parity,
    pub address: Address,
}

impl TaprootOutput {
    /// P2TR scriptPubKey for the output key
    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2tr_tweaked(self.output_key)
    }

    pub fn leaf(&self, script: &Script) -> StakingResult<&TapLeafInfo> {
        self.leaves
            .iter()
            .find(|leaf| leaf.script.as_script() == script)
            .ok_or_else(|| StakingError::tree("Script is not a leaf of this tree"))
    }

    pub fn leaf_hash(&self, script: &Script) -> StakingResult<TapLeafHash> {
        Ok(self.leaf(script)?.leaf_hash)
    }

    /// BIP-341 control block for a leaf: `(0xc0 | parity) ‖ internal key ‖ path`
    pub fn control_block(&self, script: &Script) -> StakingResult<ControlBlock> {
        let leaf = self.leaf(script)?;
        let merkle_branch = TaprootMerkleBranch::try_from(leaf.merkle_path.clone())
            .map_err(|e| StakingError::tree(format!("Invalid Merkle path: {:?}", e)))?;

        Ok(ControlBlock {
            leaf_version: LeafVersion::TapScript,
            output_key_parity: self.output_key_parity,
            internal_key: self.internal_key,
            merkle_branch,
        })
    }

    /// Check a control block commits to `script` under this output key
    pub fn verify_control_block(&self, control_block: &ControlBlock, script: &Script) -> bool {
        let secp = Secp256k1::verification_only();
        control_block.verify_taproot_commitment(&secp, self.output_key.to_x_only_public_key(), script)
    }

    /// PSBT `tap_scripts` entry for a single leaf
    pub fn tap_script_entry(
        &self,
        script: &Script,
    ) -> StakingResult<BTreeMap<ControlBlock, (ScriptBuf, LeafVersion)>> {
        let control_block = self.control_block(script)?;
        let mut map = BTreeMap::new();
        map.insert(control_block, (script.to_owned(), LeafVersion::TapScript));
        Ok(map)
    }
}

/// BIP-341 NUMS point; nobody can spend through the key path
pub fn unspendable_key() -> StakingResult<XOnlyPublicKey> {
    XOnlyPublicKey::from_slice(&UNSPENDABLE_KEY_PATH_KEY)
        .map_err(|e| StakingError::tree(format!("Invalid NUMS key: {}", e)))
}

/// Build the staking or unbonding output from a script set
pub fn build_tree(
    scripts: &ScriptSet,
    role: TreeRole,
    network: Network,
) -> StakingResult<TaprootOutput> {
    let output = build_taproot_output(role.tree(scripts), unspendable_key()?, network)?;
    log::debug!("Derived {:?} output address {}", role, output.address);
    Ok(output)
}

/// Build a Taproot output over an arbitrary tree shape
pub fn build_taproot_output(
    tree: TapTree,
    internal_key: XOnlyPublicKey,
    network: Network,
) -> StakingResult<TaprootOutput> {
    if tree.leaf_count() < 2 {
        return Err(StakingError::tree(format!(
            "A script tree needs at least two leaves, got {}",
            tree.leaf_count()
        )));
    }

    let (merkle_root, leaves) = hash_tree(&tree);

    let mut seen = HashSet::new();
    if !leaves.iter().all(|leaf| seen.insert(leaf.leaf_hash)) {
        return Err(StakingError::tree("Duplicate leaf script in tree"));
    }

    let secp = Secp256k1::verification_only();
    let (output_key, output_key_parity) = internal_key.tap_tweak(&secp, Some(merkle_root));
    let address = Address::p2tr_tweaked(output_key, network);

    let output = TaprootOutput {
        internal_key,
        tree,
        leaves,
        merkle_root,
        output_key,
        output_key_parity,
        address,
    };

    for leaf in &output.leaves {
        let control_block = output.control_block(&leaf.script)?;
        if !output.verify_control_block(&control_block, &leaf.script) {
            return Err(StakingError::tree(format!(
                "Control block does not commit to leaf {}",
                leaf.leaf_hash
            )));
        }
    }

    Ok(output)
}

/// Node hash of a subtree plus every leaf beneath it with its partial path
fn hash_tree(tree: &TapTree) -> (TapNodeHash, Vec<TapLeafInfo>) {
    match tree {
        TapTree::Leaf(script) => {
            let leaf_hash = TapLeafHash::from_script(script, LeafVersion::TapScript);
            let leaf = TapLeafInfo {
                script: script.clone(),
                leaf_hash,
                merkle_path: Vec::new(),
            };
            (TapNodeHash::from(leaf_hash), vec![leaf])
        }
        TapTree::Branch(left, right) => {
            let (left_hash, mut left_leaves) = hash_tree(left);
            let (right_hash, mut right_leaves) = hash_tree(right);

            for leaf in &mut left_leaves {
                leaf.merkle_path.push(right_hash);
            }
            for leaf in &mut right_leaves {
                leaf.merkle_path.push(left_hash);
            }

            left_leaves.append(&mut right_leaves);
            (
                TapNodeHash::from_node_hashes(left_hash, right_hash),
                left_leaves,
            )
        }
    }
}
