//! MPT witnesses assembled from `eth_getProof` responses.
//!
//! Proof nodes for every touched account and slot are loaded into an
//! in-memory trie database. The state trie is then reopened at the block's
//! state root and the modifications are applied one after the other, each
//! step recording the proofs and roots on both sides of the change.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use alloy::{providers::Provider, transports::Transport};
use anyhow::{anyhow, bail, Context as _};
use eth_trie::{EthTrie, MemoryDB, Trie, DB};
use ethereum_types::{Address, H256, U256};
use futures::{StreamExt as _, TryStreamExt as _};
use keccak_hash::{keccak, KECCAK_EMPTY, KECCAK_NULL_RLP};
use rlp::{Encodable, RlpStream};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{
    config::EngineConfig,
    provider::{self, BoundedProvider},
    runtime, EngineError, HexBytes, ProofType, TrieModification, WitnessEngine,
};

/// Witness for an ordered list of trie modifications on top of one block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MptWitness {
    pub block_num: u64,
    /// State root of `block_num`, before any modification.
    pub state_root: H256,
    pub steps: Vec<WitnessStep>,
}

/// Proofs and roots around a single modification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WitnessStep {
    pub modification: TrieModification,
    pub state_root_before: H256,
    pub state_root_after: H256,
    pub account_proof_before: Vec<HexBytes>,
    pub account_proof_after: Vec<HexBytes>,
    pub storage_proof_before: Vec<HexBytes>,
    pub storage_proof_after: Vec<HexBytes>,
}

/// Generates witnesses against the node named in each request.
#[derive(Clone, Debug, Default)]
pub struct NodeWitnessGenerator {
    config: Option<EngineConfig>,
}

impl NodeWitnessGenerator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Some(config),
        }
    }

    /// A generator using the process-wide [`EngineConfig::global`].
    pub fn from_env() -> Self {
        Self::default()
    }

    fn try_compute_witness(
        &self,
        node_url: &str,
        block_num: u64,
        modifications: &[TrieModification],
    ) -> Result<MptWitness, EngineError> {
        let config = match &self.config {
            Some(config) => config,
            None => EngineConfig::global()?,
        };
        let provider = provider::connect(node_url, config)?;
        Ok(runtime::block_on(
            config,
            generate_witness(&provider, block_num, modifications),
        )??)
    }
}

impl WitnessEngine for NodeWitnessGenerator {
    type Output = MptWitness;

    fn compute_witness(
        &self,
        node_url: &str,
        block_num: u64,
        modifications: &[TrieModification],
    ) -> MptWitness {
        match self.try_compute_witness(node_url, block_num, modifications) {
            Ok(witness) => {
                info!(
                    block = block_num,
                    steps = witness.steps.len(),
                    "generated MPT witness"
                );
                witness
            }
            Err(e) => {
                error!(block = block_num, "MPT witness generation failed: {e:#}");
                MptWitness::default()
            }
        }
    }
}

/// Account as stored in the state trie.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Account {
    nonce: u64,
    balance: U256,
    storage_root: H256,
    code_hash: H256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: KECCAK_NULL_RLP,
            code_hash: KECCAK_EMPTY,
        }
    }
}

impl Encodable for Account {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4)
            .append(&self.nonce)
            .append(&self.balance)
            .append(&self.storage_root)
            .append(&self.code_hash);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockHeader {
    state_root: H256,
}

/// Response of `eth_getProof`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountProof {
    balance: U256,
    nonce: U256,
    code_hash: H256,
    storage_hash: H256,
    account_proof: Vec<HexBytes>,
    #[serde(default)]
    storage_proof: Vec<StorageProof>,
}

#[derive(Debug, Deserialize)]
struct StorageProof {
    proof: Vec<HexBytes>,
}

impl AccountProof {
    fn account(&self) -> Account {
        // Some clients report zero hashes for accounts that do not exist.
        let non_zero_or = |hash: H256, empty: H256| if hash.is_zero() { empty } else { hash };
        Account {
            nonce: self.nonce.low_u64(),
            balance: self.balance,
            storage_root: non_zero_or(self.storage_hash, KECCAK_NULL_RLP),
            code_hash: non_zero_or(self.code_hash, KECCAK_EMPTY),
        }
    }

    fn nodes(&self) -> impl Iterator<Item = &HexBytes> {
        self.account_proof
            .iter()
            .chain(self.storage_proof.iter().flat_map(|it| &it.proof))
    }
}

/// The part of the state trie covered by the loaded proofs.
pub struct PartialState {
    db: Arc<MemoryDB>,
    state: EthTrie<MemoryDB>,
    accounts: HashMap<Address, Account>,
}

fn trie_at(db: &Arc<MemoryDB>, root: H256) -> EthTrie<MemoryDB> {
    let trie = EthTrie::new(db.clone());
    if root == KECCAK_NULL_RLP {
        trie
    } else {
        trie.at_root(root)
    }
}

fn hex_nodes(nodes: Vec<Vec<u8>>) -> Vec<HexBytes> {
    nodes.into_iter().map(HexBytes).collect()
}

impl PartialState {
    pub fn new(state_root: H256) -> Self {
        let db = Arc::new(MemoryDB::new(false));
        Self {
            state: trie_at(&db, state_root),
            db,
            accounts: HashMap::new(),
        }
    }

    /// Makes `nodes` resolvable by their hash.
    pub fn load_nodes<'a>(
        &mut self,
        nodes: impl IntoIterator<Item = &'a [u8]>,
    ) -> anyhow::Result<()> {
        for node in nodes {
            self.db
                .insert(keccak(node).as_bytes(), node.to_vec())
                .map_err(|e| anyhow!("couldn't store proof node: {e:?}"))?;
        }
        Ok(())
    }

    fn load(&mut self, address: Address, proof: &AccountProof) -> anyhow::Result<()> {
        self.load_nodes(proof.nodes().map(|node| node.0.as_slice()))?;
        self.accounts.insert(address, proof.account());
        Ok(())
    }

    fn write_account(&mut self, address: Address, account: Account) -> anyhow::Result<()> {
        self.state
            .insert(keccak(address).as_bytes(), &rlp::encode(&account))?;
        self.accounts.insert(address, account);
        Ok(())
    }

    /// Applies `modification` and records the proofs around it.
    pub fn apply(&mut self, modification: &TrieModification) -> anyhow::Result<WitnessStep> {
        let address = modification.address;
        let account_key = keccak(address);
        let state_root_before = self.state.root_hash()?;
        let account_proof_before = self.state.get_proof(account_key.as_bytes())?;

        let mut account = self.accounts.get(&address).cloned().unwrap_or_default();
        let mut storage_proof_before = Vec::new();
        let mut storage_proof_after = Vec::new();

        match modification.kind {
            ProofType::Disabled | ProofType::AccountDoesNotExist => {}
            ProofType::Other(code) => bail!("unknown proof type {code}"),
            ProofType::NonceChanged => {
                account.nonce = modification.nonce;
                self.write_account(address, account)?;
            }
            ProofType::BalanceChanged => {
                account.balance = modification.balance;
                self.write_account(address, account)?;
            }
            ProofType::CodeHashChanged => {
                let code_hash = modification.code_hash.as_ref();
                if code_hash.len() != 32 {
                    bail!("code hash must be 32 bytes, got {}", code_hash.len());
                }
                account.code_hash = H256::from_slice(code_hash);
                self.write_account(address, account)?;
            }
            ProofType::AccountDestructed => {
                self.state.remove(account_key.as_bytes())?;
                self.accounts.remove(&address);
            }
            ProofType::StorageChanged | ProofType::StorageDoesNotExist => {
                let slot_key = keccak(modification.key);
                let mut storage = trie_at(&self.db, account.storage_root);
                storage_proof_before = storage.get_proof(slot_key.as_bytes())?;
                if modification.kind == ProofType::StorageChanged {
                    let value = U256::from_big_endian(modification.value.as_bytes());
                    if value.is_zero() {
                        storage.remove(slot_key.as_bytes())?;
                    } else {
                        storage.insert(slot_key.as_bytes(), &rlp::encode(&value))?;
                    }
                    account.storage_root = storage.root_hash()?;
                    self.write_account(address, account)?;
                }
                storage_proof_after = storage.get_proof(slot_key.as_bytes())?;
            }
        }

        let state_root_after = self.state.root_hash()?;
        let account_proof_after = self.state.get_proof(account_key.as_bytes())?;
        Ok(WitnessStep {
            modification: modification.clone(),
            state_root_before,
            state_root_after,
            account_proof_before: hex_nodes(account_proof_before),
            account_proof_after: hex_nodes(account_proof_after),
            storage_proof_before: hex_nodes(storage_proof_before),
            storage_proof_after: hex_nodes(storage_proof_after),
        })
    }
}

/// Accounts touched by `modifications`, with the storage slots read or
/// written in each.
fn touched_slots(modifications: &[TrieModification]) -> BTreeMap<Address, BTreeSet<H256>> {
    let mut touched = BTreeMap::<_, BTreeSet<_>>::new();
    for modification in modifications {
        let slots = touched.entry(modification.address).or_default();
        if modification.kind.is_storage() {
            slots.insert(modification.key);
        }
    }
    touched
}

/// Fetches the proofs `modifications` need at `block_num` and applies the
/// modifications in order.
pub async fn generate_witness<ProviderT, TransportT>(
    provider: &BoundedProvider<ProviderT, TransportT>,
    block_num: u64,
    modifications: &[TrieModification],
) -> anyhow::Result<MptWitness>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    let tag = format!("{block_num:#x}");
    let header = provider
        .request::<_, Option<BlockHeader>>("eth_getBlockByNumber", (tag.clone(), false))
        .await?
        .with_context(|| format!("block {block_num} does not exist"))?;

    let touched = touched_slots(modifications);
    debug!(
        block = block_num,
        accounts = touched.len(),
        "fetching account proofs"
    );
    let concurrency = touched.len().max(1);
    let proofs = futures::stream::iter(touched.into_iter().map(|(address, slots)| {
        let params = (address, slots.into_iter().collect::<Vec<_>>(), tag.clone());
        async move {
            let proof = provider
                .request::<_, AccountProof>("eth_getProof", params)
                .await
                .with_context(|| format!("couldn't fetch proof of {address:?}"))?;
            anyhow::Ok((address, proof))
        }
    }))
    .buffered(concurrency)
    .try_collect::<Vec<_>>()
    .await?;

    let mut state = PartialState::new(header.state_root);
    for (address, proof) in &proofs {
        state.load(*address, proof)?;
    }

    let steps = modifications
        .iter()
        .enumerate()
        .map(|(i, modification)| {
            state
                .apply(modification)
                .with_context(|| format!("couldn't apply modification {i}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(MptWitness {
        block_num,
        state_root: header.state_root,
        steps,
    })
}
