use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::modules::action::{ActionKind, signing_payload};
use crate::modules::qi::{self, LedgerError, Qi};
use crate::modules::store::{self, StateDir, StoreError};
use crate::modules::world::AgentId;

pub const DEFAULT_DIFFICULTY_BITS: u32 = 16;
pub const DEFAULT_MINING_REWARD: Qi = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("wallet {0} not found")]
    NotFound(String),
    #[error("no wallets found; create one first")]
    Empty,
    #[error("wallet {0} holds a malformed key")]
    BadKey(String),
    #[error("cannot transfer from wallet {0} to itself")]
    SelfTransfer(String),
    #[error("wallet {address}: {source}")]
    Ledger {
        address: String,
        source: LedgerError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub address: String,
    /// Hex encoded ed25519 verifying key.
    pub public_key: String,
    /// Hex encoded ed25519 secret key.
    pub secret_key: String,
    pub balance: Qi,
    #[serde(default)]
    pub next_nonce: u64,
}

impl Wallet {
    pub fn generate() -> Self {
        Self::from_signing_key(&SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(key: &SigningKey) -> Self {
        let verifying = key.verifying_key();
        Self {
            address: address_for(&verifying),
            public_key: hex::encode(verifying.to_bytes()),
            secret_key: hex::encode(key.to_bytes()),
            balance: 0,
            next_nonce: 0,
        }
    }

    fn signing_key(&self) -> Result<SigningKey, WalletError> {
        let bytes: [u8; 32] = hex::decode(&self.secret_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| WalletError::BadKey(self.address.clone()))?;
        let key = SigningKey::from_bytes(&bytes);
        if hex::encode(key.verifying_key().to_bytes()) != self.public_key {
            return Err(WalletError::BadKey(self.address.clone()));
        }
        Ok(key)
    }
}

/// Address is the hex of the first 20 bytes of sha256(public key).
pub fn address_for(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    hex::encode(&digest[..20])
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct WalletStore {
    pub wallets: BTreeMap<String, Wallet>,
}

impl WalletStore {
    pub fn load(dir: &StateDir) -> Result<Self, StoreError> {
        Ok(store::read_json(&dir.wallets())?.unwrap_or_default())
    }

    pub fn save(&self, dir: &StateDir) -> Result<(), StoreError> {
        store::write_json_atomic(&dir.wallets(), self)
    }

    pub fn create(&mut self) -> &Wallet {
        let wallet = Wallet::generate();
        let address = wallet.address.clone();
        self.wallets.entry(address).or_insert(wallet)
    }

    pub fn get(&self, address: &str) -> Result<&Wallet, WalletError> {
        self.wallets
            .get(address)
            .ok_or_else(|| WalletError::NotFound(address.to_string()))
    }

    fn get_mut(&mut self, address: &str) -> Result<&mut Wallet, WalletError> {
        self.wallets
            .get_mut(address)
            .ok_or_else(|| WalletError::NotFound(address.to_string()))
    }

    pub fn first(&self) -> Result<&Wallet, WalletError> {
        self.wallets.values().next().ok_or(WalletError::Empty)
    }

    /// Explicit address, or the first wallet when none was given.
    pub fn resolve(&self, address: Option<&str>) -> Result<&Wallet, WalletError> {
        match address {
            Some(addr) => self.get(addr),
            None => self.first(),
        }
    }

    pub fn credit(&mut self, address: &str, amount: Qi) -> Result<Qi, WalletError> {
        let wallet = self.get_mut(address)?;
        qi::credit(&mut wallet.balance, amount).map_err(|source| WalletError::Ledger {
            address: address.to_string(),
            source,
        })?;
        Ok(wallet.balance)
    }

    pub fn debit(&mut self, address: &str, amount: Qi) -> Result<Qi, WalletError> {
        let wallet = self.get_mut(address)?;
        qi::debit(&mut wallet.balance, amount).map_err(|source| WalletError::Ledger {
            address: address.to_string(),
            source,
        })?;
        Ok(wallet.balance)
    }

    pub fn transfer(&mut self, from: &str, to: &str, amount: Qi) -> Result<(), WalletError> {
        if from == to {
            return Err(WalletError::SelfTransfer(from.to_string()));
        }
        self.get(to)?;
        self.debit(from, amount)?;
        if let Err(err) = self.credit(to, amount) {
            self.credit(from, amount)?;
            return Err(err);
        }
        Ok(())
    }

    pub fn keyring(&self) -> Result<Keyring, WalletError> {
        let mut keys = BTreeMap::new();
        for wallet in self.wallets.values() {
            keys.insert(wallet.address.clone(), wallet.signing_key()?);
        }
        Ok(Keyring { keys })
    }
}

/// Secret keys the engine signs with on behalf of each agent's owner.
#[derive(Debug, Default, Clone)]
pub struct Keyring {
    keys: BTreeMap<String, SigningKey>,
}

impl Keyring {
    pub fn insert(&mut self, key: SigningKey) -> String {
        let address = address_for(&key.verifying_key());
        self.keys.insert(address.clone(), key);
        address
    }

    pub fn public_key_hex(&self, address: &str) -> Option<String> {
        self.keys
            .get(address)
            .map(|k| hex::encode(k.verifying_key().to_bytes()))
    }

    pub fn sign(
        &self,
        address: &str,
        agent_id: AgentId,
        nonce: u64,
        kind: &ActionKind,
    ) -> Result<String, WalletError> {
        let key = self
            .keys
            .get(address)
            .ok_or_else(|| WalletError::NotFound(address.to_string()))?;
        let signature = key.sign(&signing_payload(agent_id, nonce, kind));
        Ok(hex::encode(signature.to_bytes()))
    }
}

/// Check a hex signature against a hex public key. Malformed input is a failed check.
pub fn verify_signature(public_key_hex: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Some(key) = hex::decode(public_key_hex)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .and_then(|b| VerifyingKey::from_bytes(&b).ok())
    else {
        return false;
    };
    let Some(signature) = hex::decode(signature_hex)
        .ok()
        .and_then(|b| <[u8; 64]>::try_from(b).ok())
        .map(|b| Signature::from_bytes(&b))
    else {
        return false;
    };
    key.verify(payload, &signature).is_ok()
}

pub fn pow_hash(address: &str, start_nonce: u64, attempt: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    hasher.update(start_nonce.to_le_bytes());
    hasher.update(attempt.to_le_bytes());
    hasher.finalize().into()
}

pub fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MineOutcome {
    Found {
        start_nonce: u64,
        attempt: u64,
        hash: String,
        reward: Qi,
        balance: Qi,
    },
    Exhausted {
        start_nonce: u64,
        attempts: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MineParams {
    pub iterations: u64,
    pub difficulty_bits: u32,
    pub reward: Qi,
}

/// Bounded proof-of-work search. Credits the reward at most once and
/// remembers where the next call for this wallet should start.
pub fn mine(
    wallets: &mut WalletStore,
    address: &str,
    start_nonce: Option<u64>,
    params: MineParams,
) -> Result<MineOutcome, WalletError> {
    let start = match start_nonce {
        Some(nonce) => nonce,
        None => wallets.get(address)?.next_nonce,
    };
    wallets.get_mut(address)?.next_nonce = start.wrapping_add(1);

    for attempt in 0..params.iterations {
        let hash = pow_hash(address, start, attempt);
        if leading_zero_bits(&hash) >= params.difficulty_bits {
            let balance = wallets.credit(address, params.reward)?;
            info!(address, start, attempt, reward = params.reward, "mined qi");
            return Ok(MineOutcome::Found {
                start_nonce: start,
                attempt,
                hash: hex::encode(hash),
                reward: params.reward,
                balance,
            });
        }
    }
    debug!(address, start, attempts = params.iterations, "mining exhausted");
    Ok(MineOutcome::Exhausted {
        start_nonce: start,
        attempts: params.iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(iterations: u64, difficulty_bits: u32) -> MineParams {
        MineParams {
            iterations,
            difficulty_bits,
            reward: DEFAULT_MINING_REWARD,
        }
    }

    #[test]
    fn five_iterations_credit_at_most_one_reward() {
        let mut store = WalletStore::default();
        let address = store.create().address.clone();
        let outcome = mine(&mut store, &address, None, params(5, DEFAULT_DIFFICULTY_BITS)).unwrap();
        let balance = store.get(&address).unwrap().balance;
        match outcome {
            MineOutcome::Found { reward, .. } => assert_eq!(balance, reward),
            MineOutcome::Exhausted { attempts, .. } => {
                assert_eq!(attempts, 5);
                assert_eq!(balance, 0);
            }
        }
    }

    #[test]
    fn zero_difficulty_stops_on_first_attempt() {
        let mut store = WalletStore::default();
        let address = store.create().address.clone();
        let outcome = mine(&mut store, &address, Some(7), params(10, 0)).unwrap();
        assert!(matches!(outcome, MineOutcome::Found { attempt: 0, start_nonce: 7, .. }));
        assert_eq!(store.get(&address).unwrap().balance, DEFAULT_MINING_REWARD);
        assert_eq!(store.get(&address).unwrap().next_nonce, 8);
    }

    #[test]
    fn impossible_difficulty_exhausts() {
        let mut store = WalletStore::default();
        let address = store.create().address.clone();
        let outcome = mine(&mut store, &address, None, params(3, 257)).unwrap();
        assert_eq!(
            outcome,
            MineOutcome::Exhausted {
                start_nonce: 0,
                attempts: 3
            }
        );
    }

    #[test]
    fn transfer_is_all_or_nothing() {
        let mut store = WalletStore::default();
        let a = store.create().address.clone();
        let b = store.create().address.clone();
        store.credit(&a, 4).unwrap();
        assert!(matches!(store.transfer(&a, &b, 5), Err(WalletError::Ledger { .. })));
        store.transfer(&a, &b, 3).unwrap();
        assert_eq!(store.get(&a).unwrap().balance, 1);
        assert_eq!(store.get(&b).unwrap().balance, 3);
        assert!(store.transfer(&a, "missing", 1).is_err());
        assert_eq!(store.get(&a).unwrap().balance, 1);
    }

    #[test]
    fn signatures_verify_only_for_the_signed_payload() {
        let mut store = WalletStore::default();
        let wallet = store.create().clone();
        let keyring = store.keyring().unwrap();
        let sig = keyring.sign(&wallet.address, 1, 1, &ActionKind::Scan).unwrap();

        let payload = signing_payload(1, 1, &ActionKind::Scan);
        assert!(verify_signature(&wallet.public_key, &payload, &sig));
        let replay = signing_payload(1, 2, &ActionKind::Scan);
        assert!(!verify_signature(&wallet.public_key, &replay, &sig));
        assert!(!verify_signature(&wallet.public_key, &payload, "beef"));
    }

    #[test]
    fn leading_zero_bits_counts_across_bytes() {
        assert_eq!(leading_zero_bits(&[0, 0x10, 0xff]), 11);
        assert_eq!(leading_zero_bits(&[0x80]), 0);
        assert_eq!(leading_zero_bits(&[0, 0]), 16);
    }
}
