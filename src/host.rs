//! Host adapters: the pluggable collaborators the interpreter is bound to.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use sha2::{Digest, Sha256};

/// Provider of the message bytes checked by `CHECKSIG`/`CHECKMULTISIG`.
///
/// Repeated calls within a single script execution must return identical
/// bytes.
pub trait Signable {
    fn message(&self) -> Vec<u8>;
}

impl Signable for Vec<u8> {
    fn message(&self) -> Vec<u8> {
        self.clone()
    }
}

impl Signable for &[u8] {
    fn message(&self) -> Vec<u8> {
        self.to_vec()
    }
}

/// External hash and signature-verification primitives.
pub trait Crypto {
    fn hash160(&self, data: &[u8]) -> [u8; 20];
    fn hash256(&self, data: &[u8]) -> [u8; 32];
    fn verify(&self, message: &[u8], signature: &[u8], pubkey: &[u8]) -> bool;
}

/// Resolves a 20-byte script hash to the callee's byte-code.
pub trait ScriptTable {
    fn get_script(&self, hash: &[u8; 20]) -> Option<Vec<u8>>;
}

/// Map-backed [`ScriptTable`] keyed by `Crypto::hash160` of the script.
#[derive(Default)]
pub struct MemoryScriptTable {
    scripts: BTreeMap<[u8; 20], Vec<u8>>,
}

impl MemoryScriptTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `script` under its hash and returns the hash.
    pub fn insert(&mut self, crypto: &dyn Crypto, script: Vec<u8>) -> [u8; 20] {
        let hash = crypto.hash160(&script);
        self.scripts.insert(hash, script);
        hash
    }
}

impl ScriptTable for MemoryScriptTable {
    fn get_script(&self, hash: &[u8; 20]) -> Option<Vec<u8>> {
        self.scripts.get(hash).cloned()
    }
}

static SECP256K1: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

fn verification_ctx() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1.get_or_init(Secp256k1::verification_only)
}

/// Default [`Crypto`] provider.
///
/// `hash160` is RIPEMD160∘SHA256 and `hash256` is SHA256∘SHA256. Signature
/// verification is secp256k1 ECDSA over the SHA-256 digest of the message,
/// with 64-byte compact `r ‖ s` signatures and SEC1-encoded public keys.
/// Hosts on another curve supply their own provider.
#[derive(Debug, Default, Copy, Clone)]
pub struct StdCrypto;

impl Crypto for StdCrypto {
    fn hash160(&self, data: &[u8]) -> [u8; 20] {
        let sha = Sha256::digest(data);
        Ripemd160::digest(sha).into()
    }

    fn hash256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(Sha256::digest(data)).into()
    }

    fn verify(&self, message: &[u8], signature: &[u8], pubkey: &[u8]) -> bool {
        let digest: [u8; 32] = Sha256::digest(message).into();
        let msg = Message::from_digest(digest);
        let Ok(sig) = Signature::from_compact(signature) else {
            return false;
        };
        let Ok(key) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        verification_ctx().verify_ecdsa(&msg, &sig, &key).is_ok()
    }
}
