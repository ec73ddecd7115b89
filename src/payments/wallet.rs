// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Serialize, Deserialize)]
struct WalletFile {
    public_key: String,
    secret_key: Vec<u8>,
}

/// Ed25519 signing wallet backed by a JSON keypair file. The file holds the
/// 32-byte seed (a 64-byte keypair dump from other tooling is accepted and
/// truncated to its seed half).
pub struct Wallet {
    signing: SigningKey,
}

impl Wallet {
    /// Load the wallet at `path`, or generate and persist a fresh keypair
    /// on first run.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let wallet = Self::generate();
            wallet.save(path)?;
            info!("new wallet created: {}", wallet.address());
            warn!("back up your wallet file: {}", path.display());
            Ok(wallet)
        }
    }

    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading wallet file {}", path.display()))?;
        let file: WalletFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing wallet file {}", path.display()))?;
        let seed: [u8; 32] = file
            .secret_key
            .get(..32)
            .ok_or_else(|| anyhow!("wallet secret key shorter than 32 bytes"))?
            .try_into()
            .expect("slice of length 32");
        let wallet = Self {
            signing: SigningKey::from_bytes(&seed),
        };
        info!("wallet loaded: {}", wallet.address());
        Ok(wallet)
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = WalletFile {
            public_key: self.address(),
            secret_key: self.signing.to_bytes().to_vec(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("writing wallet file {}", path.display()))?;
        Ok(())
    }

    /// Base58 public key, the form used as a wallet address everywhere.
    pub fn address(&self) -> String {
        bs58::encode(self.signing.verifying_key().to_bytes()).into_string()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}
