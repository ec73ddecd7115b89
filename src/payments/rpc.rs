// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// JSON-RPC payment backend for a Solana-style node. Transfers are plain
// system-program transfers, built and signed locally, submitted over HTTP.
// No internal retries: the settlement worker decides what happens after a
// Transient or Permanent error.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{PaymentBackend, PaymentError, TransferStatus, Wallet};

const RPC_TIMEOUT: Duration = Duration::from_secs(10);
// System program id is the all-zero key.
const SYSTEM_PROGRAM_ID: [u8; 32] = [0u8; 32];
// System program instruction index for Transfer.
const TRANSFER_INSTRUCTION: u32 = 2;

pub struct RpcPaymentBackend {
    http: reqwest::Client,
    rpc_url: String,
    wallet: Arc<Wallet>,
}

impl RpcPaymentBackend {
    pub fn new(rpc_url: impl Into<String>, wallet: Arc<Wallet>) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
            wallet,
        }
    }

    pub fn payer_address(&self) -> String {
        self.wallet.address()
    }

    /// Devnet/testnet faucet helper for funding test wallets. Not part of
    /// the `PaymentBackend` contract.
    pub async fn request_airdrop(&self, lamports: u64) -> Result<String, PaymentError> {
        if !self.rpc_url.contains("devnet") && !self.rpc_url.contains("testnet") {
            return Err(PaymentError::Permanent(
                "airdrop only available on devnet/testnet".to_string(),
            ));
        }
        let result = self
            .call("requestAirdrop", json!([self.wallet.address(), lamports]))
            .await?;
        let signature = result
            .as_str()
            .ok_or_else(|| PaymentError::Transient("airdrop returned no signature".to_string()))?
            .to_string();
        info!("airdrop of {} lamports requested: {}", lamports, signature);
        Ok(signature)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, PaymentError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.rpc_url)
            .timeout(RPC_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| PaymentError::Transient(format!("rpc request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PaymentError::Transient(format!(
                "rpc returned http {status}"
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| PaymentError::Transient(format!("rpc response not json: {e}")))?;
        if let Some(error) = payload.get("error") {
            return Err(classify_rpc_error(error));
        }
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| PaymentError::Transient("rpc response missing result".to_string()))
    }

    async fn latest_blockhash(&self) -> Result<[u8; 32], PaymentError> {
        let result = self.call("getLatestBlockhash", json!([])).await?;
        let blockhash = result
            .pointer("/value/blockhash")
            .and_then(Value::as_str)
            .ok_or_else(|| PaymentError::Transient("no blockhash in response".to_string()))?;
        decode_key(blockhash).map_err(PaymentError::Transient)
    }
}

#[async_trait]
impl PaymentBackend for RpcPaymentBackend {
    async fn send_transfer(
        &self,
        to_wallet: &str,
        amount_lamports: u64,
        memo: &str,
    ) -> Result<String, PaymentError> {
        let recipient = decode_key(to_wallet).map_err(PaymentError::Permanent)?;
        let blockhash = self.latest_blockhash().await?;

        // TODO: attach the memo via the on-chain memo program instead of
        // only recording it in logs.
        debug!(
            "sending {} lamports to {} (memo: {})",
            amount_lamports, to_wallet, memo
        );

        let tx = build_transfer_transaction(
            &self.wallet,
            recipient,
            amount_lamports,
            blockhash,
        );
        let encoded = BASE64.encode(tx);
        let result = self
            .call(
                "sendTransaction",
                json!([encoded, { "encoding": "base64" }]),
            )
            .await?;
        let signature = result
            .as_str()
            .ok_or_else(|| {
                PaymentError::Transient("sendTransaction returned no signature".to_string())
            })?
            .to_string();
        info!(
            "transfer of {} lamports to {} submitted: {}",
            amount_lamports, to_wallet, signature
        );
        Ok(signature)
    }

    async fn confirm_signature(&self, signature: &str) -> Result<TransferStatus, PaymentError> {
        let result = self
            .call(
                "getSignatureStatuses",
                json!([[signature], { "searchTransactionHistory": true }]),
            )
            .await?;
        let entry = result.pointer("/value/0").unwrap_or(&Value::Null);
        if entry.is_null() {
            return Ok(TransferStatus::Pending);
        }
        if entry.get("err").map_or(false, |e| !e.is_null()) {
            return Ok(TransferStatus::Failed);
        }
        match entry.get("confirmationStatus").and_then(Value::as_str) {
            Some("confirmed") | Some("finalized") => Ok(TransferStatus::Confirmed),
            _ => Ok(TransferStatus::Pending),
        }
    }

    async fn get_balance(&self, wallet: &str) -> Result<u64, PaymentError> {
        let result = self.call("getBalance", json!([wallet])).await?;
        result
            .pointer("/value")
            .and_then(Value::as_u64)
            .ok_or_else(|| PaymentError::Transient("no balance in response".to_string()))
    }
}

fn classify_rpc_error(error: &Value) -> PaymentError {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown rpc error")
        .to_string();
    // Malformed requests and funding problems will not fix themselves.
    let permanent = matches!(code, -32602 | -32601 | -32600)
        || message.to_lowercase().contains("insufficient");
    if permanent {
        PaymentError::Permanent(format!("rpc error {code}: {message}"))
    } else {
        PaymentError::Transient(format!("rpc error {code}: {message}"))
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32], String> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| format!("invalid base58 key {encoded}: {e}"))?;
    bytes
        .try_into()
        .map_err(|_| format!("key {encoded} is not 32 bytes"))
}

/// Serialize a single-signer legacy transaction carrying one system
/// transfer instruction: payer -> recipient for `lamports`.
fn build_transfer_transaction(
    wallet: &Wallet,
    recipient: [u8; 32],
    lamports: u64,
    blockhash: [u8; 32],
) -> Vec<u8> {
    let payer = wallet.public_key_bytes();

    let mut message = Vec::with_capacity(1 + 2 + 1 + 32 * 3 + 32 + 16);
    // Header: one required signature, no read-only signed accounts, one
    // read-only unsigned account (the system program).
    message.push(1);
    message.push(0);
    message.push(1);
    // Account keys.
    push_compact_u16(&mut message, 3);
    message.extend_from_slice(&payer);
    message.extend_from_slice(&recipient);
    message.extend_from_slice(&SYSTEM_PROGRAM_ID);
    message.extend_from_slice(&blockhash);
    // Instructions.
    push_compact_u16(&mut message, 1);
    message.push(2); // program id index (system program)
    push_compact_u16(&mut message, 2);
    message.push(0); // from: payer
    message.push(1); // to: recipient
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&TRANSFER_INSTRUCTION.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());
    push_compact_u16(&mut message, data.len() as u16);
    message.extend_from_slice(&data);

    let signature = wallet.sign(&message);
    let mut tx = Vec::with_capacity(1 + 64 + message.len());
    push_compact_u16(&mut tx, 1);
    tx.extend_from_slice(&signature);
    tx.extend_from_slice(&message);
    tx
}

/// Short-vec length prefix: 7 bits per byte, high bit marks continuation.
fn push_compact_u16(out: &mut Vec<u8>, mut value: u16) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}
