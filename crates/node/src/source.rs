//! Upstream block sources speaking JSON-RPC 1.0 over HTTP.

use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use utxod_indexer::{BlockSource, SourceError};
use utxod_primitives::hex::{hash256_from_hex, hash256_to_hex, hex_decode};
use utxod_primitives::Hash256;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

/// Minimal blocking JSON-RPC client.
#[derive(Clone, Debug)]
pub struct RpcClient {
    url: String,
    authorization: Option<String>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, user: Option<&str>, password: Option<&str>) -> Self {
        let authorization = match (user, password) {
            (None, None) => None,
            (user, password) => {
                let credentials = format!("{}:{}", user.unwrap_or(""), password.unwrap_or(""));
                Some(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(credentials)
                ))
            }
        };
        Self {
            url: url.into(),
            authorization,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn call(&self, method: &str, params: Value) -> Result<Value, SourceError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "utxod",
            "method": method,
            "params": params,
        });
        let mut request = minreq::post(&self.url)
            .with_header("Content-Type", "application/json")
            .with_timeout(self.timeout.as_secs())
            .with_body(body.to_string());
        if let Some(authorization) = &self.authorization {
            request = request.with_header("Authorization", authorization.as_str());
        }
        let response = request
            .send()
            .map_err(|err| SourceError::Unavailable(format!("{method}: {err}")))?;
        let text = response
            .as_str()
            .map_err(|err| SourceError::Malformed(format!("{method}: {err}")))?;
        parse_response(method, response.status_code, text)
    }
}

/// Nodes answer RPC errors with a non-200 status and a JSON body, so the body wins when it parses.
fn parse_response(method: &str, status: i32, body: &str) -> Result<Value, SourceError> {
    let envelope: RpcEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(err) if status == 200 => {
            return Err(SourceError::Malformed(format!("{method}: {err}")));
        }
        Err(_) => {
            return Err(SourceError::Unavailable(format!("{method}: http status {status}")));
        }
    };
    if !envelope.error.is_null() {
        let message = envelope
            .error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| envelope.error.to_string());
        return Err(SourceError::Unavailable(format!("{method}: {message}")));
    }
    if status != 200 {
        return Err(SourceError::Unavailable(format!("{method}: http status {status}")));
    }
    Ok(envelope.result)
}

fn as_height(method: &str, value: &Value) -> Result<u32, SourceError> {
    value
        .as_u64()
        .and_then(|height| u32::try_from(height).ok())
        .ok_or_else(|| SourceError::Malformed(format!("{method}: expected height, got {value}")))
}

fn as_hash(method: &str, value: &Value) -> Result<Hash256, SourceError> {
    value
        .as_str()
        .and_then(hash256_from_hex)
        .ok_or_else(|| SourceError::Malformed(format!("{method}: expected block hash, got {value}")))
}

fn as_bytes(method: &str, value: &Value) -> Result<Vec<u8>, SourceError> {
    value
        .as_str()
        .and_then(hex_decode)
        .ok_or_else(|| SourceError::Malformed(format!("{method}: expected hex block")))
}

/// A full node's wallet RPC.
pub struct WalletSource {
    client: RpcClient,
}

impl WalletSource {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

impl BlockSource for WalletSource {
    fn chain_tip_height(&self) -> Result<u32, SourceError> {
        let method = "getblockcount";
        as_height(method, &self.client.call(method, json!([]))?)
    }

    fn block_hash(&self, height: u32) -> Result<Hash256, SourceError> {
        let method = "getblockhash";
        as_hash(method, &self.client.call(method, json!([height]))?)
    }

    fn raw_block(&self, hash: &Hash256) -> Result<Vec<u8>, SourceError> {
        let method = "getblock";
        as_bytes(
            method,
            &self.client.call(method, json!([hash256_to_hex(hash), 0]))?,
        )
    }
}

/// A raw block service exposing `Service.*` methods.
pub struct RawBlockSource {
    client: RpcClient,
}

impl RawBlockSource {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

impl BlockSource for RawBlockSource {
    fn chain_tip_height(&self) -> Result<u32, SourceError> {
        let method = "Service.GetBlockCount";
        as_height(method, &self.client.call(method, json!([]))?)
    }

    fn block_hash(&self, height: u32) -> Result<Hash256, SourceError> {
        let method = "Service.GetBlockHash";
        as_hash(method, &self.client.call(method, json!([height]))?)
    }

    fn raw_block(&self, hash: &Hash256) -> Result<Vec<u8>, SourceError> {
        let method = "Service.GetRawBlock";
        as_bytes(method, &self.client.call(method, json!([hash256_to_hex(hash)]))?)
    }
}
