//! JSON-RPC query server over the durable index.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use utxod_indexer::query::{InputView, OutputView};
use utxod_indexer::{IndexerError, QueryService, TransactionView, UtxoDetail, UtxoSource};
use utxod_primitives::hex::{hash256_from_hex, hash256_to_hex, hex_encode};
use utxod_primitives::Hash256;
use utxod_storage::KeyValueStore;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
pub const RPC_INVALID_PARAMS: i64 = -32602;
pub const RPC_PARSE_ERROR: i64 = -32700;
pub const RPC_INTERNAL_ERROR: i64 = -32603;
pub const RPC_NOT_FOUND: i64 = -5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RPC_INVALID_PARAMS, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(RPC_NOT_FOUND, message)
    }
}

impl From<IndexerError> for RpcError {
    fn from(err: IndexerError) -> Self {
        Self::new(RPC_INTERNAL_ERROR, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, PartialEq, Eq)]
enum Request {
    BlockCount,
    TrxCount,
    IndexState,
    TrxIdBySeq(u32),
    AddressTrxs(String),
    RawTrx(Hash256),
    Trx(Hash256),
    Utxo(UtxoSource),
    ListUnspent(String),
}

impl Request {
    fn parse(method: &str, params: &[Value]) -> Result<Self, RpcError> {
        let request = match method {
            "getblockcount" => Self::BlockCount,
            "gettrxcount" => Self::TrxCount,
            "getindexstate" => Self::IndexState,
            "gettrxidbyseq" => Self::TrxIdBySeq(param_u32(params, 0, "seq")?),
            "getaddresstrxs" => Self::AddressTrxs(param_str(params, 0, "address")?.to_string()),
            "getrawtrx" => Self::RawTrx(param_txid(params, 0)?),
            "gettrx" => Self::Trx(param_txid(params, 0)?),
            "getutxo" => Self::Utxo(UtxoSource::new(
                param_txid(params, 0)?,
                param_u32(params, 1, "vout")?,
            )),
            "listunspent" => Self::ListUnspent(param_str(params, 0, "address")?.to_string()),
            other => {
                return Err(RpcError::new(
                    RPC_METHOD_NOT_FOUND,
                    format!("method not found: {other}"),
                ))
            }
        };
        Ok(request)
    }
}

fn param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a Value, RpcError> {
    params
        .get(index)
        .ok_or_else(|| RpcError::invalid_params(format!("missing parameter {name}")))
}

fn param_str<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str, RpcError> {
    param(params, index, name)?
        .as_str()
        .ok_or_else(|| RpcError::invalid_params(format!("{name} must be a string")))
}

fn param_u32(params: &[Value], index: usize, name: &str) -> Result<u32, RpcError> {
    param(params, index, name)?
        .as_u64()
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| RpcError::invalid_params(format!("{name} must be a u32")))
}

fn param_txid(params: &[Value], index: usize) -> Result<Hash256, RpcError> {
    let raw = param_str(params, index, "txid")?;
    hash256_from_hex(raw)
        .ok_or_else(|| RpcError::invalid_params("txid must be 64 hex characters"))
}

#[derive(Serialize)]
struct UtxoJson {
    txid: String,
    vout: u32,
    amount: i64,
    height: u32,
    address: String,
    script: String,
}

impl UtxoJson {
    fn new(source: &UtxoSource, detail: &UtxoDetail) -> Self {
        Self {
            txid: hash256_to_hex(&source.txid),
            vout: source.index,
            amount: detail.amount,
            height: detail.height,
            address: detail.address.clone(),
            script: hex_encode(&detail.script),
        }
    }
}

#[derive(Serialize)]
struct InputJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vout: Option<u32>,
    coinbase: bool,
    sequence: u32,
}

impl From<&InputView> for InputJson {
    fn from(input: &InputView) -> Self {
        Self {
            txid: input.prevout.map(|prevout| hash256_to_hex(&prevout.txid)),
            vout: input.prevout.map(|prevout| prevout.index),
            coinbase: input.prevout.is_none(),
            sequence: input.sequence,
        }
    }
}

#[derive(Serialize)]
struct OutputJson {
    n: u32,
    value: i64,
    script: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
}

impl From<&OutputView> for OutputJson {
    fn from(output: &OutputView) -> Self {
        Self {
            n: output.index,
            value: output.value,
            script: hex_encode(&output.script),
            address: output.address.clone(),
        }
    }
}

#[derive(Serialize)]
struct TransactionJson {
    txid: String,
    version: i32,
    locktime: u32,
    size: usize,
    vin: Vec<InputJson>,
    vout: Vec<OutputJson>,
}

impl From<&TransactionView> for TransactionJson {
    fn from(view: &TransactionView) -> Self {
        Self {
            txid: hash256_to_hex(&view.txid),
            version: view.version,
            locktime: view.lock_time,
            size: view.size,
            vin: view.inputs.iter().map(InputJson::from).collect(),
            vout: view.outputs.iter().map(OutputJson::from).collect(),
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|err| RpcError::new(RPC_INTERNAL_ERROR, err.to_string()))
}

fn execute<S: KeyValueStore>(
    query: &QueryService<S>,
    request: Request,
) -> Result<Value, RpcError> {
    match request {
        Request::BlockCount => Ok(json!(query.indexed_height()?)),
        Request::TrxCount => Ok(json!(query.transaction_count()?)),
        Request::IndexState => {
            let cursor = query.index_state()?;
            Ok(json!({
                "height": cursor.height,
                "sequence": cursor.sequence,
                "state": cursor.state.as_str(),
            }))
        }
        Request::TrxIdBySeq(sequence) => match query.txid_by_sequence(sequence)? {
            Some(txid) => Ok(json!(hash256_to_hex(&txid))),
            None => Err(RpcError::not_found(format!("no transaction with seq {sequence}"))),
        },
        Request::AddressTrxs(address) => {
            let txids: Vec<String> = query
                .address_associations(&address)?
                .iter()
                .map(hash256_to_hex)
                .collect();
            Ok(json!(txids))
        }
        Request::RawTrx(txid) => match query.raw_transaction(&txid)? {
            Some(raw) => Ok(json!(hex_encode(&raw))),
            None => Err(RpcError::not_found("transaction not found")),
        },
        Request::Trx(txid) => match query.decoded_transaction(&txid)? {
            Some(view) => to_value(TransactionJson::from(&view)),
            None => Err(RpcError::not_found("transaction not found")),
        },
        Request::Utxo(source) => match query.utxo(&source)? {
            Some(detail) => to_value(UtxoJson::new(&source, &detail)),
            None => Err(RpcError::not_found(format!("utxo {source} not found"))),
        },
        Request::ListUnspent(address) => {
            let unspent: Vec<UtxoJson> = query
                .list_unspent(&address)?
                .iter()
                .map(|(source, detail)| UtxoJson::new(source, detail))
                .collect();
            to_value(unspent)
        }
    }
}

/// Runs one request body to a JSON-RPC response object.
pub fn dispatch<S: KeyValueStore>(query: &QueryService<S>, body: &[u8]) -> Value {
    let request: RpcRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            return response(
                Value::Null,
                Err(RpcError::new(RPC_PARSE_ERROR, format!("parse error: {err}"))),
            )
        }
    };
    let result =
        Request::parse(&request.method, &request.params).and_then(|parsed| execute(query, parsed));
    if let Err(err) = &result {
        if err.code == RPC_INTERNAL_ERROR {
            log_warn!("rpc {} failed: {}", request.method, err.message);
        }
    }
    response(request.id, result)
}

fn response(id: Value, result: Result<Value, RpcError>) -> Value {
    match result {
        Ok(result) => json!({ "result": result, "error": Value::Null, "id": id }),
        Err(err) => json!({
            "result": Value::Null,
            "error": { "code": err.code, "message": err.message },
            "id": id,
        }),
    }
}

pub async fn serve_rpc<S>(
    addr: SocketAddr,
    query: Arc<QueryService<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), String>
where
    S: KeyValueStore + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| format!("rpc bind {addr} failed: {err}"))?;
    log_info!("RPC listening on http://{addr}");

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => {
                accepted.map_err(|err| format!("rpc accept failed: {err}"))?
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        let query = Arc::clone(&query);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, query).await {
                log_debug!("rpc connection error: {err}");
            }
        });
    }
    log_info!("RPC server stopped");
    Ok(())
}

async fn handle_connection<S: KeyValueStore + 'static>(
    mut stream: tokio::net::TcpStream,
    query: Arc<QueryService<S>>,
) -> Result<(), String> {
    let (status, body) = match read_request(&mut stream).await? {
        HttpRequest::Empty => return Ok(()),
        HttpRequest::TooLarge => ("413 Payload Too Large", "request too large".to_string()),
        HttpRequest::Malformed => ("400 Bad Request", "bad request".to_string()),
        HttpRequest::Complete { method, body } if method == "POST" => {
            // Store reads block, so they stay off the runtime workers.
            let reply = tokio::task::spawn_blocking(move || dispatch(&query, &body).to_string())
                .await
                .map_err(|err| format!("rpc dispatch task failed: {err}"))?;
            ("200 OK", reply)
        }
        HttpRequest::Complete { .. } => ("405 Method Not Allowed", "use POST".to_string()),
    };
    let content_type = if status == "200 OK" {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    stream
        .write_all(&build_response(status, content_type, &body))
        .await
        .map_err(|err| err.to_string())?;
    stream.shutdown().await.map_err(|err| err.to_string())?;
    Ok(())
}

enum HttpRequest {
    Empty,
    TooLarge,
    Malformed,
    Complete { method: String, body: Vec<u8> },
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Result<HttpRequest, String> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(end) = find_header_end(&buffer) {
            break end;
        }
        if buffer.len() >= MAX_REQUEST_BYTES {
            return Ok(HttpRequest::TooLarge);
        }
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Ok(if buffer.is_empty() {
                HttpRequest::Empty
            } else {
                HttpRequest::Malformed
            });
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.lines();
    let method = lines
        .next()
        .and_then(|line| line.split_whitespace().next())
        .unwrap_or_default()
        .to_string();
    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                match value.trim().parse() {
                    Ok(length) => content_length = length,
                    Err(_) => return Ok(HttpRequest::Malformed),
                }
            }
        }
    }
    let body_start = header_end + 4;
    if body_start.saturating_add(content_length) > MAX_REQUEST_BYTES {
        return Ok(HttpRequest::TooLarge);
    }
    while buffer.len() < body_start + content_length {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Ok(HttpRequest::Malformed);
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    let body = buffer[body_start..body_start + content_length].to_vec();
    Ok(HttpRequest::Complete { method, body })
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn build_response(status: &str, content_type: &str, body: &str) -> Vec<u8> {
    let mut response = String::new();
    response.push_str("HTTP/1.1 ");
    response.push_str(status);
    response.push_str("\r\nContent-Type: ");
    response.push_str(content_type);
    response.push_str("\r\nConnection: close\r\nContent-Length: ");
    response.push_str(&body.len().to_string());
    response.push_str("\r\n\r\n");
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body.as_bytes());
    bytes
}
