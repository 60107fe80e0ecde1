//! STRATUM pool client: line-delimited JSON-RPC over TCP.
//!
//! The pool is the producer of [`MiningParams`] and the consumer of
//! `(nonce, solution)` submissions; this module speaks exactly that
//! conversation. The handshake sends `mining.subscribe` and
//! `mining.authorize`, then waits for both responses plus the first
//! `mining.set_target` and `mining.notify` before any mining starts. After
//! the handshake a reader task forwards parsed server messages over a
//! channel that the mining driver drains between solves.
//!
//! Byte-order rule: every hex field on this protocol is little-endian wire
//! data, except `mining.set_target`'s target, which arrives in display
//! (big-endian) order and is byte-reversed on parse.

use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::block::MiningParams;
use crate::codec::{hex_le_to_u32, U256};
use crate::equihash::Solution;

pub mod proxy;

pub const USER_AGENT: &str = "zforge/0.4";

const SUBSCRIBE_ID: u64 = 1;
const AUTHORIZE_ID: u64 = 2;
const FIRST_SUBMIT_ID: u64 = 3;

// ─── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum StratumError {
    /// Socket-level failure; reconnect and redo the handshake.
    Transport(std::io::Error),
    /// The server closed the connection.
    ConnectionClosed,
    /// Malformed JSON, missing field, unrecognized method, or a response
    /// id we never issued; treated like a transport failure.
    Protocol(String),
    /// `mining.subscribe` was refused.
    SubscribeFailed { code: i64, message: String },
    /// `mining.authorize` was refused; fatal, surfaced to the operator.
    AuthorizationFailed { code: i64, message: String },
}

impl fmt::Display for StratumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StratumError::Transport(e) => write!(f, "transport error: {}", e),
            StratumError::ConnectionClosed => write!(f, "connection closed by pool"),
            StratumError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            StratumError::SubscribeFailed { code, message } => {
                write!(f, "mining.subscribe failed: ({}) {}", code, message)
            }
            StratumError::AuthorizationFailed { code, message } => {
                write!(f, "mining.authorize failed: ({}) {}", code, message)
            }
        }
    }
}

impl std::error::Error for StratumError {}

impl From<std::io::Error> for StratumError {
    fn from(e: std::io::Error) -> Self {
        StratumError::Transport(e)
    }
}

impl StratumError {
    /// Fatal errors end the process; everything else is worth a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StratumError::AuthorizationFailed { .. })
    }
}

// ─── Server messages ────────────────────────────────────────────────

/// The `error` member of a response: `[code, message, traceback?]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
}

/// A `mining.notify` notification, fields already byte-order-normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotify {
    pub job_id: String,
    pub version: u32,
    pub prev_hash: U256,
    pub merkle_root: U256,
    pub final_sapling_root: U256,
    pub time: u32,
    pub bits: u32,
    pub clean_jobs: bool,
}

/// One parsed server line.
#[derive(Debug)]
pub enum ServerMessage {
    Response {
        id: u64,
        result: Value,
        error: Option<RpcFailure>,
    },
    SetTarget {
        target: U256,
    },
    Notify(JobNotify),
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// Parse one `\n`-delimited server line into a [`ServerMessage`].
pub fn parse_line(line: &str) -> Result<ServerMessage, StratumError> {
    let raw: RawMessage = serde_json::from_str(line)
        .map_err(|e| StratumError::Protocol(format!("malformed json: {}", e)))?;

    if let Some(id) = raw.id {
        let error = parse_failure(&raw.error)?;
        return Ok(ServerMessage::Response {
            id,
            result: raw.result,
            error,
        });
    }

    let method = raw
        .method
        .ok_or_else(|| StratumError::Protocol("message carries neither id nor method".into()))?;
    let params = raw
        .params
        .as_array()
        .ok_or_else(|| StratumError::Protocol(format!("{}: params is not an array", method)))?;

    match method.as_str() {
        "mining.set_target" => {
            // the one big-endian field on the protocol
            let target = U256::from_hex_be(str_param(params, 0, &method)?)
                .map_err(|e| StratumError::Protocol(format!("bad target hex: {}", e)))?;
            Ok(ServerMessage::SetTarget { target })
        }
        "mining.notify" => parse_notify(params).map(ServerMessage::Notify),
        other => Err(StratumError::Protocol(format!(
            "unrecognized method {:?}",
            other
        ))),
    }
}

fn parse_failure(error: &Value) -> Result<Option<RpcFailure>, StratumError> {
    match error {
        Value::Null => Ok(None),
        Value::Array(items) => {
            let code = items
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| StratumError::Protocol("error without numeric code".into()))?;
            let message = items
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Some(RpcFailure { code, message }))
        }
        other => Err(StratumError::Protocol(format!(
            "unexpected error member: {}",
            other
        ))),
    }
}

fn str_param<'a>(params: &'a [Value], index: usize, method: &str) -> Result<&'a str, StratumError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            StratumError::Protocol(format!("{}: param {} is not a string", method, index))
        })
}

fn bool_param(params: &[Value], index: usize, method: &str) -> Result<bool, StratumError> {
    params
        .get(index)
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            StratumError::Protocol(format!("{}: param {} is not a boolean", method, index))
        })
}

fn u256_le_param(params: &[Value], index: usize, method: &str) -> Result<U256, StratumError> {
    U256::from_hex_le(str_param(params, index, method)?)
        .map_err(|e| StratumError::Protocol(format!("{}: param {}: {}", method, index, e)))
}

fn u32_le_param(params: &[Value], index: usize, method: &str) -> Result<u32, StratumError> {
    hex_le_to_u32(str_param(params, index, method)?)
        .map_err(|e| StratumError::Protocol(format!("{}: param {}: {}", method, index, e)))
}

fn parse_notify(params: &[Value]) -> Result<JobNotify, StratumError> {
    // [job_id, version, prevhash, merkleroot, reserved, time, bits,
    //  clean_jobs, trailing?]
    const METHOD: &str = "mining.notify";
    Ok(JobNotify {
        job_id: str_param(params, 0, METHOD)?.to_string(),
        version: u32_le_param(params, 1, METHOD)?,
        prev_hash: u256_le_param(params, 2, METHOD)?,
        merkle_root: u256_le_param(params, 3, METHOD)?,
        final_sapling_root: u256_le_param(params, 4, METHOD)?,
        time: u32_le_param(params, 5, METHOD)?,
        bits: u32_le_param(params, 6, METHOD)?,
        clean_jobs: bool_param(params, 7, METHOD)?,
    })
}

// ─── Client requests ────────────────────────────────────────────────

fn subscribe_request(host: &str, port: u16) -> Value {
    json!({
        "id": SUBSCRIBE_ID,
        "method": "mining.subscribe",
        "params": [USER_AGENT, null, host, port.to_string()],
    })
}

fn authorize_request(user: &str, password: &str) -> Value {
    json!({
        "id": AUTHORIZE_ID,
        "method": "mining.authorize",
        "params": [user, password],
    })
}

fn submit_request(
    id: u64,
    user: &str,
    params: &MiningParams,
    nonce: &U256,
    solution: &Solution,
) -> Value {
    // the solution field carries its compact-size prefix, hex "64"
    json!({
        "id": id,
        "method": "mining.submit",
        "params": [
            user,
            params.job_id.as_str(),
            hex::encode(params.time.to_le_bytes()),
            hex::encode(&nonce.0[params.nonce1_bytes..]),
            format!("64{}", solution.to_hex()),
        ],
    })
}

// ─── Session ────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub sent_submits: u64,
    pub accepted_shares: u64,
    pub rejected_shares: u64,
    pub jobs_received: u64,
    pub targets_received: u64,
}

/// A live pool session. Created by [`StratumClient::connect`] once the
/// handshake has produced a complete set of mining parameters.
pub struct StratumClient {
    writer: OwnedWriteHalf,
    events: mpsc::UnboundedReceiver<Result<ServerMessage, StratumError>>,
    params: MiningParams,
    user: String,
    next_id: u64,
    pending_submits: HashSet<u64>,
    stats: SessionStats,
}

impl StratumClient {
    /// Connect, subscribe, authorize, and wait for the first target and
    /// job. Any protocol or transport failure here aborts the session.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<StratumClient, StratumError> {
        let stream = TcpStream::connect((host, port)).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        send_line(&mut writer, &subscribe_request(host, port)).await?;
        send_line(&mut writer, &authorize_request(user, password)).await?;

        let mut nonce1: Option<(U256, usize)> = None;
        let mut authorized = false;
        let mut target: Option<U256> = None;
        let mut notify: Option<JobNotify> = None;

        let mut line = String::new();
        while nonce1.is_none() || !authorized || target.is_none() || notify.is_none() {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(StratumError::ConnectionClosed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_line(trimmed)? {
                ServerMessage::Response {
                    id: SUBSCRIBE_ID,
                    result,
                    error,
                } => {
                    nonce1 = Some(parse_subscribe_result(&result, error)?);
                }
                ServerMessage::Response {
                    id: AUTHORIZE_ID,
                    result,
                    error,
                } => {
                    if result != Value::Bool(true) {
                        let failure = error.unwrap_or(RpcFailure {
                            code: 0,
                            message: "authorization rejected".into(),
                        });
                        return Err(StratumError::AuthorizationFailed {
                            code: failure.code,
                            message: failure.message,
                        });
                    }
                    authorized = true;
                }
                ServerMessage::Response { id, .. } => {
                    return Err(StratumError::Protocol(format!(
                        "unexpected response id {} during handshake",
                        id
                    )));
                }
                ServerMessage::SetTarget { target: t } => target = Some(t),
                ServerMessage::Notify(job) => notify = Some(job),
            }
        }

        let (nonce1, nonce1_bytes) = nonce1.unwrap();
        let job = notify.unwrap();
        tracing::info!(
            job_id = %job.job_id,
            nonce1_bytes,
            "handshake complete"
        );

        let params = merge_job(job, nonce1, nonce1_bytes, target.unwrap());

        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(reader, tx));

        Ok(StratumClient {
            writer,
            events,
            params,
            user: user.to_string(),
            next_id: FIRST_SUBMIT_ID,
            pending_submits: HashSet::new(),
            stats: SessionStats::default(),
        })
    }

    /// Parameters of the current job. Header fields are stable until
    /// [`poll_updates`](Self::poll_updates) reports a new job.
    pub fn params(&self) -> &MiningParams {
        &self.params
    }

    /// The live share target; `mining.set_target` can move it mid-job.
    pub fn target(&self) -> U256 {
        self.params.target
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Submit one `(nonce, solution)` share for the current job.
    pub async fn submit(
        &mut self,
        nonce: &U256,
        solution: &Solution,
    ) -> Result<(), StratumError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = submit_request(id, &self.user, &self.params, nonce, solution);
        send_line(&mut self.writer, &request).await?;
        self.pending_submits.insert(id);
        self.stats.sent_submits += 1;
        tracing::info!(id, job_id = %self.params.job_id, "share submitted");
        Ok(())
    }

    /// Drain queued server messages. Returns true when a new job arrived
    /// and the solve loop should restart from fresh parameters.
    pub fn poll_updates(&mut self) -> Result<bool, StratumError> {
        let mut new_job = false;
        loop {
            match self.events.try_recv() {
                Ok(Ok(message)) => new_job |= self.apply(message)?,
                Ok(Err(e)) => return Err(e),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(StratumError::ConnectionClosed)
                }
            }
        }
        Ok(new_job)
    }

    fn apply(&mut self, message: ServerMessage) -> Result<bool, StratumError> {
        match message {
            ServerMessage::SetTarget { target } => {
                self.stats.targets_received += 1;
                tracing::info!(target = %target, "share target updated");
                self.params.target = target;
                Ok(false)
            }
            ServerMessage::Notify(job) => {
                self.stats.jobs_received += 1;
                tracing::info!(
                    job_id = %job.job_id,
                    clean_jobs = job.clean_jobs,
                    sent = self.stats.sent_submits,
                    accepted = self.stats.accepted_shares,
                    rejected = self.stats.rejected_shares,
                    "new job from pool"
                );
                let target = self.params.target;
                let nonce1 = self.params.nonce1;
                let nonce1_bytes = self.params.nonce1_bytes;
                self.params = merge_job(job, nonce1, nonce1_bytes, target);
                Ok(true)
            }
            ServerMessage::Response { id, result, error } => {
                if !self.pending_submits.remove(&id) {
                    return Err(StratumError::Protocol(format!(
                        "response for unknown id {}",
                        id
                    )));
                }
                if error.is_none() && result == Value::Bool(true) {
                    self.stats.accepted_shares += 1;
                    tracing::info!(id, total = self.stats.accepted_shares, "share accepted");
                } else {
                    // a rejected share is logged and never resubmitted
                    self.stats.rejected_shares += 1;
                    tracing::warn!(id, ?error, "share rejected");
                }
                Ok(false)
            }
        }
    }
}

fn merge_job(job: JobNotify, nonce1: U256, nonce1_bytes: usize, target: U256) -> MiningParams {
    MiningParams {
        job_id: job.job_id,
        version: job.version,
        prev_hash: job.prev_hash,
        merkle_root: job.merkle_root,
        final_sapling_root: job.final_sapling_root,
        time: job.time,
        bits: job.bits,
        nonce1,
        nonce1_bytes,
        target,
    }
}

fn parse_subscribe_result(
    result: &Value,
    error: Option<RpcFailure>,
) -> Result<(U256, usize), StratumError> {
    let items = match result.as_array() {
        Some(items) => items,
        None => {
            let failure = error.unwrap_or(RpcFailure {
                code: 0,
                message: "subscribe rejected".into(),
            });
            return Err(StratumError::SubscribeFailed {
                code: failure.code,
                message: failure.message,
            });
        }
    };

    // [session_id|null, nonce1_hex, ...]
    let nonce1_hex = items
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| StratumError::Protocol("subscribe result without nonce1".into()))?;
    let nonce1_bytes = nonce1_hex.len() / 2;
    if nonce1_bytes > 32 {
        return Err(StratumError::Protocol(format!(
            "nonce1 of {} bytes cannot fit a 32-byte nonce",
            nonce1_bytes
        )));
    }
    let nonce1 = U256::from_hex_le(nonce1_hex)
        .map_err(|e| StratumError::Protocol(format!("bad nonce1 hex: {}", e)))?;
    Ok((nonce1, nonce1_bytes))
}

async fn send_line(writer: &mut OwnedWriteHalf, message: &Value) -> Result<(), StratumError> {
    let mut line = message.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn read_loop(
    mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    tx: mpsc::UnboundedSender<Result<ServerMessage, StratumError>>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                let _ = tx.send(Err(StratumError::ConnectionClosed));
                return;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let message = parse_line(trimmed);
                let fatal = message.is_err();
                if tx.send(message).is_err() || fatal {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(StratumError::Transport(e)));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::compact_to_u256;

    #[test]
    fn test_parse_subscribe_response() {
        let message =
            parse_line(r#"{"id":1,"result":[null,"81b601c2",null],"error":null}"#).unwrap();
        let (result, error) = match message {
            ServerMessage::Response { id: 1, result, error } => (result, error),
            other => panic!("unexpected message: {:?}", other),
        };
        assert!(error.is_none());

        let (nonce1, nonce1_bytes) = parse_subscribe_result(&result, error).unwrap();
        assert_eq!(nonce1_bytes, 4);
        assert_eq!(&nonce1.0[..4], &[0x81, 0xB6, 0x01, 0xC2]);
        assert_eq!(nonce1.0[4..], [0u8; 28]);
    }

    #[test]
    fn test_parse_set_target_is_byte_reversed() {
        let line = r#"{"id":null,"method":"mining.set_target","params":["0000ffff00000000000000000000000000000000000000000000000000000000"]}"#;
        let target = match parse_line(line).unwrap() {
            ServerMessage::SetTarget { target } => target,
            other => panic!("unexpected message: {:?}", other),
        };

        // big-endian 0x0000ffff… reversed into little-endian bytes: the
        // top nonzero byte is 0xff
        assert_eq!(target.0[29], 0xFF);
        assert_eq!(target.0[28], 0xFF);
        assert_eq!(target.0[30], 0x00);
        assert_eq!(target.0[31], 0x00);
        for byte in &target.0[..28] {
            assert_eq!(*byte, 0x00);
        }

        // sanity: this is a much looser target than the 818128 block bits
        assert!(target > compact_to_u256(0x1E009CB8));
    }

    #[test]
    fn test_parse_notify() {
        let prev = U256::from_hex_be(
            "0000007b753e415f80614ba8130aa4668ca4731b0539d9919c2074b43a46b9e8",
        )
        .unwrap();
        let merkle = U256::from_hex_be(
            "6b2198b49e2055535c403830a3c124a8c235004b4662901010bc0927c43979ec",
        )
        .unwrap();
        let sapling = U256::from_hex_be(
            "189df3ceb26643f3b90ec7059316c7ccb26aeaf1e96559c63b8c6d52f04e79b5",
        )
        .unwrap();

        let line = format!(
            r#"{{"id":null,"method":"mining.notify","params":["ab01","04000000","{}","{}","{}","0a074861","b89c001e",true,false]}}"#,
            prev.to_hex_le(),
            merkle.to_hex_le(),
            sapling.to_hex_le(),
        );

        let job = match parse_line(&line).unwrap() {
            ServerMessage::Notify(job) => job,
            other => panic!("unexpected message: {:?}", other),
        };
        assert_eq!(job.job_id, "ab01");
        assert_eq!(job.version, 4);
        assert_eq!(job.prev_hash, prev);
        assert_eq!(job.merkle_root, merkle);
        assert_eq!(job.final_sapling_root, sapling);
        assert_eq!(job.time, 1632007626);
        assert_eq!(job.bits, 0x1E009CB8);
        assert!(job.clean_jobs);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_line("not json"),
            Err(StratumError::Protocol(_))
        ));
        assert!(matches!(
            parse_line(r#"{"result":true}"#),
            Err(StratumError::Protocol(_))
        ));
        assert!(matches!(
            parse_line(r#"{"id":null,"method":"mining.unknown","params":[]}"#),
            Err(StratumError::Protocol(_))
        ));
        assert!(matches!(
            parse_line(r#"{"id":null,"method":"mining.notify","params":["job"]}"#),
            Err(StratumError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_response_error_member() {
        let message = parse_line(
            r#"{"id":7,"result":null,"error":[21,"Job not found","tb"]}"#,
        )
        .unwrap();
        match message {
            ServerMessage::Response { id, error, .. } => {
                assert_eq!(id, 7);
                assert_eq!(
                    error,
                    Some(RpcFailure {
                        code: 21,
                        message: "Job not found".into()
                    })
                );
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_submit_request_layout() {
        use crate::equihash::PACKED_SOLUTION_BYTES;

        let params = MiningParams {
            job_id: "ab01".into(),
            version: 4,
            prev_hash: U256::ZERO,
            merkle_root: U256::ZERO,
            final_sapling_root: U256::ZERO,
            time: 0x6148070A,
            bits: 0x1E009CB8,
            nonce1: U256::from_hex_le("81b601c2").unwrap(),
            nonce1_bytes: 4,
            target: U256::ZERO,
        };
        let mut nonce = params.nonce1;
        nonce.0[31] = 0xAA;
        let solution = Solution([0x11u8; PACKED_SOLUTION_BYTES]);

        let request = submit_request(9, "worker", &params, &nonce, &solution);
        assert_eq!(request["id"], 9);
        assert_eq!(request["method"], "mining.submit");
        let fields = request["params"].as_array().unwrap();
        assert_eq!(fields[0], "worker");
        assert_eq!(fields[1], "ab01");
        // time, little-endian hex
        assert_eq!(fields[2], "0a074861");
        // miner-owned nonce bytes only
        let tail = fields[3].as_str().unwrap();
        assert_eq!(tail.len(), 2 * 28);
        assert!(tail.starts_with("00"));
        assert!(tail.ends_with("aa"));
        // compact-size prefix then the packed solution
        let sol = fields[4].as_str().unwrap();
        assert_eq!(sol.len(), 2 + 2 * PACKED_SOLUTION_BYTES);
        assert!(sol.starts_with("6411"));
    }

    #[test]
    fn test_subscribe_result_rejects_oversized_nonce1() {
        let result: Value =
            serde_json::from_str(&format!(r#"[null,"{}"]"#, "00".repeat(33))).unwrap();
        assert!(matches!(
            parse_subscribe_result(&result, None),
            Err(StratumError::Protocol(_))
        ));

        let result: Value = serde_json::from_str(r#"[null,"81b601c2"]"#).unwrap();
        assert!(parse_subscribe_result(&result, None).is_ok());
    }
}
