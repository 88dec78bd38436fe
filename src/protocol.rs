//! Wire Protocol for the 2PC Cluster
//!
//! Two envelope shapes travel on single-shot connections (one request,
//! optional one reply, then close):
//!
//! - Message envelopes: pure JSON `{"msg_type", "transaction_id", "data"}`,
//!   used for every coordinator -> participant push and for synchronous
//!   replies (STATE_RESPONSE, HISTORY_RESPONSE).
//! - Control envelopes: pipe-delimited ASCII headers used for
//!   participant -> coordinator pushes (REGISTER, VOTE_RESPONSE,
//!   ACK_RESPONSE, HISTORY_REQUEST). The JSON tail may itself contain `|`,
//!   so the parser splits on the first k separators only.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Transaction id used by non-transactional control messages.
pub const HISTORY_SENTINEL: &str = "HISTORY";

/// Register acknowledgement literal.
pub const REGISTER_OK: &str = "OK";

/// Message kind tokens as they appear in the `msg_type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "PREPARE")]
    Prepare,
    #[serde(rename = "VOTE_YES")]
    VoteYes,
    #[serde(rename = "VOTE_NO")]
    VoteNo,
    #[serde(rename = "COMMIT")]
    Commit,
    #[serde(rename = "ABORT")]
    Abort,
    #[serde(rename = "ACK_COMMIT")]
    AckCommit,
    #[serde(rename = "ACK_ABORT")]
    AckAbort,
    #[serde(rename = "QUERY_STATE")]
    QueryState,
    #[serde(rename = "STATE_RESPONSE")]
    StateResponse,
    #[serde(rename = "REQUEST_HISTORY")]
    RequestHistory,
    #[serde(rename = "HISTORY_RESPONSE")]
    HistoryResponse,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Prepare => "PREPARE",
            MessageKind::VoteYes => "VOTE_YES",
            MessageKind::VoteNo => "VOTE_NO",
            MessageKind::Commit => "COMMIT",
            MessageKind::Abort => "ABORT",
            MessageKind::AckCommit => "ACK_COMMIT",
            MessageKind::AckAbort => "ACK_ABORT",
            MessageKind::QueryState => "QUERY_STATE",
            MessageKind::StateResponse => "STATE_RESPONSE",
            MessageKind::RequestHistory => "REQUEST_HISTORY",
            MessageKind::HistoryResponse => "HISTORY_RESPONSE",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON message envelope exchanged between coordinator and participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "msg_type")]
    pub kind: MessageKind,
    pub transaction_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Message {
    pub fn new(kind: MessageKind, transaction_id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind,
            transaction_id: transaction_id.into(),
            data,
        }
    }

    /// Message carrying no payload (votes, acks, state queries).
    pub fn bare(kind: MessageKind, transaction_id: impl Into<String>) -> Self {
        Self::new(kind, transaction_id, Map::new())
    }

    /// STATE_RESPONSE payload is `{status, data}`.
    pub fn state_response(
        transaction_id: impl Into<String>,
        status: &str,
        data: Map<String, Value>,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("status".to_string(), Value::String(status.to_string()));
        payload.insert("data".to_string(), Value::Object(data));
        Self::new(MessageKind::StateResponse, transaction_id, payload)
    }

    /// HISTORY_RESPONSE payload is `{history: [record...]}`.
    pub fn history_response(history: &[HistoryRecord]) -> Result<Self, String> {
        let records = serde_json::to_value(history)
            .map_err(|e| format!("History serialization error: {}", e))?;
        let mut payload = Map::new();
        payload.insert("history".to_string(), records);
        Ok(Self::new(MessageKind::HistoryResponse, HISTORY_SENTINEL, payload))
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("Serialization error: {}", e))
    }

    pub fn from_json(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|e| format!("Deserialization error: {}", e))
    }
}

/// Terminal outcome of a transaction as recorded in coordinator history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Committed => "COMMITTED",
            Decision::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finalised decision in the coordinator's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub transaction_id: String,
    pub status: Decision,
    pub data: Map<String, Value>,
    /// Seconds since the Unix epoch at the moment the decision became terminal.
    pub timestamp: i64,
}

/// Pipe-delimited control envelope for participant-initiated pushes.
///
/// `REGISTER|<id>|<host>|<port>` splits on the first three separators; the
/// other headers split on the first two and keep the JSON tail verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Register {
        participant_id: String,
        host: String,
        port: u16,
    },
    VoteResponse {
        participant_id: String,
        message: Message,
    },
    AckResponse {
        participant_id: String,
        message: Message,
    },
    HistoryRequest {
        participant_id: String,
        message: Message,
    },
}

impl ControlFrame {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let header = raw.split('|').next().unwrap_or("");
        match header {
            "REGISTER" => {
                let mut parts = raw.splitn(4, '|');
                parts.next(); // header
                let participant_id = parts.next().ok_or("REGISTER missing participant id")?;
                let host = parts.next().ok_or("REGISTER missing host")?;
                let port = parts.next().ok_or("REGISTER missing port")?;
                let port: u16 = port
                    .trim()
                    .parse()
                    .map_err(|e| format!("REGISTER bad port {:?}: {}", port, e))?;
                Ok(ControlFrame::Register {
                    participant_id: participant_id.to_string(),
                    host: host.to_string(),
                    port,
                })
            }
            "VOTE_RESPONSE" | "ACK_RESPONSE" | "HISTORY_REQUEST" => {
                let mut parts = raw.splitn(3, '|');
                parts.next(); // header
                let participant_id = parts
                    .next()
                    .ok_or_else(|| format!("{} missing participant id", header))?
                    .to_string();
                let tail = parts
                    .next()
                    .ok_or_else(|| format!("{} missing message body", header))?;
                let message = Message::from_json(tail)?;
                Ok(match header {
                    "VOTE_RESPONSE" => ControlFrame::VoteResponse {
                        participant_id,
                        message,
                    },
                    "ACK_RESPONSE" => ControlFrame::AckResponse {
                        participant_id,
                        message,
                    },
                    _ => ControlFrame::HistoryRequest {
                        participant_id,
                        message,
                    },
                })
            }
            other => Err(format!("Unknown control header {:?}", other)),
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        match self {
            ControlFrame::Register {
                participant_id,
                host,
                port,
            } => Ok(format!("REGISTER|{}|{}|{}", participant_id, host, port)),
            ControlFrame::VoteResponse {
                participant_id,
                message,
            } => Ok(format!("VOTE_RESPONSE|{}|{}", participant_id, message.to_json()?)),
            ControlFrame::AckResponse {
                participant_id,
                message,
            } => Ok(format!("ACK_RESPONSE|{}|{}", participant_id, message.to_json()?)),
            ControlFrame::HistoryRequest {
                participant_id,
                message,
            } => Ok(format!(
                "HISTORY_REQUEST|{}|{}",
                participant_id,
                message.to_json()?
            )),
        }
    }
}

/// Mint a fresh 8-character transaction id from the thread-local CSPRNG.
pub fn mint_transaction_id() -> String {
    let mut rng = rand::thread_rng();
    (0..8).map(|_| rng.sample(Alphanumeric) as char).collect()
}

/// Build a string-valued payload map from key/value pairs.
pub fn payload_from_pairs<I, K, V>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), Value::String(v.into())))
        .collect()
}
