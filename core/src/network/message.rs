//! Wire messages and frame codec
//!
//! Every protocol message is one frame:
//!
//! `type(u8) | senderRef | bodyLen(u32) | body`
//!
//! where `senderRef = addrLen(u16) | addrBytes("ip:port") | guid(u32)` and
//! the body is UTF-8 with `::`-separated fields (REMOVED uses a single `:`).
//! Types 0x01-0x06 are the backup protocols; 0x10-0x17 carry ring
//! maintenance.

use crate::chord::id::{ChordId, PeerRef, CHORD_MAX_PEERS};

/// NACK reason: receiver cannot fit the file.
pub const REASON_NO_SPACE: &str = "NOSPACE";

/// NACK reason: receiver already stores the file.
pub const REASON_HAVE_FILE: &str = "HAVEFILE";

const TYPE_BACKUP: u8 = 0x01;
const TYPE_GET: u8 = 0x02;
const TYPE_DELETE: u8 = 0x03;
const TYPE_REMOVED: u8 = 0x04;
const TYPE_ACK: u8 = 0x05;
const TYPE_NACK: u8 = 0x06;
const TYPE_LOOKUP: u8 = 0x10;
const TYPE_SUCCESSOR: u8 = 0x11;
const TYPE_GET_PREDECESSOR: u8 = 0x12;
const TYPE_PREDECESSOR: u8 = 0x13;
const TYPE_GET_SUCCESSORS: u8 = 0x14;
const TYPE_SUCCESSORS: u8 = 0x15;
const TYPE_NOTIFY: u8 = 0x16;
const TYPE_PING: u8 = 0x17;

/// Frame decoding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ends before a full frame.
    Truncated,
    /// A declared length field is inconsistent with the input.
    BadLength,
    /// Message type byte is not assigned.
    UnknownType(u8),
    /// Body is not valid UTF-8 or does not match the grammar for its type.
    BadBody(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "frame truncated"),
            CodecError::BadLength => write!(f, "inconsistent frame length"),
            CodecError::UnknownType(t) => write!(f, "unknown message type {:#04x}", t),
            CodecError::BadBody(e) => write!(f, "malformed body: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

/// Payload of one protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Offer to store a file under a routing key.
    Backup {
        file_id: String,
        size: u64,
        owner: PeerRef,
        key: ChordId,
        replication_degree: u32,
    },
    /// Request a stored file; sent twice, the second starts the stream.
    Get { file_id: String },
    /// Drop a stored file. Fire-and-forget.
    Delete { file_id: String },
    /// Storer evicted a file; tells the owner which key is gone.
    Removed { file_id: String, key: ChordId },
    /// Positive acknowledgement, optionally with a short status.
    Ack { status: Option<String> },
    /// Negative acknowledgement with a reason.
    Nack { reason: Option<String> },
    /// Ask the receiver to resolve the successor of a key.
    Lookup { key: ChordId },
    /// Answer to a Lookup.
    Successor { peer: PeerRef },
    /// Ask for the receiver's predecessor.
    GetPredecessor,
    /// Answer to GetPredecessor; empty body when unknown.
    Predecessor { peer: Option<PeerRef> },
    /// Ask for the receiver's successor list.
    GetSuccessors,
    /// Answer to GetSuccessors.
    Successors { peers: Vec<PeerRef> },
    /// The sender believes it may be the receiver's predecessor.
    Notify,
    /// Liveness probe; answered with Ack.
    Ping,
}

impl MessageKind {
    fn type_byte(&self) -> u8 {
        match self {
            MessageKind::Backup { .. } => TYPE_BACKUP,
            MessageKind::Get { .. } => TYPE_GET,
            MessageKind::Delete { .. } => TYPE_DELETE,
            MessageKind::Removed { .. } => TYPE_REMOVED,
            MessageKind::Ack { .. } => TYPE_ACK,
            MessageKind::Nack { .. } => TYPE_NACK,
            MessageKind::Lookup { .. } => TYPE_LOOKUP,
            MessageKind::Successor { .. } => TYPE_SUCCESSOR,
            MessageKind::GetPredecessor => TYPE_GET_PREDECESSOR,
            MessageKind::Predecessor { .. } => TYPE_PREDECESSOR,
            MessageKind::GetSuccessors => TYPE_GET_SUCCESSORS,
            MessageKind::Successors { .. } => TYPE_SUCCESSORS,
            MessageKind::Notify => TYPE_NOTIFY,
            MessageKind::Ping => TYPE_PING,
        }
    }

    fn body(&self) -> String {
        match self {
            MessageKind::Backup {
                file_id,
                size,
                owner,
                key,
                replication_degree,
            } => format!(
                "{}::{}::{}::{}::{}",
                file_id,
                size,
                owner.to_wire(),
                key,
                replication_degree
            ),
            MessageKind::Get { file_id } | MessageKind::Delete { file_id } => file_id.clone(),
            MessageKind::Removed { file_id, key } => format!("{}:{}", file_id, key),
            MessageKind::Ack { status } => status.clone().unwrap_or_default(),
            MessageKind::Nack { reason } => reason.clone().unwrap_or_default(),
            MessageKind::Lookup { key } => key.to_string(),
            MessageKind::Successor { peer } => peer.to_wire(),
            MessageKind::Predecessor { peer } => {
                peer.map(|p| p.to_wire()).unwrap_or_default()
            }
            MessageKind::Successors { peers } => peers
                .iter()
                .map(|p| p.to_wire())
                .collect::<Vec<_>>()
                .join("::"),
            MessageKind::GetPredecessor
            | MessageKind::GetSuccessors
            | MessageKind::Notify
            | MessageKind::Ping => String::new(),
        }
    }
}

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Who sent the frame.
    pub sender: PeerRef,
    pub kind: MessageKind,
}

impl Message {
    pub fn new(sender: PeerRef, kind: MessageKind) -> Self {
        Self { sender, kind }
    }

    /// Encode into a frame.
    pub fn encode(&self) -> Vec<u8> {
        let addr = self.sender.addr.to_string();
        let body = self.kind.body();
        let mut out = Vec::with_capacity(1 + 2 + addr.len() + 4 + 4 + body.len());
        out.push(self.kind.type_byte());
        out.extend_from_slice(&(addr.len() as u16).to_be_bytes());
        out.extend_from_slice(addr.as_bytes());
        out.extend_from_slice(&self.sender.guid.to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body.as_bytes());
        out
    }

    /// Decode one frame; the input must be exactly one frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 3 {
            return Err(CodecError::Truncated);
        }
        let msg_type = bytes[0];
        let addr_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        let guid_at = 3 + addr_len;
        let body_len_at = guid_at + 4;
        if bytes.len() < body_len_at + 4 {
            return Err(CodecError::Truncated);
        }
        let addr_text = std::str::from_utf8(&bytes[3..guid_at])
            .map_err(|e| CodecError::BadBody(e.to_string()))?;
        let addr = addr_text
            .parse()
            .map_err(|_| CodecError::BadBody(format!("bad sender address {:?}", addr_text)))?;
        let guid = u32::from_be_bytes([
            bytes[guid_at],
            bytes[guid_at + 1],
            bytes[guid_at + 2],
            bytes[guid_at + 3],
        ]);
        if guid >= CHORD_MAX_PEERS {
            return Err(CodecError::BadBody(format!("guid {} out of range", guid)));
        }
        let body_len = u32::from_be_bytes([
            bytes[body_len_at],
            bytes[body_len_at + 1],
            bytes[body_len_at + 2],
            bytes[body_len_at + 3],
        ]) as usize;
        let body_at = body_len_at + 4;
        if bytes.len() != body_at + body_len {
            return Err(CodecError::BadLength);
        }
        let body = std::str::from_utf8(&bytes[body_at..])
            .map_err(|e| CodecError::BadBody(e.to_string()))?;

        let sender = PeerRef::with_guid(addr, guid);
        let kind = decode_kind(msg_type, body)?;
        Ok(Message { sender, kind })
    }
}

fn parse_chord_id(text: &str) -> Result<ChordId, CodecError> {
    let id: ChordId = text
        .parse()
        .map_err(|_| CodecError::BadBody(format!("bad identifier {:?}", text)))?;
    if id >= CHORD_MAX_PEERS {
        return Err(CodecError::BadBody(format!("identifier {} out of range", id)));
    }
    Ok(id)
}

fn parse_peer_ref(text: &str) -> Result<PeerRef, CodecError> {
    PeerRef::from_wire(text)
        .ok_or_else(|| CodecError::BadBody(format!("bad peer reference {:?}", text)))
}

fn decode_kind(msg_type: u8, body: &str) -> Result<MessageKind, CodecError> {
    match msg_type {
        TYPE_BACKUP => {
            let fields: Vec<&str> = body.split("::").collect();
            if fields.len() != 5 {
                return Err(CodecError::BadBody(format!(
                    "backup expects 5 fields, got {}",
                    fields.len()
                )));
            }
            Ok(MessageKind::Backup {
                file_id: fields[0].to_string(),
                size: fields[1]
                    .parse()
                    .map_err(|_| CodecError::BadBody(format!("bad size {:?}", fields[1])))?,
                owner: parse_peer_ref(fields[2])?,
                key: parse_chord_id(fields[3])?,
                replication_degree: fields[4].parse().map_err(|_| {
                    CodecError::BadBody(format!("bad replication degree {:?}", fields[4]))
                })?,
            })
        }
        TYPE_GET => Ok(MessageKind::Get {
            file_id: body.to_string(),
        }),
        TYPE_DELETE => Ok(MessageKind::Delete {
            file_id: body.to_string(),
        }),
        TYPE_REMOVED => {
            let (file_id, key) = body.rsplit_once(':').ok_or_else(|| {
                CodecError::BadBody("removed expects fileId:key".to_string())
            })?;
            Ok(MessageKind::Removed {
                file_id: file_id.to_string(),
                key: parse_chord_id(key)?,
            })
        }
        TYPE_ACK => Ok(MessageKind::Ack {
            status: (!body.is_empty()).then(|| body.to_string()),
        }),
        TYPE_NACK => Ok(MessageKind::Nack {
            reason: (!body.is_empty()).then(|| body.to_string()),
        }),
        TYPE_LOOKUP => Ok(MessageKind::Lookup {
            key: parse_chord_id(body)?,
        }),
        TYPE_SUCCESSOR => Ok(MessageKind::Successor {
            peer: parse_peer_ref(body)?,
        }),
        TYPE_GET_PREDECESSOR => Ok(MessageKind::GetPredecessor),
        TYPE_PREDECESSOR => Ok(MessageKind::Predecessor {
            peer: if body.is_empty() {
                None
            } else {
                Some(parse_peer_ref(body)?)
            },
        }),
        TYPE_GET_SUCCESSORS => Ok(MessageKind::GetSuccessors),
        TYPE_SUCCESSORS => {
            if body.is_empty() {
                return Ok(MessageKind::Successors { peers: Vec::new() });
            }
            let peers = body
                .split("::")
                .map(parse_peer_ref)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(MessageKind::Successors { peers })
        }
        TYPE_NOTIFY => Ok(MessageKind::Notify),
        TYPE_PING => Ok(MessageKind::Ping),
        other => Err(CodecError::UnknownType(other)),
    }
}
