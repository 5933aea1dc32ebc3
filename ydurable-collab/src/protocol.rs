//! Binary wire protocol for document sync and presence.
//!
//! Wire format (lib0 variable-length encoding):
//! ```text
//! ┌──────────────┬───────────────────────────────────────────────┐
//! │ kind varuint │ payload                                       │
//! ├──────────────┼───────────────────────────────────────────────┤
//! │ 0  (sync)    │ step varuint │ varbuf (state vector / update) │
//! │ 1  (presence)│ varbuf (presence update, see `presence`)      │
//! └──────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! Sync steps: 0 = state vector request, 1 = state diff response,
//! 2 = incremental update.

use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

const KIND_SYNC: u64 = 0;
const KIND_AWARENESS: u64 = 1;

const STEP_1: u64 = 0;
const STEP_2: u64 = 1;
const STEP_UPDATE: u64 = 2;

/// Top-level message kind selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Document state sync
    Sync,
    /// Presence / awareness update
    Awareness,
    /// Any other kind (auth, awareness query); accepted and ignored
    Other(u64),
}

impl MessageKind {
    pub fn from_tag(tag: u64) -> Self {
        match tag {
            KIND_SYNC => MessageKind::Sync,
            KIND_AWARENESS => MessageKind::Awareness,
            other => MessageKind::Other(other),
        }
    }

    pub fn tag(self) -> u64 {
        match self {
            MessageKind::Sync => KIND_SYNC,
            MessageKind::Awareness => KIND_AWARENESS,
            MessageKind::Other(tag) => tag,
        }
    }
}

/// State-sync sub-protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector of the sender
    SyncStep1(Vec<u8>),
    /// Update containing everything the receiver lacks
    SyncStep2(Vec<u8>),
    /// Incremental update
    Update(Vec<u8>),
}

impl SyncMessage {
    fn step(&self) -> u64 {
        match self {
            SyncMessage::SyncStep1(_) => STEP_1,
            SyncMessage::SyncStep2(_) => STEP_2,
            SyncMessage::Update(_) => STEP_UPDATE,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::SyncStep1(p) | SyncMessage::SyncStep2(p) | SyncMessage::Update(p) => p,
        }
    }
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncMessage),
    /// Encoded presence update
    Awareness(Vec<u8>),
    /// Unhandled kind; payload is dropped
    Other(u64),
}

impl Frame {
    /// State vector request advertising `sv`.
    pub fn sync_step1(sv: &StateVector) -> Self {
        Frame::Sync(SyncMessage::SyncStep1(sv.encode_v1()))
    }

    pub fn sync_step2(update: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::SyncStep2(update))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::Update(update))
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Frame::Sync(_) => MessageKind::Sync,
            Frame::Awareness(_) => MessageKind::Awareness,
            Frame::Other(tag) => MessageKind::Other(*tag),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.kind().tag());
        match self {
            Frame::Sync(msg) => {
                buf.write_var(msg.step());
                buf.write_buf(msg.payload());
            }
            Frame::Awareness(update) => buf.write_buf(update),
            Frame::Other(_) => {}
        }
        buf
    }

    /// Deserialize from binary wire format.
    ///
    /// Bytes after the payload are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let tag: u64 = cursor.read_var()?;
        match MessageKind::from_tag(tag) {
            MessageKind::Sync => {
                let step: u64 = cursor.read_var()?;
                let payload = cursor.read_buf()?.to_vec();
                let msg = match step {
                    STEP_1 => SyncMessage::SyncStep1(payload),
                    STEP_2 => SyncMessage::SyncStep2(payload),
                    STEP_UPDATE => SyncMessage::Update(payload),
                    other => return Err(ProtocolError::UnknownSyncStep(other)),
                };
                Ok(Frame::Sync(msg))
            }
            MessageKind::Awareness => Ok(Frame::Awareness(cursor.read_buf()?.to_vec())),
            MessageKind::Other(tag) => Ok(Frame::Other(tag)),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Truncated or malformed varint / buffer
    Malformed(String),
    UnknownSyncStep(u64),
    /// CRDT payload failed to decode or apply
    InvalidUpdate(String),
    /// Presence payload failed to decode
    InvalidAwareness(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed frame: {e}"),
            Self::UnknownSyncStep(step) => write!(f, "Unknown sync step: {step}"),
            Self::InvalidUpdate(e) => write!(f, "Invalid update: {e}"),
            Self::InvalidAwareness(e) => write!(f, "Invalid awareness update: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<read::Error> for ProtocolError {
    fn from(e: read::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
