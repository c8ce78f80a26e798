//! Message protocol definitions and the wire codec.
//!
//! Every message travels as one contiguous byte stream:
//!
//! ```text
//! +-----------+----------------------+---------------------------+-----------+
//! | version   | header length        | header                    | body      |
//! | 1 byte    | 3 bytes, u24 BE      | UTF-8 JSON object         | N bytes   |
//! +-----------+----------------------+---------------------------+-----------+
//! ```
//!
//! The header always carries `type`, `length` (body length) and `id`, plus the
//! fields of its [`MessageKind`]. A [`Message`] can be sliced at any absolute
//! offset of that stream, so a sender can resume or re-send any window without
//! holding the whole encoding in memory.

use crate::crypto::Peer;
use crate::utils::{PeerlinkError, ProtocolError, Result, StorageError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use uuid::Uuid;

/// Protocol revision carried in the first byte of every message
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the header length field
pub const HEADER_LENGTH_SIZE: usize = 3;

/// Version byte plus header length field
pub const PREAMBLE_SIZE: usize = 1 + HEADER_LENGTH_SIZE;

/// Largest header the 24-bit length field can describe
pub const MAX_HEADER_LENGTH: usize = 0x00FF_FFFF;

/// Header key holding the message type
pub const HEADER_TYPE: &str = "type";

/// Header key holding the body length
pub const HEADER_LENGTH: &str = "length";

/// Header key holding the message id
pub const HEADER_ID: &str = "id";

/// Sub-kind of a file transfer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileTransferKind {
    /// Sender proposes a file; no body
    Offer,
    /// Receiver accepts a previously offered file; no body
    Accept,
    /// The file contents
    Transfer,
}

/// Type-specific header fields, one variant per message kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    /// Identity handshake: who the sender is
    #[serde(rename = "identity")]
    Identity {
        /// Sender alias
        alias: String,
        /// Sender public key
        #[serde(rename = "pubkey", with = "base64_key")]
        public_key: Vec<u8>,
    },
    /// Arbitrary application payload
    #[serde(rename = "datatransfer")]
    DataTransfer {
        /// Receiver accepted a transfer (bookkeeping for offer/accept flows)
        #[serde(default)]
        accept: bool,
        /// Offset the receiver wants the transfer resumed from
        #[serde(rename = "resumeoffset", default)]
        resume_offset: u64,
        /// Free-form application fields
        #[serde(default)]
        extra: Map<String, Value>,
    },
    /// File-backed payload
    #[serde(rename = "filetransfer")]
    FileTransfer {
        /// MIME type of the file
        #[serde(rename = "content-type")]
        content_type: String,
        /// Original file name
        filename: String,
        /// Offer, accept or transfer
        subkind: FileTransferKind,
    },
    /// Asks the receiver to prefer another transport from now on
    #[serde(rename = "transport-upgrade")]
    TransportUpgrade {
        /// Capability code of the preferred transport
        #[serde(rename = "transport-code")]
        transport_code: u32,
    },
}

impl MessageKind {
    /// Known wire type names
    pub const TYPES: [&'static str; 4] =
        ["identity", "datatransfer", "filetransfer", "transport-upgrade"];

    /// Wire type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Identity { .. } => "identity",
            Self::DataTransfer { .. } => "datatransfer",
            Self::FileTransfer { .. } => "filetransfer",
            Self::TransportUpgrade { .. } => "transport-upgrade",
        }
    }
}

mod base64_key {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Header-only view of a message: everything known once the header is parsed
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    id: String,
    kind: MessageKind,
    body_length: u64,
}

impl MessageHeader {
    /// Build a header view
    pub fn new(id: impl Into<String>, kind: MessageKind, body_length: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            body_length,
        }
    }

    /// Message id, unique per message instance
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Type-specific fields
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Declared body length in bytes
    pub fn body_length(&self) -> u64 {
        self.body_length
    }

    /// Wire type name
    pub fn message_type(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Whether this is an identity handshake message
    pub fn is_identity(&self) -> bool {
        matches!(self.kind, MessageKind::Identity { .. })
    }

    /// Encode as the JSON header object
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(&self.kind)?;
        let fields = value.as_object_mut().ok_or_else(|| {
            PeerlinkError::unexpected("message kind did not serialize to an object")
        })?;
        fields.insert(HEADER_LENGTH.to_string(), Value::from(self.body_length));
        fields.insert(HEADER_ID.to_string(), Value::from(self.id.clone()));
        Ok(serde_json::to_vec(&value)?)
    }

    /// Parse a JSON header object
    ///
    /// # Errors
    ///
    /// `MalformedHeader` for bytes that are not a JSON object or whose fields do
    /// not match the declared type, `MissingField` for absent required keys and
    /// `UnknownMessageType` for types this revision does not know.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
        let fields = value
            .as_object()
            .ok_or_else(|| malformed("header is not an object"))?;

        let message_type = fields
            .get(HEADER_TYPE)
            .and_then(Value::as_str)
            .ok_or_else(|| missing(HEADER_TYPE))?;
        if !MessageKind::TYPES.contains(&message_type) {
            return Err(ProtocolError::UnknownMessageType {
                message_type: message_type.to_string(),
            }
            .into());
        }
        let body_length = fields
            .get(HEADER_LENGTH)
            .and_then(Value::as_u64)
            .ok_or_else(|| missing(HEADER_LENGTH))?;
        let id = fields
            .get(HEADER_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| missing(HEADER_ID))?
            .to_string();

        let kind: MessageKind =
            serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;

        Ok(Self {
            id,
            kind,
            body_length,
        })
    }

    /// Body length declared by a header object, even one that fails [`decode`].
    ///
    /// `None` when the bytes are not a JSON object with a numeric `length`.
    ///
    /// [`decode`]: MessageHeader::decode
    pub fn declared_body_length(bytes: &[u8]) -> Option<u64> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        value.as_object()?.get(HEADER_LENGTH)?.as_u64()
    }
}

fn malformed(reason: impl Into<String>) -> PeerlinkError {
    ProtocolError::MalformedHeader {
        reason: reason.into(),
    }
    .into()
}

fn missing(field: &str) -> PeerlinkError {
    ProtocolError::MissingField {
        field: field.to_string(),
    }
    .into()
}

/// Encode a header length into the 3-byte big-endian field
pub(crate) fn encode_u24(length: usize) -> Result<[u8; HEADER_LENGTH_SIZE]> {
    if length > MAX_HEADER_LENGTH {
        return Err(ProtocolError::HeaderTooLarge {
            size: length,
            max: MAX_HEADER_LENGTH,
        }
        .into());
    }
    Ok([(length >> 16) as u8, (length >> 8) as u8, length as u8])
}

/// Decode the 3-byte big-endian header length field
pub(crate) fn decode_u24(bytes: &[u8]) -> usize {
    (usize::from(bytes[0]) << 16) | (usize::from(bytes[1]) << 8) | usize::from(bytes[2])
}

/// Where a message body lives
#[derive(Debug, Clone)]
pub enum MessageBody {
    /// No body
    Empty,
    /// Body held in memory
    Bytes(Vec<u8>),
    /// Body read lazily from a file on disk
    File {
        /// File location
        path: PathBuf,
        /// Body length captured when the message was built
        length: u64,
    },
    /// Received body spooled to a temporary file; removed with the last reference
    Spooled {
        /// Temporary file
        path: Arc<TempPath>,
        /// Body length
        length: u64,
    },
}

impl MessageBody {
    /// Body backed by an existing file
    pub fn file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let length = std::fs::metadata(&path)?.len();
        Ok(Self::File { path, length })
    }

    /// Body length in bytes
    pub fn len(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::File { length, .. } | Self::Spooled { length, .. } => *length,
        }
    }

    /// Whether the body has no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } => Some(path),
            Self::Spooled { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// An immutable wire message: typed header plus offset-addressable body.
///
/// The encoded preamble (version, header length, header) is produced on first
/// use and cached; later serialization calls reuse the same bytes.
pub struct Message {
    header: MessageHeader,
    body: MessageBody,
    preamble: OnceCell<Vec<u8>>,
    body_reader: Mutex<Option<File>>,
}

impl Message {
    /// Create a message of the given kind with a fresh id
    pub fn new(kind: MessageKind, body: MessageBody) -> Self {
        let header = MessageHeader::new(Uuid::new_v4().to_string(), kind, body.len());
        Self::from_parts(header, body)
    }

    /// Assemble a message from an already-known header, keeping its id
    pub fn from_parts(header: MessageHeader, body: MessageBody) -> Self {
        Self {
            header,
            body,
            preamble: OnceCell::new(),
            body_reader: Mutex::new(None),
        }
    }

    /// Identity handshake message announcing `peer`
    pub fn identity(peer: &Peer) -> Self {
        Self::new(
            MessageKind::Identity {
                alias: peer.alias().to_string(),
                public_key: peer.public_key().to_vec(),
            },
            MessageBody::Empty,
        )
    }

    /// Application payload with optional free-form fields
    pub fn data(payload: Vec<u8>, extra: Map<String, Value>) -> Self {
        Self::data_with(false, 0, payload, extra)
    }

    /// Application payload carrying accept/resume bookkeeping
    pub fn data_with(
        accept: bool,
        resume_offset: u64,
        payload: Vec<u8>,
        extra: Map<String, Value>,
    ) -> Self {
        let body = if payload.is_empty() {
            MessageBody::Empty
        } else {
            MessageBody::Bytes(payload)
        };
        Self::new(
            MessageKind::DataTransfer {
                accept,
                resume_offset,
                extra,
            },
            body,
        )
    }

    /// Offer a file by name without sending its contents
    pub fn file_offer(filename: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self::file_control(filename, content_type, FileTransferKind::Offer)
    }

    /// Accept a previously offered file
    pub fn file_accept(filename: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self::file_control(filename, content_type, FileTransferKind::Accept)
    }

    fn file_control(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        subkind: FileTransferKind,
    ) -> Self {
        Self::new(
            MessageKind::FileTransfer {
                content_type: content_type.into(),
                filename: filename.into(),
                subkind,
            },
            MessageBody::Empty,
        )
    }

    /// Send the contents of the file at `path`; the file is read lazily
    pub fn file_transfer(path: impl AsRef<Path>, content_type: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(
            MessageKind::FileTransfer {
                content_type: content_type.into(),
                filename,
                subkind: FileTransferKind::Transfer,
            },
            MessageBody::file(path)?,
        ))
    }

    /// Ask the receiver to prefer the transport with `transport_code`
    pub fn transport_upgrade(transport_code: u32) -> Self {
        Self::new(
            MessageKind::TransportUpgrade { transport_code },
            MessageBody::Empty,
        )
    }

    /// Header-only view
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Message id
    pub fn id(&self) -> &str {
        self.header.id()
    }

    /// Type-specific fields
    pub fn kind(&self) -> &MessageKind {
        self.header.kind()
    }

    /// Body storage
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Body length in bytes
    pub fn body_length(&self) -> u64 {
        self.header.body_length()
    }

    /// Backing file of a spooled incoming body
    pub fn spooled_path(&self) -> Option<&Path> {
        match &self.body {
            MessageBody::Spooled { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Version byte, header length and header, encoded once per message
    pub fn encoded_preamble(&self) -> Result<&[u8]> {
        self.preamble
            .get_or_try_init(|| {
                let header = self.header.encode()?;
                let length = encode_u24(header.len())?;
                let mut preamble = Vec::with_capacity(PREAMBLE_SIZE + header.len());
                preamble.push(PROTOCOL_VERSION);
                preamble.extend_from_slice(&length);
                preamble.extend_from_slice(&header);
                Ok(preamble)
            })
            .map(Vec::as_slice)
    }

    /// Total length of the serialized stream
    pub fn total_length(&self) -> Result<u64> {
        Ok(self.encoded_preamble()?.len() as u64 + self.body_length())
    }

    /// Return the window `[offset, offset + max_len)` of the serialized stream,
    /// truncated at its end, or `None` once `offset` reaches the end.
    pub fn serialize(&self, offset: u64, max_len: usize) -> Result<Option<Vec<u8>>> {
        if max_len == 0 {
            return Err(ProtocolError::InvalidChunkLength.into());
        }
        let preamble = self.encoded_preamble()?;
        let preamble_len = preamble.len() as u64;
        let total = preamble_len + self.body_length();
        if offset >= total {
            return Ok(None);
        }

        let end = total.min(offset.saturating_add(max_len as u64));
        let mut chunk = Vec::with_capacity((end - offset) as usize);

        if offset < preamble_len {
            let preamble_end = end.min(preamble_len);
            chunk.extend_from_slice(&preamble[offset as usize..preamble_end as usize]);
        }
        if end > preamble_len {
            let body_start = offset.max(preamble_len) - preamble_len;
            let body_end = end - preamble_len;
            chunk.extend_from_slice(&self.body_range(body_start, body_end - body_start)?);
        }

        Ok(Some(chunk))
    }

    /// The whole serialized stream; intended for small messages and tooling
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let total = self.total_length()?;
        Ok(self
            .serialize(0, total.max(1) as usize)?
            .unwrap_or_default())
    }

    /// Read up to `len` body bytes starting at `offset`
    pub fn body_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let end = self.body_length().min(offset.saturating_add(len));
        if offset >= end {
            return Ok(Vec::new());
        }
        match &self.body {
            MessageBody::Empty => Ok(Vec::new()),
            MessageBody::Bytes(bytes) => Ok(bytes[offset as usize..end as usize].to_vec()),
            MessageBody::File { .. } | MessageBody::Spooled { .. } => {
                self.read_file_range(offset, end - offset)
            }
        }
    }

    /// Entire body in memory
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        self.body_range(0, self.body_length())
    }

    fn read_file_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let path = self.body.path().ok_or_else(|| {
            PeerlinkError::unexpected("file range requested for an in-memory body")
        })?;
        let read_err = |e: std::io::Error| {
            PeerlinkError::from(StorageError::BodyRead {
                reason: format!("{}: {}", path.display(), e),
            })
        };

        let mut reader = self.body_reader.lock();
        if reader.is_none() {
            *reader = Some(File::open(path).map_err(read_err)?);
        }
        let file = reader
            .as_mut()
            .ok_or_else(|| PeerlinkError::unexpected("body reader missing"))?;

        file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
        let mut out = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut out).map_err(read_err)?;
        if (out.len() as u64) < len {
            return Err(StorageError::BodyRead {
                reason: format!("{} is shorter than its declared length", path.display()),
            }
            .into());
        }
        Ok(out)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("body", &self.body)
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} bytes)",
            self.header.message_type(),
            self.header.id(),
            self.header.body_length()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalPeer;
    use std::io::Write;

    fn slice_all(message: &Message, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offset = 0u64;
        while let Some(bytes) = message.serialize(offset, chunk).unwrap() {
            assert!(!bytes.is_empty() && bytes.len() <= chunk);
            offset += bytes.len() as u64;
            out.extend_from_slice(&bytes);
        }
        out
    }

    #[test]
    fn test_identity_layout() {
        let peer = Peer::new(vec![9u8; 32], "dbro", 0);
        let message = Message::identity(&peer);
        let bytes = message.to_bytes().unwrap();

        assert_eq!(bytes[0], PROTOCOL_VERSION);
        let header_len = decode_u24(&bytes[1..4]);
        assert_eq!(bytes.len(), PREAMBLE_SIZE + header_len);

        let header = MessageHeader::decode(&bytes[4..]).unwrap();
        assert_eq!(header.id(), message.id());
        assert_eq!(header.body_length(), 0);
        match header.kind() {
            MessageKind::Identity { alias, public_key } => {
                assert_eq!(alias, "dbro");
                assert_eq!(public_key, &vec![9u8; 32]);
            }
            other => panic!("expected identity, got {:?}", other),
        }
    }

    #[test]
    fn test_header_wire_fields() {
        let message = Message::data_with(true, 42, b"abc".to_vec(), Map::new());
        let preamble = message.encoded_preamble().unwrap();
        let json: Value = serde_json::from_slice(&preamble[PREAMBLE_SIZE..]).unwrap();

        assert_eq!(json["type"], "datatransfer");
        assert_eq!(json["length"], 3);
        assert_eq!(json["id"], message.id());
        assert_eq!(json["accept"], true);
        assert_eq!(json["resumeoffset"], 42);
        assert!(json["extra"].is_object());
    }

    #[test]
    fn test_file_and_upgrade_wire_fields() {
        let offer = Message::file_offer("photo.jpg", "image/jpeg");
        let json: Value =
            serde_json::from_slice(&offer.encoded_preamble().unwrap()[PREAMBLE_SIZE..]).unwrap();
        assert_eq!(json["type"], "filetransfer");
        assert_eq!(json["content-type"], "image/jpeg");
        assert_eq!(json["filename"], "photo.jpg");
        assert_eq!(json["subkind"], "offer");

        let upgrade = Message::transport_upgrade(2);
        let json: Value =
            serde_json::from_slice(&upgrade.encoded_preamble().unwrap()[PREAMBLE_SIZE..])
                .unwrap();
        assert_eq!(json["type"], "transport-upgrade");
        assert_eq!(json["transport-code"], 2);
    }

    #[test]
    fn test_preamble_is_cached() {
        let message = Message::data(vec![1, 2, 3], Map::new());
        let first = message.encoded_preamble().unwrap().as_ptr();
        let _ = message.serialize(0, 5).unwrap();
        let _ = message.serialize(5, 5).unwrap();
        let second = message.encoded_preamble().unwrap().as_ptr();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_serialize_windows() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let message = Message::data(payload.clone(), Map::new());
        let whole = message.to_bytes().unwrap();
        let total = message.total_length().unwrap();
        assert_eq!(whole.len() as u64, total);
        assert!(whole.ends_with(&payload));

        for chunk in [1usize, 3, 7, 20, 64, 999, 5000] {
            assert_eq!(slice_all(&message, chunk), whole);
        }

        // Arbitrary window straddling the header/body boundary
        let preamble_len = message.encoded_preamble().unwrap().len() as u64;
        let window = message.serialize(preamble_len - 2, 6).unwrap().unwrap();
        assert_eq!(window, whole[(preamble_len - 2) as usize..(preamble_len + 4) as usize]);

        assert!(message.serialize(total, 10).unwrap().is_none());
        assert!(message.serialize(total + 5, 10).unwrap().is_none());
        assert!(message.serialize(0, 0).is_err());
    }

    #[test]
    fn test_file_backed_body_is_read_lazily() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let contents: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&contents).unwrap();
        file.flush().unwrap();

        let message = Message::file_transfer(file.path(), "application/octet-stream").unwrap();
        assert_eq!(message.body_length(), 5000);
        assert_eq!(message.body_range(100, 50).unwrap(), contents[100..150]);
        assert_eq!(message.body_range(4990, 50).unwrap(), contents[4990..]);

        let bytes = slice_all(&message, 37);
        assert!(bytes.ends_with(&contents));
    }

    #[test]
    fn test_decode_rejects_bad_headers() {
        assert!(matches!(
            MessageHeader::decode(b"not json"),
            Err(PeerlinkError::Protocol(ProtocolError::MalformedHeader { .. }))
        ));
        assert!(matches!(
            MessageHeader::decode(br#"{"type":"identity","id":"x"}"#),
            Err(PeerlinkError::Protocol(ProtocolError::MissingField { .. }))
        ));
        assert!(matches!(
            MessageHeader::decode(br#"{"type":"teleport","length":0,"id":"x"}"#),
            Err(PeerlinkError::Protocol(ProtocolError::UnknownMessageType { .. }))
        ));
        assert!(matches!(
            MessageHeader::decode(br#"{"type":"identity","length":0,"id":"x","alias":"a"}"#),
            Err(PeerlinkError::Protocol(ProtocolError::MalformedHeader { .. }))
        ));
    }

    #[test]
    fn test_header_length_limit() {
        assert!(encode_u24(MAX_HEADER_LENGTH).is_ok());
        assert!(encode_u24(MAX_HEADER_LENGTH + 1).is_err());
        let encoded = encode_u24(0x01_02_03).unwrap();
        assert_eq!(encoded, [1, 2, 3]);
        assert_eq!(decode_u24(&encoded), 0x01_02_03);
    }

    #[test]
    fn test_ids_are_unique() {
        let local = LocalPeer::generate("me");
        let a = Message::identity(local.peer());
        let b = Message::identity(local.peer());
        assert_ne!(a.id(), b.id());
    }
}
