//! Resumable reassembly of incoming messages.
//!
//! A [`MessageDeserializer`] consumes the byte stream of one remote identifier
//! in whatever pieces the transport delivers and rebuilds one message at a
//! time. Small bodies accumulate in a [`GrowableBuffer`]; bodies declared larger
//! than the configured cutoff are streamed to a temporary file as they arrive.

use crate::transport::protocol::{
    decode_u24, Message, MessageBody, MessageHeader, HEADER_LENGTH_SIZE, PROTOCOL_VERSION,
};
use crate::utils::{PeerlinkError, ProtocolError, Result, SessionConfig, StorageError};
use log::{debug, trace, warn};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Reassembly phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeserializerPhase {
    /// Waiting for the version byte of the next message
    AwaitingVersion,
    /// Collecting the 3-byte header length
    AwaitingHeaderLength,
    /// Collecting the header bytes
    AwaitingHeader,
    /// Header parsed; choosing where the body goes
    AwaitingBodyBoundary,
    /// Collecting body bytes
    AwaitingBody,
    /// Discarding the declared body of a rejected header
    SkippingBody,
    /// Message fully received, about to be handed out
    Complete,
}

/// Notification produced while reassembling
#[derive(Debug, Clone)]
pub enum DeserializerEvent {
    /// Header parsed: type, id and body length are known
    HeaderReady(MessageHeader),
    /// Part of the body has arrived
    BodyProgress {
        /// Message id
        id: String,
        /// Received fraction of the body
        progress: f32,
    },
    /// The message finished, successfully or not
    Complete(std::result::Result<Arc<Message>, PeerlinkError>),
}

/// Byte buffer that grows geometrically instead of per append
#[derive(Debug)]
pub struct GrowableBuffer {
    data: Vec<u8>,
    initial_capacity: usize,
    growth_factor: f64,
    growths: usize,
}

impl GrowableBuffer {
    /// Create a buffer with the given starting capacity and growth factor
    pub fn new(initial_capacity: usize, growth_factor: f64) -> Self {
        let initial_capacity = initial_capacity.max(1);
        Self {
            data: Vec::with_capacity(initial_capacity),
            initial_capacity,
            growth_factor: growth_factor.max(1.1),
            growths: 0,
        }
    }

    /// Append bytes, growing the allocation if needed
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let required = self.data.len() + bytes.len();
        if required > self.data.capacity() {
            let scaled = (self.data.capacity() as f64 * self.growth_factor).ceil() as usize;
            let target = scaled.max(required);
            self.data.reserve_exact(target - self.data.len());
            self.growths += 1;
        }
        self.data.extend_from_slice(bytes);
    }

    /// Buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current allocation size
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// How many times the allocation has grown
    pub fn growths(&self) -> usize {
        self.growths
    }

    /// Drop the contents, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Take the contents, leaving a fresh buffer at the initial capacity
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.data, Vec::with_capacity(self.initial_capacity))
    }
}

enum BodySink {
    Memory,
    Spool(BufWriter<NamedTempFile>),
}

/// Per-identifier incoming reassembler
pub struct MessageDeserializer {
    phase: DeserializerPhase,
    buffer: GrowableBuffer,
    header_length: usize,
    header: Option<MessageHeader>,
    sink: BodySink,
    received: u64,
    skip_remaining: u64,
    last_progress: Option<f32>,
    body_spool_cutoff: u64,
    progress_step: f32,
    spool_dir: Option<PathBuf>,
}

impl MessageDeserializer {
    /// Create a reassembler tuned by `config`
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            phase: DeserializerPhase::AwaitingVersion,
            buffer: GrowableBuffer::new(
                config.initial_buffer_capacity,
                config.buffer_growth_factor,
            ),
            header_length: 0,
            header: None,
            sink: BodySink::Memory,
            received: 0,
            skip_remaining: 0,
            last_progress: None,
            body_spool_cutoff: config.body_spool_cutoff,
            progress_step: config.progress_step,
            spool_dir: config.spool_dir.clone(),
        }
    }

    /// Current phase
    pub fn phase(&self) -> DeserializerPhase {
        self.phase
    }

    /// Header of the message in progress, once parsed
    pub fn current_header(&self) -> Option<&MessageHeader> {
        self.header.as_ref()
    }

    /// The receive buffer
    pub fn buffer(&self) -> &GrowableBuffer {
        &self.buffer
    }

    /// Drop any partial message, deleting its spool file, and wait for a new one
    pub fn reset(&mut self) {
        if self.phase != DeserializerPhase::AwaitingVersion {
            debug!("Deserializer reset in phase {:?}", self.phase);
        }
        self.phase = DeserializerPhase::AwaitingVersion;
        self.buffer.clear();
        self.header_length = 0;
        self.header = None;
        self.sink = BodySink::Memory;
        self.received = 0;
        self.skip_remaining = 0;
        self.last_progress = None;
    }

    /// Feed the next bytes of the stream and collect resulting events.
    ///
    /// On a protocol or storage failure the partial message is dropped and a
    /// failed `Complete` event is emitted. When the failed message declared a
    /// body length (a rejected header that still carries `length`, or a body
    /// that could not be stored) the rest of that body is skipped and decoding
    /// carries on with the next message. Any other failure discards the
    /// remainder of `data`.
    pub fn receive(&mut self, data: &[u8]) -> Vec<DeserializerEvent> {
        let mut events = Vec::new();
        let mut remaining = data;

        while !remaining.is_empty() || self.has_work_without_input() {
            if let Err(err) = self.step(&mut remaining, &mut events) {
                // Past the header the stream stays aligned: skip what is left of the body
                let aligned = matches!(
                    self.phase,
                    DeserializerPhase::AwaitingBodyBoundary
                        | DeserializerPhase::AwaitingBody
                        | DeserializerPhase::Complete
                );
                let unread = self.unread_body_length();
                if aligned {
                    warn!(
                        "Dropping incoming message in phase {:?}: {} (skipping {} body bytes)",
                        self.phase, err, unread
                    );
                } else {
                    warn!(
                        "Dropping incoming message in phase {:?}: {} ({} bytes discarded)",
                        self.phase,
                        err,
                        remaining.len()
                    );
                }
                self.reset();
                events.push(DeserializerEvent::Complete(Err(err)));
                if !aligned {
                    break;
                }
                if unread > 0 {
                    self.skip_remaining = unread;
                    self.phase = DeserializerPhase::SkippingBody;
                }
            }
        }

        events
    }

    /// Declared body bytes of the current message not yet consumed
    fn unread_body_length(&self) -> u64 {
        match (self.phase, &self.header) {
            (
                DeserializerPhase::AwaitingBodyBoundary | DeserializerPhase::AwaitingBody,
                Some(header),
            ) => header.body_length().saturating_sub(self.received),
            _ => 0,
        }
    }

    fn has_work_without_input(&self) -> bool {
        matches!(
            self.phase,
            DeserializerPhase::AwaitingBodyBoundary | DeserializerPhase::Complete
        )
    }

    fn step(&mut self, data: &mut &[u8], events: &mut Vec<DeserializerEvent>) -> Result<()> {
        match self.phase {
            DeserializerPhase::AwaitingVersion => {
                let input: &[u8] = *data;
                let version = input[0];
                *data = &input[1..];
                if version != PROTOCOL_VERSION {
                    return Err(ProtocolError::UnsupportedVersion { version }.into());
                }
                self.phase = DeserializerPhase::AwaitingHeaderLength;
            }
            DeserializerPhase::AwaitingHeaderLength => {
                if self.fill(data, HEADER_LENGTH_SIZE) {
                    self.header_length = decode_u24(self.buffer.as_slice());
                    self.buffer.clear();
                    if self.header_length == 0 {
                        return Err(ProtocolError::MalformedHeader {
                            reason: "empty header".to_string(),
                        }
                        .into());
                    }
                    self.phase = DeserializerPhase::AwaitingHeader;
                }
            }
            DeserializerPhase::AwaitingHeader => {
                if self.fill(data, self.header_length) {
                    let header = match MessageHeader::decode(self.buffer.as_slice()) {
                        Ok(header) => header,
                        Err(err) => return self.skip_rejected_body(err, events),
                    };
                    self.buffer.clear();
                    trace!(
                        "Header ready: {} {} ({} byte body)",
                        header.message_type(),
                        header.id(),
                        header.body_length()
                    );
                    events.push(DeserializerEvent::HeaderReady(header.clone()));
                    self.header = Some(header);
                    self.phase = DeserializerPhase::AwaitingBodyBoundary;
                }
            }
            DeserializerPhase::AwaitingBodyBoundary => {
                let body_length = self.header_ref()?.body_length();
                if body_length == 0 {
                    self.phase = DeserializerPhase::Complete;
                } else {
                    if body_length > self.body_spool_cutoff {
                        self.sink = BodySink::Spool(BufWriter::new(self.open_spool_file()?));
                        debug!("Spooling {} byte body to disk", body_length);
                    }
                    self.phase = DeserializerPhase::AwaitingBody;
                }
            }
            DeserializerPhase::AwaitingBody => {
                let (id, body_length) = {
                    let header = self.header_ref()?;
                    (header.id().to_string(), header.body_length())
                };
                let wanted = body_length - self.received;
                let take = (wanted.min(data.len() as u64)) as usize;
                let input: &[u8] = *data;
                let (bytes, rest) = input.split_at(take);

                match &mut self.sink {
                    BodySink::Memory => self.buffer.extend_from_slice(bytes),
                    BodySink::Spool(writer) => writer.write_all(bytes).map_err(storage)?,
                }
                *data = rest;
                self.received += take as u64;

                if self.received == body_length {
                    self.phase = DeserializerPhase::Complete;
                } else {
                    self.report_progress(id, body_length, events);
                }
            }
            DeserializerPhase::SkippingBody => {
                let input: &[u8] = *data;
                let take = (self.skip_remaining.min(input.len() as u64)) as usize;
                *data = &input[take..];
                self.skip_remaining -= take as u64;
                if self.skip_remaining == 0 {
                    trace!("Skipped body of rejected message");
                    self.phase = DeserializerPhase::AwaitingVersion;
                }
            }
            DeserializerPhase::Complete => {
                let message = self.finish()?;
                if message.body_length() > 0 {
                    events.push(DeserializerEvent::BodyProgress {
                        id: message.id().to_string(),
                        progress: 1.0,
                    });
                }
                events.push(DeserializerEvent::Complete(Ok(message)));
            }
        }
        Ok(())
    }

    /// Fail the message for a header that did not decode, keeping the stream
    /// aligned when the header still says how long its body is
    fn skip_rejected_body(
        &mut self,
        err: PeerlinkError,
        events: &mut Vec<DeserializerEvent>,
    ) -> Result<()> {
        let Some(length) = MessageHeader::declared_body_length(self.buffer.as_slice()) else {
            return Err(err);
        };
        warn!("Rejected incoming header: {} (skipping {} body bytes)", err, length);
        self.reset();
        events.push(DeserializerEvent::Complete(Err(err)));
        if length > 0 {
            self.skip_remaining = length;
            self.phase = DeserializerPhase::SkippingBody;
        }
        Ok(())
    }

    fn fill(&mut self, data: &mut &[u8], target: usize) -> bool {
        let needed = target.saturating_sub(self.buffer.len());
        let input: &[u8] = *data;
        let take = needed.min(input.len());
        self.buffer.extend_from_slice(&input[..take]);
        *data = &input[take..];
        self.buffer.len() == target
    }

    fn header_ref(&self) -> Result<&MessageHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| PeerlinkError::unexpected("body phase without a header"))
    }

    fn report_progress(&mut self, id: String, body_length: u64, events: &mut Vec<DeserializerEvent>) {
        let progress = (self.received as f64 / body_length as f64) as f32;
        if progress >= 1.0 {
            return;
        }
        let due = match self.last_progress {
            None => true,
            Some(last) => progress > last && progress - last >= self.progress_step,
        };
        if due {
            self.last_progress = Some(progress);
            events.push(DeserializerEvent::BodyProgress { id, progress });
        }
    }

    fn open_spool_file(&self) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("peerlink-").suffix(".body");
        let file = match &self.spool_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(storage)?;
                builder.tempfile_in(dir)
            }
            None => builder.tempfile(),
        };
        file.map_err(storage)
    }

    fn finish(&mut self) -> Result<Arc<Message>> {
        let header = self
            .header
            .take()
            .ok_or_else(|| PeerlinkError::unexpected("completed without a header"))?;
        let length = header.body_length();

        let body = match std::mem::replace(&mut self.sink, BodySink::Memory) {
            BodySink::Memory if length == 0 => MessageBody::Empty,
            BodySink::Memory => MessageBody::Bytes(self.buffer.take()),
            BodySink::Spool(writer) => {
                let file = writer.into_inner().map_err(|e| storage(e.into_error()))?;
                MessageBody::Spooled {
                    path: Arc::new(file.into_temp_path()),
                    length,
                }
            }
        };

        self.reset();
        Ok(Arc::new(Message::from_parts(header, body)))
    }
}

impl Default for MessageDeserializer {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

fn storage(err: std::io::Error) -> PeerlinkError {
    StorageError::BodyStorage {
        reason: err.to_string(),
    }
    .into()
}
