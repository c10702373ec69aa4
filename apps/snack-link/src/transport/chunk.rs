use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::Value;
use snack_proto::{ChunkSequence, TransportMessage};
use thiserror::Error;
use tokio::time::Instant;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 32 * 1024;
pub const DEFAULT_MAX_REASSEMBLED_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_INFLIGHT: usize = 64;
const EXPIRED_HISTORY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Single-publish limit of the relay; larger messages are split.
    pub max_message_bytes: usize,
    /// Upper bound on one reassembled payload.
    pub max_reassembled_bytes: usize,
    pub max_inflight: usize,
    pub reassembly_timeout: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_reassembled_bytes: DEFAULT_MAX_REASSEMBLED_BYTES,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        }
    }
}

impl ChunkConfig {
    /// How often the reassembly buffer is swept for expired chunk sets.
    pub fn sweep_interval(&self) -> Duration {
        (self.reassembly_timeout / 4).max(Duration::from_millis(50))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
    #[error("chunk malformed: {0}")]
    Malformed(&'static str),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Serializes `message` into one or more relay payloads, each no larger than
/// `config.max_message_bytes`.
///
/// Oversized messages keep their envelope (type, sender, target) on every
/// chunk; the serialized payload is base64 encoded and split so no chunk
/// needs JSON escaping and every fragment size is exact.
pub fn encode_outbound(
    message: &TransportMessage,
    config: &ChunkConfig,
) -> Result<Vec<Bytes>, ChunkError> {
    let whole = serde_json::to_vec(message).map_err(|err| ChunkError::Encode(err.to_string()))?;
    if whole.len() <= config.max_message_bytes {
        return Ok(vec![Bytes::from(whole)]);
    }

    let payload =
        serde_json::to_vec(&message.payload).map_err(|err| ChunkError::Encode(err.to_string()))?;
    if payload.len() > config.max_reassembled_bytes {
        return Err(ChunkError::MessageTooLarge(payload.len()));
    }
    let encoded = BASE64.encode(&payload);
    let message_id = ChunkSequence::new_message_id();

    let skeleton = chunk_message(message, String::new(), u32::MAX, u32::MAX, &message_id);
    let overhead = serde_json::to_vec(&skeleton)
        .map_err(|err| ChunkError::Encode(err.to_string()))?
        .len();
    let capacity = config.max_message_bytes.saturating_sub(overhead);
    if capacity < 4 {
        return Err(ChunkError::MessageTooLarge(whole.len()));
    }

    let fragments: Vec<&[u8]> = encoded.as_bytes().chunks(capacity).collect();
    let total =
        u32::try_from(fragments.len()).map_err(|_| ChunkError::Malformed("chunk total overflow"))?;
    let mut frames = Vec::with_capacity(fragments.len());
    for (index, fragment) in fragments.into_iter().enumerate() {
        let index = u32::try_from(index)
            .map_err(|_| ChunkError::Malformed("chunk sequence overflowed u32"))?;
        let fragment = std::str::from_utf8(fragment)
            .map_err(|_| ChunkError::Encode("base64 fragment is not ascii".into()))?
            .to_string();
        let chunk = chunk_message(message, fragment, index, total, &message_id);
        let bytes =
            serde_json::to_vec(&chunk).map_err(|err| ChunkError::Encode(err.to_string()))?;
        frames.push(Bytes::from(bytes));
    }
    Ok(frames)
}

fn chunk_message(
    message: &TransportMessage,
    fragment: String,
    index: u32,
    total: u32,
    message_id: &str,
) -> TransportMessage {
    TransportMessage {
        kind: message.kind.clone(),
        device_id: message.device_id.clone(),
        payload: Value::String(fragment),
        sequence: Some(ChunkSequence {
            index,
            total,
            message_id: message_id.to_string(),
        }),
        target: message.target.clone(),
    }
}

/// A chunk set dropped before all of its members arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredChunkSet {
    pub message_id: String,
    pub sender: String,
    pub received: u32,
    pub total: u32,
    pub reason: ExpiryReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Timeout,
    Capacity,
}

#[derive(Debug)]
struct PartialMessage {
    created_at: Instant,
    sender: String,
    total: u32,
    fragments: BTreeMap<u32, String>,
    received: u32,
    received_bytes: usize,
}

/// Receiver-side buffer of partial chunk sets keyed by message id.
pub struct Reassembler {
    partials: HashMap<String, PartialMessage>,
    expired: VecDeque<String>,
    expired_ids: HashSet<String>,
    config: ChunkConfig,
}

#[derive(Debug, Default, PartialEq)]
pub struct IngestOutcome {
    pub completed: Option<TransportMessage>,
    pub evicted: Vec<ExpiredChunkSet>,
}

impl Reassembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            expired: VecDeque::new(),
            expired_ids: HashSet::new(),
            config,
        }
    }

    pub fn inflight(&self) -> usize {
        self.partials.len()
    }

    /// Largest chunk count a set within `max_reassembled_bytes` can need:
    /// one base64 character per fragment.
    fn max_total(&self) -> u64 {
        (self.config.max_reassembled_bytes as u64 / 3 + 1) * 4
    }

    /// Feeds one inbound message. Unchunked messages pass straight through;
    /// chunks are buffered until their set is complete.
    pub fn ingest(
        &mut self,
        message: TransportMessage,
        now: Instant,
    ) -> Result<IngestOutcome, ChunkError> {
        let mut outcome = IngestOutcome::default();
        let Some(sequence) = message.sequence.clone() else {
            outcome.completed = Some(message);
            return Ok(outcome);
        };

        if sequence.total == 0 {
            return Err(ChunkError::Malformed("chunk total cannot be zero"));
        }
        if sequence.index >= sequence.total {
            return Err(ChunkError::Malformed("chunk index exceeds total"));
        }
        if u64::from(sequence.total) > self.max_total() {
            return Err(ChunkError::Malformed("chunk total exceeds reassembly limit"));
        }
        let Value::String(fragment) = &message.payload else {
            return Err(ChunkError::Malformed("chunk payload must be a string fragment"));
        };
        if self.expired_ids.contains(&sequence.message_id) {
            tracing::debug!(
                target = "snack::transport::chunk",
                message_id = %sequence.message_id,
                index = sequence.index,
                "ignoring chunk for expired message"
            );
            return Ok(outcome);
        }

        let timed_out = self.partials.get(&sequence.message_id).is_some_and(|partial| {
            now.saturating_duration_since(partial.created_at) >= self.config.reassembly_timeout
        });
        if timed_out {
            if let Some(partial) = self.partials.remove(&sequence.message_id) {
                outcome.evicted.push(ExpiredChunkSet {
                    message_id: sequence.message_id.clone(),
                    sender: partial.sender,
                    received: partial.received,
                    total: partial.total,
                    reason: ExpiryReason::Timeout,
                });
            }
            self.remember_expired(sequence.message_id);
            return Ok(outcome);
        }

        if !self.partials.contains_key(&sequence.message_id)
            && self.partials.len() >= self.config.max_inflight
        {
            if let Some(evicted) = self.evict_oldest() {
                outcome.evicted.push(evicted);
            }
        }

        let entry = self
            .partials
            .entry(sequence.message_id.clone())
            .or_insert_with(|| PartialMessage {
                created_at: now,
                sender: message.device_id.clone(),
                total: sequence.total,
                fragments: BTreeMap::new(),
                received: 0,
                received_bytes: 0,
            });

        if entry.total != sequence.total {
            self.partials.remove(&sequence.message_id);
            self.remember_expired(sequence.message_id);
            return Err(ChunkError::Malformed("chunk total changed for message"));
        }

        if !entry.fragments.contains_key(&sequence.index) {
            entry.received += 1;
            entry.received_bytes = entry.received_bytes.saturating_add(fragment.len());
            entry.fragments.insert(sequence.index, fragment.clone());
        }
        // base64 inflates by 4/3
        if entry.received_bytes / 4 * 3 > self.config.max_reassembled_bytes {
            let size = entry.received_bytes;
            self.partials.remove(&sequence.message_id);
            self.remember_expired(sequence.message_id);
            return Err(ChunkError::MessageTooLarge(size));
        }
        if entry.received < entry.total {
            return Ok(outcome);
        }

        let Some(partial) = self.partials.remove(&sequence.message_id) else {
            return Ok(outcome);
        };
        // indices are unique and below `total`, so the map holds 0..total in order
        let mut encoded = String::with_capacity(partial.received_bytes);
        for fragment in partial.fragments.values() {
            encoded.push_str(fragment);
        }
        let raw = BASE64
            .decode(encoded.as_bytes())
            .map_err(|_| ChunkError::Malformed("chunk fragments are not base64"))?;
        let payload: Value = serde_json::from_slice(&raw)
            .map_err(|_| ChunkError::Malformed("reassembled payload is not json"))?;

        outcome.completed = Some(TransportMessage {
            kind: message.kind,
            device_id: message.device_id,
            payload,
            sequence: None,
            target: message.target,
        });
        Ok(outcome)
    }

    /// Drops every chunk set older than the reassembly timeout. Late chunks
    /// of a dropped set are ignored, so it can never be delivered partially.
    pub fn expire(&mut self, now: Instant) -> Vec<ExpiredChunkSet> {
        let timeout = self.config.reassembly_timeout;
        let expired_ids: Vec<String> = self
            .partials
            .iter()
            .filter(|(_, partial)| now.saturating_duration_since(partial.created_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut dropped = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(partial) = self.partials.remove(&id) {
                dropped.push(ExpiredChunkSet {
                    message_id: id.clone(),
                    sender: partial.sender,
                    received: partial.received,
                    total: partial.total,
                    reason: ExpiryReason::Timeout,
                });
                self.remember_expired(id);
            }
        }
        dropped
    }

    fn evict_oldest(&mut self) -> Option<ExpiredChunkSet> {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.created_at)
            .map(|(id, _)| id.clone())?;
        let partial = self.partials.remove(&oldest)?;
        self.remember_expired(oldest.clone());
        Some(ExpiredChunkSet {
            message_id: oldest,
            sender: partial.sender,
            received: partial.received,
            total: partial.total,
            reason: ExpiryReason::Capacity,
        })
    }

    fn remember_expired(&mut self, message_id: String) {
        if self.expired_ids.insert(message_id.clone()) {
            self.expired.push_back(message_id);
        }
        while self.expired.len() > EXPIRED_HISTORY {
            if let Some(old) = self.expired.pop_front() {
                self.expired_ids.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{seq::SliceRandom, thread_rng};
    use snack_proto::MessageType;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            max_message_bytes: 256,
            max_reassembled_bytes: 64 * 1024,
            max_inflight: 4,
            reassembly_timeout: Duration::from_secs(1),
        }
    }

    fn large_message(len: usize) -> TransportMessage {
        let contents: String = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        TransportMessage::new(
            MessageType::Code,
            "editor",
            serde_json::json!({ "files": { "App.js": { "type": "CODE", "contents": contents } } }),
        )
    }

    fn decode(frames: &[Bytes]) -> Vec<TransportMessage> {
        frames
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).expect("chunk decodes"))
            .collect()
    }

    #[test]
    fn small_messages_are_sent_verbatim() {
        let config = small_config();
        let message = TransportMessage::new(MessageType::Status, "editor", serde_json::json!({"ok": true}));
        let frames = encode_outbound(&message, &config).expect("encode");
        assert_eq!(frames.len(), 1);
        let decoded: TransportMessage = serde_json::from_slice(&frames[0]).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn every_chunk_fits_the_limit() {
        let config = small_config();
        let frames = encode_outbound(&large_message(4096), &config).expect("encode");
        assert!(frames.len() > 1);
        for frame in &frames {
            assert!(frame.len() <= config.max_message_bytes, "{} bytes", frame.len());
        }
    }

    #[test]
    fn out_of_order_and_duplicate_chunks_reassemble() {
        let config = small_config();
        let original = large_message(3000).with_target("phone");
        let mut chunks = decode(&encode_outbound(&original, &config).expect("encode"));
        assert!(chunks.len() > 2);
        chunks.shuffle(&mut thread_rng());
        let duplicate = chunks[0].clone();
        chunks.insert(1, duplicate);

        let mut reassembler = Reassembler::new(config);
        let now = Instant::now();
        let mut completed = Vec::new();
        for chunk in chunks {
            if let Some(done) = reassembler.ingest(chunk, now).expect("ingest").completed {
                completed.push(done);
            }
        }
        assert_eq!(completed, vec![original]);
        assert_eq!(reassembler.inflight(), 0);
    }

    #[test]
    fn incomplete_set_expires_and_late_chunks_are_ignored() {
        let config = small_config();
        let chunks = decode(&encode_outbound(&large_message(2000), &config).expect("encode"));
        let (last, rest) = chunks.split_last().expect("several chunks");

        let mut reassembler = Reassembler::new(config);
        let start = Instant::now();
        for chunk in rest {
            let outcome = reassembler.ingest(chunk.clone(), start).expect("ingest");
            assert!(outcome.completed.is_none());
        }

        assert!(reassembler.expire(start + Duration::from_millis(500)).is_empty());
        let dropped = reassembler.expire(start + config.reassembly_timeout);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].reason, ExpiryReason::Timeout);
        assert_eq!(dropped[0].received + 1, dropped[0].total);

        let late = reassembler
            .ingest(last.clone(), start + Duration::from_secs(2))
            .expect("late chunk");
        assert!(late.completed.is_none());
        assert_eq!(reassembler.inflight(), 0);
    }

    #[test]
    fn last_chunk_after_timeout_never_completes() {
        let config = small_config();
        let chunks = decode(&encode_outbound(&large_message(2000), &config).expect("encode"));
        let (last, rest) = chunks.split_last().expect("several chunks");

        let mut reassembler = Reassembler::new(config);
        let start = Instant::now();
        for chunk in rest {
            reassembler.ingest(chunk.clone(), start).expect("ingest");
        }

        // no sweep in between: the late chunk itself must notice the deadline
        let outcome = reassembler
            .ingest(last.clone(), start + Duration::from_millis(1500))
            .expect("late chunk");
        assert!(outcome.completed.is_none());
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].reason, ExpiryReason::Timeout);
        assert_eq!(reassembler.inflight(), 0);

        let again = reassembler
            .ingest(last.clone(), start + Duration::from_millis(1600))
            .expect("repeat");
        assert!(again.completed.is_none());
        assert!(again.evicted.is_empty());
    }

    #[test]
    fn absurd_chunk_totals_are_rejected_before_buffering() {
        let mut reassembler = Reassembler::new(small_config());
        let mut chunk = TransportMessage::new(MessageType::Code, "mallory", Value::String("AAAA".into()));
        chunk.sequence = Some(ChunkSequence {
            index: 0,
            total: u32::MAX,
            message_id: "huge".into(),
        });
        let err = reassembler.ingest(chunk, Instant::now()).expect_err("total");
        assert_eq!(err, ChunkError::Malformed("chunk total exceeds reassembly limit"));
        assert_eq!(reassembler.inflight(), 0);
    }

    #[test]
    fn capacity_eviction_drops_oldest_set() {
        let config = ChunkConfig {
            max_inflight: 1,
            ..small_config()
        };
        let first = decode(&encode_outbound(&large_message(1000), &config).expect("encode"));
        let second = decode(&encode_outbound(&large_message(1000), &config).expect("encode"));

        let mut reassembler = Reassembler::new(config);
        let now = Instant::now();
        reassembler.ingest(first[0].clone(), now).expect("first");
        let outcome = reassembler
            .ingest(second[0].clone(), now + Duration::from_millis(1))
            .expect("second");
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].reason, ExpiryReason::Capacity);
        assert_eq!(
            outcome.evicted[0].message_id,
            first[0].sequence.as_ref().expect("seq").message_id
        );
    }

    #[test]
    fn malformed_chunks_are_rejected() {
        let mut reassembler = Reassembler::new(small_config());
        let mut chunk = TransportMessage::new(MessageType::Code, "editor", Value::String("AAAA".into()));
        chunk.sequence = Some(ChunkSequence {
            index: 2,
            total: 2,
            message_id: "m".into(),
        });
        let err = reassembler.ingest(chunk.clone(), Instant::now()).expect_err("index");
        assert_eq!(err, ChunkError::Malformed("chunk index exceeds total"));

        chunk.sequence = Some(ChunkSequence {
            index: 0,
            total: 2,
            message_id: "m".into(),
        });
        chunk.payload = serde_json::json!({"not": "a fragment"});
        let err = reassembler.ingest(chunk, Instant::now()).expect_err("payload");
        assert_eq!(err, ChunkError::Malformed("chunk payload must be a string fragment"));
    }

    #[test]
    fn payloads_beyond_reassembly_limit_are_refused() {
        let config = ChunkConfig {
            max_reassembled_bytes: 1024,
            ..small_config()
        };
        let err = encode_outbound(&large_message(4096), &config).expect_err("too large");
        assert!(matches!(err, ChunkError::MessageTooLarge(_)));
    }
}
