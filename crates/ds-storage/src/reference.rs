//! The reference layout: one data column family, full scan, no indexing.
//! Exists to cross-check the skipstream-LTS layout and for integration
//! testing (§4.3) — not meant to be fast.

use crate::codec::{put_bytes, put_u128, put_u8, Reader};
use crate::layout::{DeleteOutcome, NextOutcome, PreparedBatch, Stream, StreamIterator, StorageLayout};
use crate::message::{Message, MessageId, OpBatch, Operation};
use crate::Error;
use ds_kv::{Batch, CommitOpts, KeyRange, KvBackend};
use ds_lts::FilterSegment;
use std::sync::atomic::{AtomicU32, Ordering};

pub fn cf_names(gen_id: u64) -> Vec<String> {
    vec![data_cf(gen_id)]
}

fn data_cf(gen_id: u64) -> String {
    format!("ref_data_{gen_id}")
}

/// `timestamp:64 ∥ seq:32`. A bare `timestamp:64` key would collide whenever
/// two messages are published at the same microsecond (legal unless
/// `force_monotonic_timestamps` is set), so a same-timestamp tiebreaker is
/// appended to give each its own key instead of one clobbering the other.
/// Iteration order is unaffected: the tiebreaker only ever distinguishes
/// keys that already share a timestamp.
fn key_for(ts: u64, seq: u32) -> Vec<u8> {
    let mut k = ts.to_be_bytes().to_vec();
    k.extend_from_slice(&seq.to_be_bytes());
    k
}

fn split_key(key: &[u8]) -> Option<u64> {
    if key.len() != 12 {
        return None;
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&key[..8]);
    Some(u64::from_be_bytes(ts))
}

fn ts_range(ts: u64) -> KeyRange {
    let lower = ts.to_be_bytes().to_vec();
    let upper = match ts.checked_add(1) {
        Some(next) => next.to_be_bytes().to_vec(),
        None => vec![0xffu8; 13],
    };
    KeyRange::new(lower, upper)
}

fn encode(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    match msg.id {
        Some(id) => {
            put_u8(&mut buf, 1);
            put_u128(&mut buf, id.as_u128());
        }
        None => put_u8(&mut buf, 0),
    }
    put_bytes(&mut buf, msg.from.as_bytes());
    put_bytes(&mut buf, &(msg.topic.len() as u32).to_be_bytes());
    for tok in &msg.topic {
        put_bytes(&mut buf, tok.as_bytes());
    }
    put_bytes(&mut buf, &msg.payload);
    buf
}

fn decode(key: &[u8], value: &[u8]) -> Result<Message, Error> {
    let ts = split_key(key).ok_or_else(|| Error::CorruptRecord(key.to_vec()))?;
    let mut r = Reader::new(value);
    let has_id = r.get_u8()?;
    let id = if has_id == 1 {
        Some(MessageId::from_u128(r.get_u128()?))
    } else {
        None
    };
    let from = r.get_string()?;
    let count_bytes = r.get_bytes()?;
    if count_bytes.len() != 4 {
        return Err(Error::CorruptRecord(key.to_vec()));
    }
    let count = u32::from_be_bytes([count_bytes[0], count_bytes[1], count_bytes[2], count_bytes[3]]);
    let mut topic = Vec::with_capacity(count as usize);
    for _ in 0..count {
        topic.push(r.get_string()?);
    }
    let payload = r.get_bytes()?.to_vec();
    Ok(Message {
        id,
        from,
        topic,
        timestamp: ts,
        payload,
    })
}

fn topic_matches_filter(topic: &[String], filter: &[FilterSegment]) -> bool {
    let mut ti = 0;
    for (fi, seg) in filter.iter().enumerate() {
        match seg {
            FilterSegment::Hash => return true,
            FilterSegment::Plus => {
                if ti >= topic.len() {
                    return false;
                }
                ti += 1;
            }
            FilterSegment::Literal(lit) => {
                if topic.get(ti) != Some(lit) {
                    return false;
                }
                ti += 1;
            }
        }
        let _ = fi;
    }
    ti == topic.len()
}

/// One data column family, keyed by timestamp (+tiebreaker). No LTS, no
/// index levels: `next` is a bounded forward scan with a predicate.
pub struct ReferenceLayout {
    gen_id: u64,
    seq: AtomicU32,
}

impl ReferenceLayout {
    pub fn create(kv: &KvBackend, gen_id: u64) -> Result<Self, Error> {
        kv.create_cf(&data_cf(gen_id))?;
        Ok(Self {
            gen_id,
            seq: AtomicU32::new(0),
        })
    }

    pub fn open(_kv: &KvBackend, gen_id: u64) -> Result<Self, Error> {
        Ok(Self {
            gen_id,
            seq: AtomicU32::new(0),
        })
    }

    fn cf(&self) -> String {
        data_cf(self.gen_id)
    }
}

impl StorageLayout for ReferenceLayout {
    fn schema_name(&self) -> &'static str {
        "reference"
    }

    fn supports_preconditions(&self) -> bool {
        false
    }

    fn drop_layout(&self, kv: &KvBackend) -> Result<(), Error> {
        kv.drop_cf(&self.cf())?;
        Ok(())
    }

    fn prepare_batch(&self, kv: &KvBackend, batch: &OpBatch) -> Result<PreparedBatch, Error> {
        if !batch.preconditions.is_empty() {
            return Err(Error::PreconditionsUnsupported("reference"));
        }

        let mut kv_batch = Batch::new();
        for op in &batch.ops {
            match op {
                Operation::Store(msg) => {
                    let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                    kv_batch.put(&self.cf(), key_for(msg.timestamp, seq), encode(msg));
                }
                Operation::Delete(matcher) => {
                    let range = ts_range(matcher.timestamp);
                    let mut it = kv.iter(&self.cf(), range)?;
                    it.seek_to_first();
                    while it.valid() {
                        let (k, v) = (it.key().unwrap().to_vec(), it.value().unwrap().to_vec());
                        let msg = decode(&k, &v)?;
                        if matcher.matches(&msg) {
                            kv_batch.delete(&self.cf(), k);
                        }
                        it.advance();
                    }
                }
            }
        }
        Ok(PreparedBatch { kv_batch })
    }

    fn commit_batch(&self, kv: &KvBackend, prepared: PreparedBatch, commit_opts: CommitOpts) -> Result<(), Error> {
        kv.commit(prepared.kv_batch, commit_opts)?;
        Ok(())
    }

    fn get_streams(&self, _filter: &[FilterSegment]) -> Vec<Stream> {
        vec![Stream::Reference]
    }

    fn make_iterator(&self, stream: &Stream, filter: &[FilterSegment], start_time: u64) -> Result<StreamIterator, Error> {
        debug_assert!(matches!(stream, Stream::Reference));
        Ok(StreamIterator::Reference {
            filter: filter.to_vec(),
            next_ts: start_time,
        })
    }

    fn next(
        &self,
        kv: &KvBackend,
        iter: StreamIterator,
        t_max: u64,
        batch_size: usize,
        generation_closed: bool,
    ) -> Result<NextOutcome, Error> {
        let StreamIterator::Reference { filter, next_ts } = iter else {
            return Err(Error::IteratorShapeMismatch(ds_lts::StaticKey::from_bytes(vec![].into_boxed_slice())));
        };

        if next_ts > t_max {
            return Ok(if generation_closed {
                NextOutcome::EndOfStream
            } else {
                NextOutcome::Messages {
                    iter: StreamIterator::Reference { filter, next_ts },
                    messages: Vec::new(),
                }
            });
        }

        let range = KeyRange::new(next_ts.to_be_bytes().to_vec(), vec![0xffu8; 13]);
        let mut it = kv.iter(&self.cf(), range)?;
        it.seek(&next_ts.to_be_bytes());

        let mut messages = Vec::new();
        let mut last_ts = next_ts;
        while it.valid() && messages.len() < batch_size {
            let key = it.key().unwrap().to_vec();
            let ts = split_key(&key).ok_or_else(|| Error::CorruptRecord(key.clone()))?;
            if ts > t_max {
                break;
            }
            let value = it.value().unwrap().to_vec();
            let msg = decode(&key, &value)?;
            last_ts = ts;
            if topic_matches_filter(&msg.topic, &filter) {
                messages.push((key, msg));
            }
            it.advance();
        }

        let reached_end = !it.valid() || it.key().map(|k| split_key(k).map(|t| t > t_max).unwrap_or(true)).unwrap_or(true);
        let next_ts = if reached_end {
            last_ts.saturating_add(1).max(next_ts)
        } else {
            last_ts.saturating_add(1)
        };

        if reached_end && generation_closed && messages.is_empty() {
            return Ok(NextOutcome::EndOfStream);
        }

        Ok(NextOutcome::Messages {
            iter: StreamIterator::Reference { filter, next_ts },
            messages,
        })
    }

    fn update_iterator(&self, _kv: &KvBackend, iter: StreamIterator, message_key: &[u8]) -> Result<StreamIterator, Error> {
        let StreamIterator::Reference { filter, .. } = iter else {
            return Err(Error::UnknownMessageKey(message_key.to_vec()));
        };
        let ts = split_key(message_key).ok_or_else(|| Error::UnknownMessageKey(message_key.to_vec()))?;
        Ok(StreamIterator::Reference { filter, next_ts: ts })
    }

    fn lookup_message(&self, kv: &KvBackend, message_key: &[u8]) -> Result<Option<Message>, Error> {
        match kv.get(&self.cf(), message_key)? {
            Some(v) => Ok(Some(decode(message_key, &v)?)),
            None => Ok(None),
        }
    }

    fn delete_next(
        &self,
        kv: &KvBackend,
        iter: StreamIterator,
        selector: &dyn Fn(&Message) -> bool,
        t_max: u64,
        batch_size: usize,
        generation_closed: bool,
        commit_opts: CommitOpts,
    ) -> Result<DeleteOutcome, Error> {
        match self.next(kv, iter, t_max, batch_size, generation_closed)? {
            NextOutcome::EndOfStream => Ok(DeleteOutcome::EndOfStream),
            NextOutcome::Messages { iter, messages } => {
                let mut kv_batch = Batch::new();
                let mut deleted = 0;
                for (key, msg) in &messages {
                    if selector(msg) {
                        kv_batch.delete(&self.cf(), key.clone());
                        deleted += 1;
                    }
                }
                if !kv_batch.is_empty() {
                    kv.commit(kv_batch, commit_opts)?;
                }
                Ok(DeleteOutcome::Deleted { iter, deleted })
            }
        }
    }
}
