//! The skipstream-LTS layout: the production storage scheme. See `key.rs`
//! for the key schema and `record.rs` for the data-stream value format;
//! this module is the write path (§4.2 "write path"), the read path's
//! multi-cursor skip algorithm (§4.2 "read path"), and the deletion path.

use super::key;
use super::record;
use crate::layout::{DeleteOutcome, MessageKey, NextOutcome, PreparedBatch, Stream, StreamIterator, StorageLayout};
use crate::message::{Message, OpBatch, Operation, PreconditionKind};
use crate::opts::StorageOpts;
use crate::Error;
use ds_kv::{Batch, CommitOpts, KvBackend};
use ds_lts::{FilterSegment, Lts, Segment, StaticKey, TrieOp, VaryingSlot};
use std::sync::Mutex;

fn data_cf(gen_id: u64) -> String {
    format!("data_{gen_id}")
}

fn trie_cf(gen_id: u64) -> String {
    format!("trie_{gen_id}")
}

pub fn cf_names(gen_id: u64) -> Vec<String> {
    vec![data_cf(gen_id), trie_cf(gen_id)]
}

/// One scanned candidate: its data key, the reconstructed message, and its
/// full varying-token tuple (needed by deletion to remove every index
/// level, not just the ones the requesting filter happened to pin).
struct Candidate {
    key: MessageKey,
    message: Message,
    varying: Vec<String>,
}

enum StopReason {
    BatchFull,
    Exhausted,
}

pub struct SkipstreamLts {
    gen_id: u64,
    opts: StorageOpts,
    lts: Lts,
    // Guards interleaving of prepare_batch calls against the same trie;
    // the shard buffer already serializes writers to one ingest task per
    // shard (§5), so this is belt-and-suspenders rather than a hot lock.
    write_lock: Mutex<()>,
}

impl SkipstreamLts {
    /// Create a fresh generation. If `inherit_trie` carries a predecessor's
    /// dump, it is bulk-loaded into this generation's trie CF and used to
    /// seed the in-memory trie, so every shape the predecessor had learned
    /// is available to this generation from its first write.
    pub fn create(
        kv: &KvBackend,
        gen_id: u64,
        opts: StorageOpts,
        inherit_trie: Option<Vec<(Vec<u8>, Vec<u8>)>>,
    ) -> Result<Self, Error> {
        kv.create_cf(&data_cf(gen_id))?;
        kv.create_cf(&trie_cf(gen_id))?;

        let lts = match inherit_trie {
            Some(pairs) => {
                kv.bulk_load(&trie_cf(gen_id), pairs.clone())?;
                Lts::restore(opts.static_key_width, pairs)?
            }
            None => Lts::new(opts.static_key_width)?,
        };

        Ok(Self {
            gen_id,
            opts,
            lts,
            write_lock: Mutex::new(()),
        })
    }

    /// Reopen an existing generation: rebuild the in-memory trie from its
    /// persisted column family.
    pub fn open(kv: &KvBackend, gen_id: u64, opts: StorageOpts) -> Result<Self, Error> {
        let pairs = kv.scan_all(&trie_cf(gen_id))?;
        Ok(Self {
            gen_id,
            opts,
            lts: Lts::restore(opts.static_key_width, pairs)?,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self) -> String {
        data_cf(self.gen_id)
    }

    fn trie_cf(&self) -> String {
        trie_cf(self.gen_id)
    }

    fn varying_slots_for(&self, static_key: &StaticKey, filter: &[FilterSegment]) -> Result<(Vec<Segment>, Vec<VaryingSlot>), Error> {
        let template = self.lts.reverse_lookup(static_key).ok_or(Error::NoMatchingShape)?;
        let varying_slots = ds_lts::align_filter(&template, filter).ok_or(Error::NoMatchingShape)?;
        Ok((template, varying_slots))
    }

    /// Check whether a message satisfying `matcher` is currently stored,
    /// honouring exact-payload matchers. Read-only; used by both
    /// precondition checks and the delete path.
    fn lookup_by_matcher(&self, kv: &KvBackend, topic: &[String], timestamp: u64) -> Result<Option<Candidate>, Error> {
        let Some((static_key, _)) = self.lts.lookup_topic_key(topic) else {
            return Ok(None);
        };
        let dk = key::data_key(&static_key, timestamp);
        let Some(value) = kv.get(&self.cf(), &dk)? else {
            return Ok(None);
        };
        let decoded = record::decode(&dk, &value)?;
        let template = self.lts.reverse_lookup(&static_key).ok_or(Error::NoMatchingShape)?;
        let varying = decoded.varying.clone();
        let message = record::to_message(decoded, &template, timestamp)?;
        Ok(Some(Candidate { key: dk, message, varying }))
    }

    /// The multi-level skip scan described in §4.2's read path. Shared by
    /// `next` and `delete_next`.
    fn scan(
        &self,
        kv: &KvBackend,
        static_key: &StaticKey,
        template: &[Segment],
        varying_slots: &[VaryingSlot],
        start_ts: u64,
        t_max: u64,
        batch_size: usize,
    ) -> Result<(Vec<Candidate>, u64, StopReason), Error> {
        let mut concrete: Vec<(u16, Vec<u8>, ds_kv::CfIterator<'_>)> = Vec::new();
        for (i, slot) in varying_slots.iter().enumerate() {
            if let VaryingSlot::Concrete(tok) = slot {
                let level = (i + 1) as u16;
                let hash = key::hash_token(tok, self.opts.hash_width);
                let range = key::index_range(static_key, level, &hash);
                let cur = kv.iter(&self.cf(), range)?;
                concrete.push((level, hash, cur));
            }
        }
        let mut data_cursor = kv.iter(&self.cf(), key::data_range(static_key))?;

        let mut seek_ts = start_ts;
        let mut out = Vec::new();

        loop {
            if out.len() >= batch_size {
                return Ok((out, seek_ts, StopReason::BatchFull));
            }
            if seek_ts > t_max {
                return Ok((out, seek_ts, StopReason::Exhausted));
            }

            data_cursor.seek(&key::data_key(static_key, seek_ts));
            if !data_cursor.valid() {
                return Ok((out, seek_ts, StopReason::Exhausted));
            }
            let data_ts = key::timestamp_of(data_cursor.key().unwrap())
                .ok_or_else(|| Error::CorruptRecord(data_cursor.key().unwrap().to_vec()))?;
            let mut max_ts = data_ts;

            let mut cursor_ts = Vec::with_capacity(concrete.len());
            let mut any_exhausted = false;
            for (level, hash, cur) in concrete.iter_mut() {
                cur.seek(&key::index_key(static_key, *level, hash, seek_ts));
                if !cur.valid() {
                    any_exhausted = true;
                    break;
                }
                let ts = key::timestamp_of(cur.key().unwrap())
                    .ok_or_else(|| Error::CorruptRecord(cur.key().unwrap().to_vec()))?;
                cursor_ts.push(ts);
                max_ts = max_ts.max(ts);
            }
            if any_exhausted {
                return Ok((out, seek_ts, StopReason::Exhausted));
            }

            if max_ts > t_max {
                return Ok((out, seek_ts, StopReason::Exhausted));
            }

            let all_equal = data_ts == max_ts && cursor_ts.iter().all(|&t| t == max_ts);
            if !all_equal {
                // One cursor is ahead of the rest: the skip. All others
                // catch up to its timestamp next iteration.
                seek_ts = max_ts;
                continue;
            }

            let raw_key = data_cursor.key().unwrap().to_vec();
            let raw_value = data_cursor.value().unwrap().to_vec();
            let decoded = record::decode(&raw_key, &raw_value)?;

            let collision = varying_slots.iter().enumerate().any(|(i, slot)| {
                matches!(slot, VaryingSlot::Concrete(expected) if decoded.varying.get(i) != Some(expected))
            });

            if collision {
                // Same timestamp, different token: two topics of this shape
                // happened to hash to the same bucket at this level. Reject
                // and move past this timestamp.
                seek_ts = key::inc_ts(max_ts);
                if seek_ts == 0 {
                    return Ok((out, seek_ts, StopReason::Exhausted));
                }
                continue;
            }

            let varying = decoded.varying.clone();
            let message = record::to_message(decoded, template, max_ts)?;
            out.push(Candidate { key: raw_key, message, varying });

            let next_seek = key::inc_ts(max_ts);
            if next_seek == 0 {
                return Ok((out, next_seek, StopReason::Exhausted));
            }
            seek_ts = next_seek;
        }
    }
}

impl StorageLayout for SkipstreamLts {
    fn schema_name(&self) -> &'static str {
        "skipstream-lts"
    }

    fn supports_preconditions(&self) -> bool {
        true
    }

    fn drop_layout(&self, kv: &KvBackend) -> Result<(), Error> {
        kv.drop_cf(&self.cf())?;
        kv.drop_cf(&self.trie_cf())?;
        Ok(())
    }

    fn prepare_batch(&self, kv: &KvBackend, batch: &OpBatch) -> Result<PreparedBatch, Error> {
        let _guard = self.write_lock.lock().unwrap();

        for pre in &batch.preconditions {
            let existing = self.lookup_by_matcher(kv, &pre.matcher.topic, pre.matcher.timestamp)?;
            let satisfied = match (&pre.matcher.payload, &existing) {
                (crate::message::PayloadMatch::Any, Some(_)) => true,
                (crate::message::PayloadMatch::Exact(p), Some(c)) => &c.message.payload == p,
                (_, None) => false,
            };
            let holds = match pre.kind {
                PreconditionKind::IfExists => satisfied,
                PreconditionKind::UnlessExists => !satisfied,
            };
            if !holds {
                return Err(Error::PreconditionFailed {
                    kind: pre.kind,
                    topic: pre.matcher.topic.clone(),
                    timestamp: pre.matcher.timestamp,
                });
            }
        }

        let mut kv_batch = Batch::new();
        for op in &batch.ops {
            match op {
                Operation::Store(msg) => {
                    let (static_key, varying, persist_ops) = self.lts.topic_key(&msg.topic);
                    for trie_op in persist_ops {
                        match trie_op {
                            TrieOp::Put(k, v) => kv_batch.put(&self.trie_cf(), k, v),
                            TrieOp::Delete(k) => kv_batch.delete(&self.trie_cf(), k),
                        }
                    }
                    let dk = key::data_key(&static_key, msg.timestamp);
                    let value = record::encode(&msg.from, &varying, &msg.payload, msg.id);
                    kv_batch.put(&self.cf(), dk, value);

                    for (i, tok) in varying.iter().enumerate() {
                        let level = (i + 1) as u16;
                        let hash = key::hash_token(tok, self.opts.hash_width);
                        kv_batch.put(&self.cf(), key::index_key(&static_key, level, &hash, msg.timestamp), Vec::new());
                    }
                }
                Operation::Delete(matcher) => {
                    if let Some(candidate) = self.lookup_by_matcher(kv, &matcher.topic, matcher.timestamp)? {
                        if matcher.matches(&candidate.message) {
                            let Some((static_key, _)) = self.lts.lookup_topic_key(&matcher.topic) else {
                                continue;
                            };
                            kv_batch.delete(&self.cf(), candidate.key.clone());
                            for (i, tok) in candidate.varying.iter().enumerate() {
                                let level = (i + 1) as u16;
                                let hash = key::hash_token(tok, self.opts.hash_width);
                                kv_batch.delete(&self.cf(), key::index_key(&static_key, level, &hash, matcher.timestamp));
                            }
                        }
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

    fn get_streams(&self, filter: &[FilterSegment]) -> Vec<Stream> {
        let mut keys: Vec<StaticKey> = self
            .lts
            .match_topics(filter)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        keys.dedup();
        keys.into_iter().map(|static_key| Stream::Skipstream { static_key }).collect()
    }

    fn make_iterator(&self, stream: &Stream, filter: &[FilterSegment], start_time: u64) -> Result<StreamIterator, Error> {
        let Stream::Skipstream { static_key } = stream else {
            return Err(Error::NoMatchingShape);
        };
        // Validate the filter aligns with this shape before committing to
        // an iterator over it.
        self.varying_slots_for(static_key, filter)?;
        Ok(StreamIterator::Skipstream {
            static_key: static_key.clone(),
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
        let StreamIterator::Skipstream { static_key, filter, next_ts } = iter else {
            return Err(Error::NoMatchingShape);
        };
        let (template, varying_slots) = self.varying_slots_for(&static_key, &filter)?;

        let t_max = t_max.saturating_sub(self.opts.safety_margin_us);
        let (found, new_ts, stop) = self.scan(kv, &static_key, &template, &varying_slots, next_ts, t_max, batch_size)?;

        let messages: Vec<(MessageKey, Message)> = found.into_iter().map(|c| (c.key, c.message)).collect();

        if messages.is_empty() {
            if matches!(stop, StopReason::Exhausted) && generation_closed {
                return Ok(NextOutcome::EndOfStream);
            }
        }

        Ok(NextOutcome::Messages {
            iter: StreamIterator::Skipstream { static_key, filter, next_ts: new_ts },
            messages,
        })
    }

    fn update_iterator(&self, _kv: &KvBackend, iter: StreamIterator, message_key: &[u8]) -> Result<StreamIterator, Error> {
        let StreamIterator::Skipstream { static_key, filter, .. } = iter else {
            return Err(Error::UnknownMessageKey(message_key.to_vec()));
        };
        if !message_key.starts_with(static_key.as_bytes()) {
            return Err(Error::IteratorShapeMismatch(static_key));
        }
        let ts = key::timestamp_of(message_key).ok_or_else(|| Error::UnknownMessageKey(message_key.to_vec()))?;
        Ok(StreamIterator::Skipstream { static_key, filter, next_ts: ts })
    }

    fn lookup_message(&self, kv: &KvBackend, message_key: &[u8]) -> Result<Option<Message>, Error> {
        if message_key.len() < self.opts.static_key_width + 2 + 8 {
            return Err(Error::UnknownMessageKey(message_key.to_vec()));
        }
        let static_key = StaticKey::from_bytes(message_key[..self.opts.static_key_width].to_vec().into_boxed_slice());
        let Some(value) = kv.get(&self.cf(), message_key)? else {
            return Ok(None);
        };
        let decoded = record::decode(message_key, &value)?;
        let template = self.lts.reverse_lookup(&static_key).ok_or_else(|| Error::UnknownMessageKey(message_key.to_vec()))?;
        let ts = key::timestamp_of(message_key).ok_or_else(|| Error::UnknownMessageKey(message_key.to_vec()))?;
        Ok(Some(record::to_message(decoded, &template, ts)?))
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
        let StreamIterator::Skipstream { static_key, filter, next_ts } = iter else {
            return Err(Error::NoMatchingShape);
        };
        let (template, varying_slots) = self.varying_slots_for(&static_key, &filter)?;
        let (found, new_ts, stop) = self.scan(kv, &static_key, &template, &varying_slots, next_ts, t_max, batch_size)?;

        let mut kv_batch = Batch::new();
        let mut deleted = 0;
        for candidate in &found {
            if selector(&candidate.message) {
                kv_batch.delete(&self.cf(), candidate.key.clone());
                for (i, tok) in candidate.varying.iter().enumerate() {
                    let level = (i + 1) as u16;
                    let hash = key::hash_token(tok, self.opts.hash_width);
                    kv_batch.delete(&self.cf(), key::index_key(&static_key, level, &hash, candidate.message.timestamp));
                }
                deleted += 1;
            }
        }
        if !kv_batch.is_empty() {
            kv.commit(kv_batch, commit_opts)?;
        }

        if found.is_empty() && matches!(stop, StopReason::Exhausted) && generation_closed {
            return Ok(DeleteOutcome::EndOfStream);
        }

        Ok(DeleteOutcome::Deleted {
            iter: StreamIterator::Skipstream { static_key, filter, next_ts: new_ts },
            deleted,
        })
    }

    fn trie_dump(&self) -> Option<Vec<(Vec<u8>, Vec<u8>)>> {
        Some(self.lts.dump())
    }
}
