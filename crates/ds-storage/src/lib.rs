//! Pluggable storage layouts for the DS storage engine: the `StorageLayout`
//! trait (§4), the reference layout (§4.3, a full scan used to cross-check
//! correctness), and the skipstream-LTS layout (§4.2, the production
//! multi-level indexed scheme built on `ds-lts`).

mod codec;
mod error;
mod factory;
mod layout;
mod message;
mod opts;
mod reference;
mod skipstream;

pub use error::Error;
pub use factory::{cf_names, create_layout, open_layout, GenId, LayoutKind};
pub use ds_lts::{parse_filter, parse_topic, FilterSegment};
pub use layout::{DeleteOutcome, MessageKey, NextOutcome, PreparedBatch, Stream, StreamIterator, StorageLayout};
pub use message::{Matcher, Message, MessageId, OpBatch, Operation, PayloadMatch, Precondition, PreconditionKind};
pub use opts::StorageOpts;
pub use reference::ReferenceLayout;
pub use skipstream::SkipstreamLts;

#[cfg(test)]
mod test {
    use super::*;
    use ds_kv::{CommitOpts, KvBackend};
    use ds_lts::parse_filter;
    use quickcheck_macros::quickcheck;

    /// For arbitrary interleavings of topic/timestamp, every stream a
    /// filter resolves to replays in non-decreasing timestamp order. Exercised
    /// against both layouts since the skipstream read path's multi-cursor skip
    /// is exactly the part a random interleaving is most likely to upset.
    #[quickcheck]
    fn prop_replay_is_non_decreasing_in_timestamp(ops: Vec<(u8, u16)>) -> bool {
        for kind in [LayoutKind::Reference, LayoutKind::SkipstreamLts] {
            let dir = tempfile::TempDir::new().unwrap();
            let cfs = cf_names(kind, 1);
            let kv = KvBackend::open(dir.path(), &cfs).unwrap();
            let layout = create_layout(kind, &kv, 1, StorageOpts::default(), None).unwrap();

            let mut batch = OpBatch::new();
            for (i, (topic_choice, ts)) in ops.iter().enumerate() {
                let topic = format!("t/{}", topic_choice % 4);
                batch = batch.store(Message {
                    id: None,
                    from: "q".to_string(),
                    topic: ds_lts::parse_topic(&topic),
                    timestamp: *ts as u64,
                    payload: vec![i as u8],
                });
            }
            let prepared = layout.prepare_batch(&kv, &batch).unwrap();
            layout.commit_batch(&kv, prepared, CommitOpts::default()).unwrap();

            for stream in layout.get_streams(&parse_filter("t/#")) {
                let mut iter = layout.make_iterator(&stream, &parse_filter("t/#"), 0).unwrap();
                let mut last = 0u64;
                loop {
                    match layout.next(&kv, iter, u64::MAX, 50, true).unwrap() {
                        NextOutcome::EndOfStream => break,
                        NextOutcome::Messages { iter: next_iter, messages } => {
                            if messages.is_empty() {
                                break;
                            }
                            for (_, m) in &messages {
                                if m.timestamp < last {
                                    return false;
                                }
                                last = m.timestamp;
                            }
                            iter = next_iter;
                        }
                    }
                }
            }
        }
        true
    }

    fn build(kind: LayoutKind) -> (tempfile::TempDir, KvBackend, Box<dyn StorageLayout>) {
        let dir = tempfile::TempDir::new().unwrap();
        let cfs = cf_names(kind, 1);
        let kv = KvBackend::open(dir.path(), &cfs).unwrap();
        let layout = create_layout(kind, &kv, 1, StorageOpts::default(), None).unwrap();
        (dir, kv, layout)
    }

    fn msg(topic: &str, ts: u64, payload: &str) -> Message {
        Message {
            id: None,
            from: "tester".to_string(),
            topic: ds_lts::parse_topic(topic),
            timestamp: ts,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn drain_all(kv: &KvBackend, layout: &dyn StorageLayout, stream: &Stream, filter_str: &str) -> Vec<(u64, String, String)> {
        let filter = parse_filter(filter_str);
        let mut iter = layout.make_iterator(stream, &filter, 0).unwrap();
        let mut out = Vec::new();
        loop {
            match layout.next(kv, iter, u64::MAX, 100, true).unwrap() {
                NextOutcome::EndOfStream => break,
                NextOutcome::Messages { iter: next_iter, messages } => {
                    if messages.is_empty() {
                        break;
                    }
                    for (_, m) in messages {
                        out.push((m.timestamp, m.topic_string(), String::from_utf8(m.payload).unwrap()));
                    }
                    iter = next_iter;
                }
            }
        }
        out
    }

    /// Two topics sharing a two-level prefix, ten messages each. The
    /// skipstream-LTS layout indexes by learned shape, so `+/+` collapses
    /// both into the shape `foo/bar` and `foo/#` sees two distinct shapes,
    /// each replaying in ascending timestamp order. The reference layout
    /// has no notion of shape at all (§4.3: one stream for any filter), so
    /// it always returns a single stream covering everything the filter
    /// matches, interleaved.
    #[test]
    fn test_scenario_two_topics_two_streams_both_layouts() {
        for kind in [LayoutKind::Reference, LayoutKind::SkipstreamLts] {
            let (_dir, kv, layout) = build(kind);

            let mut batch = OpBatch::new();
            for i in 1..=10u64 {
                batch = batch.store(msg("foo/bar", i, &format!("bar-{i}")));
                batch = batch.store(msg("foo/bar/baz", i, &format!("baz-{i}")));
            }
            let prepared = layout.prepare_batch(&kv, &batch).unwrap();
            layout.commit_batch(&kv, prepared, CommitOpts::default()).unwrap();

            let plus_plus = layout.get_streams(&parse_filter("+/+"));
            assert_eq!(plus_plus.len(), 1, "{kind:?}");

            let foo_hash = layout.get_streams(&parse_filter("foo/#"));
            let expected_streams = match kind {
                LayoutKind::Reference => 1,
                LayoutKind::SkipstreamLts => 2,
            };
            assert_eq!(foo_hash.len(), expected_streams, "{kind:?}");

            let expected_len_per_stream = match kind {
                LayoutKind::Reference => 20,
                LayoutKind::SkipstreamLts => 10,
            };
            for stream in &foo_hash {
                let msgs = drain_all(&kv, layout.as_ref(), stream, "foo/#");
                assert_eq!(msgs.len(), expected_len_per_stream, "{kind:?}");
                let timestamps: Vec<u64> = msgs.iter().map(|(ts, _, _)| *ts).collect();
                let mut sorted = timestamps.clone();
                sorted.sort();
                assert_eq!(timestamps, sorted, "{kind:?}: must replay in ascending timestamp order");
            }
        }
    }

    /// A store-then-delete sequence where only the first message survives.
    #[test]
    fn test_scenario_store_then_delete_both_layouts() {
        for kind in [LayoutKind::Reference, LayoutKind::SkipstreamLts] {
            let (_dir, kv, layout) = build(kind);

            let batch = OpBatch::new()
                .store(msg("t/1", 100, "M1"))
                .store(msg("t/2", 200, "M2"))
                .store(msg("t/3", 300, "M3"));
            let prepared = layout.prepare_batch(&kv, &batch).unwrap();
            layout.commit_batch(&kv, prepared, CommitOpts::default()).unwrap();

            let del = OpBatch::new()
                .delete(Matcher {
                    topic: ds_lts::parse_topic("t/2"),
                    timestamp: 200,
                    payload: PayloadMatch::Exact(b"M2".to_vec()),
                })
                .delete(Matcher {
                    topic: ds_lts::parse_topic("t/3"),
                    timestamp: 300,
                    payload: PayloadMatch::Any,
                })
                .delete(Matcher {
                    topic: ds_lts::parse_topic("t/4"),
                    timestamp: 400,
                    payload: PayloadMatch::Any,
                });
            let prepared = layout.prepare_batch(&kv, &del).unwrap();
            layout.commit_batch(&kv, prepared, CommitOpts::default()).unwrap();

            let streams = layout.get_streams(&parse_filter("t/#"));
            let mut all = Vec::new();
            for s in &streams {
                all.extend(drain_all(&kv, layout.as_ref(), s, "t/#"));
            }
            assert_eq!(all, vec![(100, "t/1".to_string(), "M1".to_string())], "{kind:?}");
        }
    }

    #[test]
    fn test_scenario_trie_inherited_across_generation_skipstream() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfs = cf_names(LayoutKind::SkipstreamLts, 1);
        cfs.extend(cf_names(LayoutKind::SkipstreamLts, 2));
        let kv = KvBackend::open(dir.path(), &cfs).unwrap();

        let gen1 = create_layout(LayoutKind::SkipstreamLts, &kv, 1, StorageOpts::default(), None).unwrap();
        let mut batch = OpBatch::new();
        for i in 1..=200u64 {
            batch = batch.store(msg(&format!("wildcard/{i}/suffix/foo"), 100, "x"));
            batch = batch.store(msg(&format!("wildcard/{i}/suffix/bar"), 100, "y"));
        }
        let prepared = gen1.prepare_batch(&kv, &batch).unwrap();
        gen1.commit_batch(&kv, prepared, CommitOpts::default()).unwrap();

        let dumped = gen1.trie_dump().unwrap();
        let gen2 = create_layout(LayoutKind::SkipstreamLts, &kv, 2, StorageOpts::default(), Some(dumped)).unwrap();

        // Before gen2 has seen any write of its own, it already knows both
        // learned shapes: inheritance is monotone.
        let streams = gen2.get_streams(&parse_filter("wildcard/#"));
        assert_eq!(streams.len(), 2);
    }

    #[test]
    fn test_next_on_open_generation_is_empty_not_end_of_stream_both_layouts() {
        for kind in [LayoutKind::Reference, LayoutKind::SkipstreamLts] {
            let (_dir, kv, layout) = build(kind);
            let batch = OpBatch::new().store(msg("foo/bar", 50, "only"));
            let prepared = layout.prepare_batch(&kv, &batch).unwrap();
            layout.commit_batch(&kv, prepared, CommitOpts::default()).unwrap();

            let streams = layout.get_streams(&parse_filter("foo/bar"));
            assert_eq!(streams.len(), 1, "{kind:?}");
            let iter = layout.make_iterator(&streams[0], &parse_filter("foo/bar"), 0).unwrap();
            let NextOutcome::Messages { iter, messages } = layout.next(&kv, iter, 1_000, 10, false).unwrap() else {
                panic!("{kind:?}: current generation must not report end_of_stream");
            };
            assert_eq!(messages.len(), 1, "{kind:?}");

            match layout.next(&kv, iter, 1_000, 10, false).unwrap() {
                NextOutcome::Messages { messages, .. } => assert!(messages.is_empty(), "{kind:?}"),
                NextOutcome::EndOfStream => panic!("{kind:?}: open generation must not end_of_stream on empty read"),
            }
        }
    }

    #[test]
    fn test_skipstream_precondition_supported_reference_refuses() {
        let (_dir, kv_ref, ref_layout) = build(LayoutKind::Reference);
        let batch = OpBatch::new().store(msg("a/b", 1, "x")).require(Precondition {
            matcher: Matcher {
                topic: ds_lts::parse_topic("a/b"),
                timestamp: 1,
                payload: PayloadMatch::Any,
            },
            kind: PreconditionKind::UnlessExists,
        });
        assert!(ref_layout.prepare_batch(&kv_ref, &batch).is_err());

        let (_dir, kv_ss, ss_layout) = build(LayoutKind::SkipstreamLts);
        let prepared = ss_layout.prepare_batch(&kv_ss, &batch).unwrap();
        ss_layout.commit_batch(&kv_ss, prepared, CommitOpts::default()).unwrap();

        // A second `unless_exists` for the same (topic, ts) must now fail.
        let batch2 = OpBatch::new().store(msg("a/b", 1, "y")).require(Precondition {
            matcher: Matcher {
                topic: ds_lts::parse_topic("a/b"),
                timestamp: 1,
                payload: PayloadMatch::Any,
            },
            kind: PreconditionKind::UnlessExists,
        });
        assert!(ss_layout.prepare_batch(&kv_ss, &batch2).is_err());
    }
}
