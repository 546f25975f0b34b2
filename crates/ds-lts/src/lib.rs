//! The Learned Topic Structure (LTS): a trie over MQTT topic tokens that
//! compresses frequently-seen topic prefixes into fixed-width static keys,
//! leaving high-cardinality levels as wildcards.

mod model;
mod trie;

pub use model::{
    align_filter, compress_topic, decompress_topic, parse_filter, parse_topic, FilterSegment,
    Segment, StaticKey, VaryingSlot,
};
pub use trie::{Error, Lts, TrieOp};

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    /// `decompress(structure, compress(static, structure, f)) == f` for any
    /// topic compatible with the shape it produces. Arbitrary token
    /// lists stand in for "compatible" topics since `topic_key` learns
    /// whatever shape a topic implies rather than rejecting one.
    #[quickcheck]
    fn prop_topic_round_trips_through_its_own_learned_shape(tokens: Vec<String>) -> TestResult {
        if tokens.is_empty() || tokens.iter().any(|t| t.is_empty() || t.contains('/')) {
            return TestResult::discard();
        }
        let lts = Lts::new(8).unwrap();
        let (static_key, varying, _) = lts.topic_key(&tokens);
        let template = lts.reverse_lookup(&static_key).unwrap();
        let rebuilt = decompress_topic(&template, &varying).unwrap();
        TestResult::from_bool(rebuilt == tokens)
    }

    #[test]
    fn test_shared_prefix_collapses_to_one_shape() {
        let lts = Lts::new(8).unwrap();

        let (k1, v1, _) = lts.topic_key(&parse_topic("foo/bar"));
        let (k2, v2, _) = lts.topic_key(&parse_topic("foo/bar"));
        assert_eq!(k1, k2);
        assert!(v1.is_empty());
        assert!(v2.is_empty());

        let (k3, _, _) = lts.topic_key(&parse_topic("foo/bar/baz"));
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_non_root_threshold_promotes_to_wildcard() {
        let lts = Lts::new(8).unwrap();

        // "wildcard/<i>/suffix" for i in 1..200: the middle level sees far
        // more than 10 distinct tokens, so it must be promoted to a single
        // wildcard edge. The first few insertions (below the non-root
        // threshold) still get their own literal child; once promotion
        // fires, every later insertion's token becomes varying and its
        // already-inserted siblings are merged into the same wildcard edge.
        for i in 1..200 {
            let (_, varying, _) = lts.topic_key(&parse_topic(&format!("wildcard/{i}/suffix")));
            if i > NON_ROOT_THRESHOLD_FOR_TEST {
                assert_eq!(varying, vec![i.to_string()]);
            }
        }

        // A fresh lookup pass (no further mutation) must now see every
        // i — including the pre-threshold ones — collapse to one shape.
        let mut shapes = std::collections::HashSet::new();
        for i in 1..200 {
            let (key, _) = lts.lookup_topic_key(&parse_topic(&format!("wildcard/{i}/suffix"))).unwrap();
            shapes.insert(key);
        }
        assert_eq!(shapes.len(), 1);
    }

    const NON_ROOT_THRESHOLD_FOR_TEST: i32 = 10;

    #[test]
    fn test_root_threshold_is_looser_than_non_root() {
        let lts = Lts::new(8).unwrap();

        // 50 distinct first-level tokens: under the root's threshold of
        // 100, so every one gets its own literal child — none varying.
        let mut shapes = std::collections::HashSet::new();
        for i in 0..50 {
            let (key, varying, _) = lts.topic_key(&parse_topic(&format!("{i}/leaf")));
            assert!(varying.is_empty());
            shapes.insert(key);
        }
        assert_eq!(shapes.len(), 50);
    }

    #[test]
    fn test_reverse_lookup_round_trips_through_template() {
        let lts = Lts::new(8).unwrap();
        for i in 1..50 {
            lts.topic_key(&parse_topic(&format!("w/{i}/suffix")));
        }
        let (key, varying, _) = lts.topic_key(&parse_topic("w/999/suffix"));
        let template = lts.reverse_lookup(&key).unwrap();

        let full = decompress_topic(&template, &varying).unwrap();
        assert_eq!(full, parse_topic("w/999/suffix"));

        let recompressed = compress_topic(&template, &full).unwrap();
        assert_eq!(recompressed, varying);
    }

    #[test]
    fn test_match_topics_plus_and_hash() {
        let lts = Lts::new(8).unwrap();
        let (foo_bar, _, _) = lts.topic_key(&parse_topic("foo/bar"));
        let (foo_bar_baz, _, _) = lts.topic_key(&parse_topic("foo/bar/baz"));

        let plus_plus = lts.match_topics(&parse_filter("+/+"));
        assert_eq!(plus_plus.len(), 1);
        assert_eq!(plus_plus[0].0, foo_bar);

        let foo_hash = lts.match_topics(&parse_filter("foo/#"));
        let matched: std::collections::HashSet<_> = foo_hash.into_iter().map(|(k, _)| k).collect();
        assert_eq!(matched.len(), 2);
        assert!(matched.contains(&foo_bar));
        assert!(matched.contains(&foo_bar_baz));
    }

    #[test]
    fn test_lookup_topic_key_fails_closed_for_unknown_shape() {
        let lts = Lts::new(8).unwrap();
        lts.topic_key(&parse_topic("foo/bar"));

        // Root has no wildcard edge yet (well under its threshold), so an
        // unrecognised first-level token fails closed rather than learning
        // a new shape.
        assert!(lts.lookup_topic_key(&parse_topic("unseen/topic")).is_none());
        // Same for an unexplored deeper level beneath a known shape.
        assert!(lts.lookup_topic_key(&parse_topic("foo/bar/baz/qux")).is_none());
        // But a previously learned shape resolves.
        assert!(lts.lookup_topic_key(&parse_topic("foo/bar")).is_some());
    }

    #[test]
    fn test_dump_restore_round_trip_preserves_shapes() {
        let lts = Lts::new(8).unwrap();
        for i in 1..200 {
            lts.topic_key(&parse_topic(&format!("wildcard/{i}/suffix/foo")));
            lts.topic_key(&parse_topic(&format!("wildcard/{i}/suffix/bar")));
        }

        let dumped = lts.dump();
        let restored = Lts::restore(8, dumped).unwrap();

        let matched = restored.match_topics(&parse_filter("wildcard/#"));
        // Exactly two shapes: .../suffix/foo and .../suffix/bar, as in the
        // original trie, inherited wholesale.
        let shapes: std::collections::HashSet<_> = matched
            .into_iter()
            .filter(|(k, _)| restored.reverse_lookup(k).map(|t| t.len()) == Some(4))
            .map(|(k, _)| k)
            .collect();
        assert_eq!(shapes.len(), 2);

        let (restored_key, restored_varying) = restored
            .lookup_topic_key(&parse_topic("wildcard/42/suffix/foo"))
            .unwrap();
        let (original_key, original_varying) = lts
            .lookup_topic_key(&parse_topic("wildcard/42/suffix/foo"))
            .unwrap();
        assert_eq!(restored_key, original_key);
        assert_eq!(restored_varying, original_varying);
    }

    /// Human-readable fixture for a learned shape's template: easier to spot
    /// an unintended change to promotion behaviour in review than a bare
    /// `assert_eq!` against a `Vec<Segment>` literal would be.
    #[test]
    fn test_reverse_lookup_template_snapshot() {
        let lts = Lts::new(8).unwrap();
        for i in 1..200 {
            lts.topic_key(&parse_topic(&format!("wildcard/{i}/suffix/foo")));
        }
        let (static_key, _, _) = lts.topic_key(&parse_topic("wildcard/1/suffix/foo"));
        let template = lts.reverse_lookup(&static_key).unwrap();
        insta::assert_debug_snapshot!(template, @r###"
        [
            Literal(
                "wildcard",
            ),
            Wildcard,
            Literal(
                "suffix",
            ),
            Literal(
                "foo",
            ),
        ]
        "###);
    }

    #[test]
    fn test_align_filter_matches_match_topics() {
        let lts = Lts::new(8).unwrap();
        for i in 1..50 {
            lts.topic_key(&parse_topic(&format!("w/{i}/leaf")));
        }
        let (static_key, _, _) = lts.topic_key(&parse_topic("w/7/leaf"));
        let template = lts.reverse_lookup(&static_key).unwrap();

        let via_match = lts
            .match_topics(&parse_filter("w/+/leaf"))
            .into_iter()
            .find(|(k, _)| *k == static_key)
            .map(|(_, v)| v)
            .unwrap();
        let via_align = align_filter(&template, &parse_filter("w/+/leaf")).unwrap();
        assert_eq!(via_match, via_align);

        // A trailing '#' swallows the rest of the template as wildcards.
        let via_hash = align_filter(&template, &parse_filter("w/#")).unwrap();
        assert_eq!(via_hash, vec![VaryingSlot::Wildcard]);

        // A literal mismatch against the template fails closed.
        assert!(align_filter(&template, &parse_filter("nope/+/leaf")).is_none());
    }

    #[test]
    fn test_lookup_topic_key_with_wildcard_does_not_mutate() {
        let lts = Lts::new(8).unwrap();
        for i in 1..50 {
            lts.topic_key(&parse_topic(&format!("w/{i}/leaf")));
        }
        let dump_before = lts.dump().len();
        let found = lts.lookup_topic_key(&parse_topic("w/unseen-value/leaf"));
        assert!(found.is_some());
        assert_eq!(lts.dump().len(), dump_before);
    }
}
