use crate::model::{FilterSegment, Segment, StaticKey, VaryingSlot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Root nodes promote a token to the wildcard edge after this many distinct
/// literal children; non-root nodes after this many.
const ROOT_THRESHOLD: usize = 100;
const NON_ROOT_THRESHOLD: usize = 10;

const WILDCARD_MARKER: &[u8] = b"+";
/// Marks a node as terminal (a shape returned to a caller by `topic_key`,
/// not merely an intermediate prefix). Safe as a reserved marker for the
/// same reason `WILDCARD_MARKER` is: MQTT forbids `+`/`#` inside a
/// published topic's literal tokens, so neither can collide with a real one.
const TERMINAL_MARKER: &[u8] = b"#";

#[derive(Debug, Clone, Default)]
struct Node {
    parent: Option<StaticKey>,
    incoming: Option<Segment>,
    children: HashMap<String, StaticKey>,
    wildcard: Option<StaticKey>,
    threshold: usize,
    /// Set only when some stored topic's walk ended exactly at this node
    /// (§8: distinguishes a learned *shape* from an intermediate prefix
    /// node created as a side effect of interning a longer topic).
    terminal: bool,
}

/// One trie mutation to persist alongside the batch that produced it.
#[derive(Debug, Clone)]
pub enum TrieOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("trie key width must be at least 8 bytes to hold the allocation counter, got {0}")]
    KeyWidthTooSmall(usize),
    #[error("corrupt persisted trie entry: key {0:?}")]
    CorruptEntry(Vec<u8>),
    #[error("static key {0:?} is not present in this trie")]
    UnknownStaticKey(StaticKey),
}

/// The Learned Topic Structure: an in-memory trie over MQTT topic tokens,
/// mirrored by a caller-chosen persistence mechanism via `dump`/`restore`.
///
/// The trie never removes a *learned shape*, only adds them (§5: "a trie
/// update never removes nodes, only adds"); promoting a node to a wildcard
/// edge merges its existing literal children into the new edge rather than
/// discarding them, so every shape learned before the promotion is still
/// reachable afterward under the same static key.
pub struct Lts {
    key_width: usize,
    root: StaticKey,
    nodes: RwLock<HashMap<StaticKey, Node>>,
    next_id: AtomicU64,
}

impl Lts {
    pub fn new(key_width: usize) -> Result<Self, Error> {
        if key_width < 8 {
            return Err(Error::KeyWidthTooSmall(key_width));
        }
        let root = StaticKey::from_bytes(vec![0u8; key_width].into_boxed_slice());
        let mut nodes = HashMap::new();
        nodes.insert(
            root.clone(),
            Node {
                parent: None,
                incoming: None,
                children: HashMap::new(),
                wildcard: None,
                threshold: ROOT_THRESHOLD,
                terminal: false,
            },
        );
        Ok(Self {
            key_width,
            root,
            nodes: RwLock::new(nodes),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &StaticKey {
        &self.root
    }

    fn alloc_key(&self) -> StaticKey {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut bytes = vec![0u8; self.key_width];
        let id_bytes = id.to_be_bytes();
        bytes[self.key_width - 8..].copy_from_slice(&id_bytes);
        StaticKey::from_bytes(bytes.into_boxed_slice())
    }

    /// Walk `topic`'s tokens, promoting new tokens into the structure as
    /// needed. Returns the topic's static key, its varying tokens (those
    /// that hit a wildcard edge, in order), and the trie ops to persist
    /// (puts for new/rewired edges, deletes for edges a promotion
    /// superseded).
    ///
    /// Mutating, so callers must serialize calls the same way they
    /// serialize batch commits (single ingest task per shard; §5).
    pub fn topic_key(&self, topic: &[String]) -> (StaticKey, Vec<String>, Vec<TrieOp>) {
        let mut nodes = self.nodes.write().unwrap();
        let mut cursor = self.root.clone();
        let mut varying = Vec::new();
        let mut ops = Vec::new();

        for tok in topic {
            let node = nodes.get(&cursor).expect("cursor must reference a live node");

            if let Some(child) = node.children.get(tok) {
                cursor = child.clone();
                continue;
            }
            if let Some(wildcard) = &node.wildcard {
                varying.push(tok.clone());
                cursor = wildcard.clone();
                continue;
            }

            if node.children.len() >= node.threshold {
                // Promote: every already-inserted literal child at this
                // position is merged into a single new wildcard edge, so
                // none of their learned shapes become unreachable.
                let wildcard_key = self.alloc_key();
                nodes.insert(
                    wildcard_key.clone(),
                    Node {
                        parent: Some(cursor.clone()),
                        incoming: Some(Segment::Wildcard),
                        children: HashMap::new(),
                        wildcard: None,
                        threshold: NON_ROOT_THRESHOLD,
                        terminal: false,
                    },
                );
                ops.push(TrieOp::Put(persist_key(&cursor, WILDCARD_MARKER), wildcard_key.as_bytes().to_vec()));

                let absorbed: Vec<(String, StaticKey)> = nodes.get_mut(&cursor).unwrap().children.drain().collect();
                for (absorbed_tok, absorbed_key) in absorbed {
                    ops.push(TrieOp::Delete(persist_key(&cursor, absorbed_tok.as_bytes())));
                    merge_subtree(&mut nodes, &wildcard_key, &absorbed_key, &mut ops);
                }
                nodes.get_mut(&cursor).unwrap().wildcard = Some(wildcard_key.clone());
                tracing::debug!(?cursor, token = %tok, new_static = ?wildcard_key, "promoted token to wildcard edge");

                varying.push(tok.clone());
                cursor = wildcard_key;
                continue;
            }

            let parent = cursor.clone();
            let child_key = self.alloc_key();
            nodes.insert(
                child_key.clone(),
                Node {
                    parent: Some(parent.clone()),
                    incoming: Some(Segment::Literal(tok.clone())),
                    children: HashMap::new(),
                    wildcard: None,
                    threshold: NON_ROOT_THRESHOLD,
                    terminal: false,
                },
            );
            ops.push(TrieOp::Put(persist_key(&parent, tok.as_bytes()), child_key.as_bytes().to_vec()));
            nodes.get_mut(&parent).unwrap().children.insert(tok.clone(), child_key.clone());
            cursor = child_key;
        }

        let node = nodes.get_mut(&cursor).unwrap();
        if !node.terminal {
            node.terminal = true;
            ops.push(TrieOp::Put(persist_key(&cursor, TERMINAL_MARKER), cursor.as_bytes().to_vec()));
        }

        (cursor, varying, ops)
    }

    /// Read-only variant of `topic_key`, used for deletes: fails closed
    /// (returns `None`) rather than learning new shapes.
    pub fn lookup_topic_key(&self, topic: &[String]) -> Option<(StaticKey, Vec<String>)> {
        let nodes = self.nodes.read().unwrap();
        let mut cursor = self.root.clone();
        let mut varying = Vec::new();

        for tok in topic {
            let node = nodes.get(&cursor)?;
            if let Some(child) = node.children.get(tok) {
                cursor = child.clone();
            } else if let Some(wildcard) = &node.wildcard {
                varying.push(tok.clone());
                cursor = wildcard.clone();
            } else {
                return None;
            }
        }
        Some((cursor, varying))
    }

    /// The template (literal tokens + wildcard placeholders) for a static key.
    pub fn reverse_lookup(&self, static_key: &StaticKey) -> Option<Vec<Segment>> {
        let nodes = self.nodes.read().unwrap();
        if !nodes.contains_key(static_key) {
            return None;
        }
        Some(template_of(&nodes, static_key))
    }

    /// Enumerate every static key whose template is compatible with `filter`,
    /// alongside the varying-slot values implied by the filter at that shape.
    pub fn match_topics(&self, filter: &[FilterSegment]) -> Vec<(StaticKey, Vec<VaryingSlot>)> {
        let nodes = self.nodes.read().unwrap();
        let mut results = Vec::new();
        walk_match(&nodes, &self.root, filter, &mut Vec::new(), &mut results);
        results
    }

    /// Every `(trie_key, trie_val)` pair, for bulk-loading into a fresh
    /// generation's trie column family.
    pub fn dump(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let nodes = self.nodes.read().unwrap();
        let mut out = Vec::new();
        for (key, node) in nodes.iter() {
            for (tok, child) in &node.children {
                out.push((persist_key(key, tok.as_bytes()), child.as_bytes().to_vec()));
            }
            if let Some(child) = &node.wildcard {
                out.push((persist_key(key, WILDCARD_MARKER), child.as_bytes().to_vec()));
            }
            if node.terminal {
                out.push((persist_key(key, TERMINAL_MARKER), key.as_bytes().to_vec()));
            }
        }
        out
    }

    /// Rebuild a trie from a previously dumped (or persisted-CF-scanned)
    /// set of `(trie_key, trie_val)` pairs.
    pub fn restore(key_width: usize, pairs: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<Self, Error> {
        let lts = Self::new(key_width)?;
        let mut max_id = 0u64;

        let mut terminal_keys: Vec<StaticKey> = Vec::new();
        let mut edges: Vec<(StaticKey, Vec<u8>, StaticKey)> = Vec::new();

        for (key, val) in pairs {
            if key.len() <= key_width {
                return Err(Error::CorruptEntry(key));
            }
            let (parent_bytes, token) = key.split_at(key_width);
            let parent = StaticKey::from_bytes(parent_bytes.to_vec().into_boxed_slice());
            if val.len() != key_width {
                return Err(Error::CorruptEntry(key.clone()));
            }
            let target = StaticKey::from_bytes(val.clone().into_boxed_slice());

            if token == TERMINAL_MARKER {
                terminal_keys.push(parent);
                continue;
            }
            max_id = max_id.max(trailing_id(&target));
            edges.push((parent, token.to_vec(), target));
        }

        let mut nodes = lts.nodes.write().unwrap();

        // Pre-create every node referenced as an edge's child, so edges can
        // be applied below in any order (no parent-before-child BFS needed,
        // since templates are now derived lazily via parent pointers).
        for (_, _, child) in &edges {
            nodes.entry(child.clone()).or_insert_with(|| Node {
                parent: None,
                incoming: None,
                children: HashMap::new(),
                wildcard: None,
                threshold: NON_ROOT_THRESHOLD,
                terminal: false,
            });
        }

        for (parent, token, child) in edges {
            if !nodes.contains_key(&parent) {
                return Err(Error::UnknownStaticKey(parent));
            }
            let is_wildcard = token == WILDCARD_MARKER;
            let segment = if is_wildcard {
                Segment::Wildcard
            } else {
                Segment::Literal(String::from_utf8_lossy(&token).into_owned())
            };

            {
                let child_node = nodes.get_mut(&child).unwrap();
                child_node.parent = Some(parent.clone());
                child_node.incoming = Some(segment);
            }
            let parent_node = nodes.get_mut(&parent).unwrap();
            if is_wildcard {
                parent_node.wildcard = Some(child);
            } else {
                let lit = String::from_utf8_lossy(&token).into_owned();
                parent_node.children.insert(lit, child);
            }
        }

        for key in terminal_keys {
            if let Some(node) = nodes.get_mut(&key) {
                node.terminal = true;
            }
        }

        drop(nodes);

        lts.next_id.store(max_id + 1, Ordering::SeqCst);
        Ok(lts)
    }
}

fn persist_key(parent: &StaticKey, token: &[u8]) -> Vec<u8> {
    let mut key = parent.as_bytes().to_vec();
    key.extend_from_slice(token);
    key
}

/// Merge `absorb`'s subtree into `canonical`'s, recursively resolving token
/// collisions, and record the puts needed to persist the rewiring. `absorb`
/// is removed from `nodes`; any of its descendants not reparented directly
/// (because `canonical` already had a child under the same token) are
/// merged one level deeper instead, so no previously-terminal node's static
/// key is ever discarded — only its position in the tree moves.
fn merge_subtree(nodes: &mut HashMap<StaticKey, Node>, canonical: &StaticKey, absorb: &StaticKey, ops: &mut Vec<TrieOp>) {
    if canonical == absorb {
        return;
    }
    let absorbed = nodes.remove(absorb).expect("absorbed node must be live");

    if absorbed.terminal {
        let node = nodes.get_mut(canonical).unwrap();
        if !node.terminal {
            node.terminal = true;
            ops.push(TrieOp::Put(persist_key(canonical, TERMINAL_MARKER), canonical.as_bytes().to_vec()));
        }
        ops.push(TrieOp::Delete(persist_key(absorb, TERMINAL_MARKER)));
    }

    for (tok, child_key) in absorbed.children {
        // The edge `absorb -> tok -> child_key` is being superseded
        // regardless of whether `child_key` ends up reparented directly or
        // merged further down: `absorb` itself is being removed.
        ops.push(TrieOp::Delete(persist_key(absorb, tok.as_bytes())));
        let existing = nodes.get(canonical).unwrap().children.get(&tok).cloned();
        match existing {
            Some(existing_child) => merge_subtree(nodes, &existing_child, &child_key, ops),
            None => {
                let child_node = nodes.get_mut(&child_key).unwrap();
                child_node.parent = Some(canonical.clone());
                child_node.incoming = Some(Segment::Literal(tok.clone()));
                nodes.get_mut(canonical).unwrap().children.insert(tok.clone(), child_key.clone());
                ops.push(TrieOp::Put(persist_key(canonical, tok.as_bytes()), child_key.as_bytes().to_vec()));
            }
        }
    }

    if let Some(absorbed_wildcard) = absorbed.wildcard {
        ops.push(TrieOp::Delete(persist_key(absorb, WILDCARD_MARKER)));
        let existing_wildcard = nodes.get(canonical).unwrap().wildcard.clone();
        match existing_wildcard {
            Some(existing) => merge_subtree(nodes, &existing, &absorbed_wildcard, ops),
            None => {
                let child_node = nodes.get_mut(&absorbed_wildcard).unwrap();
                child_node.parent = Some(canonical.clone());
                child_node.incoming = Some(Segment::Wildcard);
                nodes.get_mut(canonical).unwrap().wildcard = Some(absorbed_wildcard.clone());
                ops.push(TrieOp::Put(persist_key(canonical, WILDCARD_MARKER), absorbed_wildcard.as_bytes().to_vec()));
            }
        }
    }
}

/// A node's template, derived by walking its `parent`/`incoming` chain up
/// to the root. Computed lazily (rather than cached per node) so merging
/// two subtrees never requires rewriting cached templates down an
/// arbitrarily deep tree.
fn template_of(nodes: &HashMap<StaticKey, Node>, key: &StaticKey) -> Vec<Segment> {
    let mut segs = Vec::new();
    let mut cursor = key.clone();
    loop {
        let node = nodes.get(&cursor).expect("live static key must reference a live node");
        match (&node.parent, &node.incoming) {
            (Some(parent), Some(seg)) => {
                segs.push(seg.clone());
                cursor = parent.clone();
            }
            _ => break,
        }
    }
    segs.reverse();
    segs
}

fn trailing_id(key: &StaticKey) -> u64 {
    let bytes = key.as_bytes();
    if bytes.len() < 8 {
        return 0;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[bytes.len() - 8..]);
    u64::from_be_bytes(buf)
}

fn walk_match(
    nodes: &HashMap<StaticKey, Node>,
    cursor: &StaticKey,
    filter: &[FilterSegment],
    varying: &mut Vec<VaryingSlot>,
    results: &mut Vec<(StaticKey, Vec<VaryingSlot>)>,
) {
    let Some(node) = nodes.get(cursor) else {
        return;
    };

    let Some(seg) = filter.first() else {
        if node.terminal {
            results.push((cursor.clone(), varying.clone()));
        }
        return;
    };
    let rest = &filter[1..];

    match seg {
        FilterSegment::Literal(tok) => {
            if let Some(child) = node.children.get(tok) {
                walk_match(nodes, child, rest, varying, results);
            }
            if let Some(wildcard) = &node.wildcard {
                varying.push(VaryingSlot::Concrete(tok.clone()));
                walk_match(nodes, wildcard, rest, varying, results);
                varying.pop();
            }
        }
        FilterSegment::Plus => {
            for child in node.children.values() {
                walk_match(nodes, child, rest, varying, results);
            }
            if let Some(wildcard) = &node.wildcard {
                varying.push(VaryingSlot::Wildcard);
                walk_match(nodes, wildcard, rest, varying, results);
                varying.pop();
            }
        }
        FilterSegment::Hash => collect_descendants(nodes, cursor, varying, results),
    }
}

fn collect_descendants(
    nodes: &HashMap<StaticKey, Node>,
    cursor: &StaticKey,
    varying: &mut Vec<VaryingSlot>,
    results: &mut Vec<(StaticKey, Vec<VaryingSlot>)>,
) {
    let Some(node) = nodes.get(cursor) else {
        return;
    };
    if node.terminal {
        results.push((cursor.clone(), varying.clone()));
    }

    for child in node.children.values() {
        collect_descendants(nodes, child, varying, results);
    }
    if let Some(wildcard) = &node.wildcard {
        varying.push(VaryingSlot::Wildcard);
        collect_descendants(nodes, wildcard, varying, results);
        varying.pop();
    }
}
