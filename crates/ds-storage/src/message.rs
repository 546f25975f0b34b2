use std::fmt;

/// A concrete 128-bit message id: `timestamp:64 ∥ shard_discriminator:16 ∥
/// sequence:48`. Two ids for the same shard therefore sort the same way as
/// their timestamps, which keeps checking I2 (timestamp uniqueness per
/// shard) cheap — a duplicate id at a given shard implies a duplicate
/// timestamp and vice versa. Layouts that do not persist the GUID (neither
/// of the two shipped layouts need to — the key already carries the
/// timestamp) may simply leave `Message::id` as `None`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u128);

impl MessageId {
    pub fn new(timestamp_us: u64, shard_discriminator: u16, sequence: u64) -> Self {
        let sequence = sequence & 0x0000_FFFF_FFFF_FFFF;
        let v = ((timestamp_us as u128) << 64)
            | ((shard_discriminator as u128) << 48)
            | sequence as u128;
        Self(v)
    }

    pub fn from_u128(v: u128) -> Self {
        Self(v)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn timestamp_us(&self) -> u64 {
        (self.0 >> 64) as u64
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({:032x})", self.0)
    }
}

/// An immutable published message, as stored by the core.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub from: String,
    /// Slash-delimited topic, already split into tokens.
    pub topic: Vec<String>,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn topic_string(&self) -> String {
        self.topic.join("/")
    }
}

/// Selects messages by exact topic, exact timestamp, and either any payload
/// or one exact payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Matcher {
    pub topic: Vec<String>,
    pub timestamp: u64,
    pub payload: PayloadMatch,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PayloadMatch {
    Any,
    Exact(Vec<u8>),
}

impl Matcher {
    pub fn matches(&self, msg: &Message) -> bool {
        if msg.topic != self.topic || msg.timestamp != self.timestamp {
            return false;
        }
        match &self.payload {
            PayloadMatch::Any => true,
            PayloadMatch::Exact(p) => &msg.payload == p,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreconditionKind {
    IfExists,
    UnlessExists,
}

#[derive(Clone, Debug)]
pub struct Precondition {
    pub matcher: Matcher,
    pub kind: PreconditionKind,
}

#[derive(Clone, Debug)]
pub enum Operation {
    Store(Message),
    Delete(Matcher),
}

/// An ordered sequence of operations to apply as one logical write, plus
/// optional preconditions that must all hold before any of it is applied.
#[derive(Clone, Debug, Default)]
pub struct OpBatch {
    pub ops: Vec<Operation>,
    pub preconditions: Vec<Precondition>,
}

impl OpBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, msg: Message) -> Self {
        self.ops.push(Operation::Store(msg));
        self
    }

    pub fn delete(mut self, matcher: Matcher) -> Self {
        self.ops.push(Operation::Delete(matcher));
        self
    }

    pub fn require(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }
}
