//! The data-stream value format: everything needed to reconstruct a
//! `Message` given the shape's template, without re-storing the (redundant)
//! full topic — `decompress_topic` restores it from the varying tokens.

use crate::codec::{put_bytes, put_u128, put_u8, Reader};
use crate::message::{Message, MessageId};
use crate::Error;
use ds_lts::Segment;

pub fn encode(from: &str, varying: &[String], payload: &[u8], id: Option<MessageId>) -> Vec<u8> {
    let mut buf = Vec::new();
    match id {
        Some(id) => {
            put_u8(&mut buf, 1);
            put_u128(&mut buf, id.as_u128());
        }
        None => put_u8(&mut buf, 0),
    }
    put_bytes(&mut buf, from.as_bytes());
    put_bytes(&mut buf, &(varying.len() as u32).to_be_bytes());
    for tok in varying {
        put_bytes(&mut buf, tok.as_bytes());
    }
    put_bytes(&mut buf, payload);
    buf
}

pub struct Decoded {
    pub id: Option<MessageId>,
    pub from: String,
    pub varying: Vec<String>,
    pub payload: Vec<u8>,
}

pub fn decode(raw_key: &[u8], value: &[u8]) -> Result<Decoded, Error> {
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
        return Err(Error::CorruptRecord(raw_key.to_vec()));
    }
    let count = u32::from_be_bytes([count_bytes[0], count_bytes[1], count_bytes[2], count_bytes[3]]);
    let mut varying = Vec::with_capacity(count as usize);
    for _ in 0..count {
        varying.push(r.get_string()?);
    }
    let payload = r.get_bytes()?.to_vec();
    Ok(Decoded { id, from, varying, payload })
}

/// Reconstruct the full `Message` from a decoded record, the shape's
/// template, and the timestamp carried by the key.
pub fn to_message(decoded: Decoded, template: &[Segment], timestamp: u64) -> Result<Message, Error> {
    let topic = ds_lts::decompress_topic(template, &decoded.varying)
        .ok_or_else(|| Error::CorruptRecord(Vec::new()))?;
    Ok(Message {
        id: decoded.id,
        from: decoded.from,
        topic,
        timestamp,
        payload: decoded.payload,
    })
}
