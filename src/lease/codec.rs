// Lease value codec
//
// Layout: b"LL1" magic followed by a bincode record (fixed-width integers,
// length-prefixed strings, no trailing bytes). Length prefixes make the
// format self-delimiting whatever characters a session id contains.

use super::owner::{LeaseValue, NodeId, Owner, SessionId};
use bincode::Options;
use serde::{Deserialize, Serialize};

const MAGIC: &[u8; 3] = b"LL1";

/// Upper bound on an encoded value; anything larger is treated as corrupt
const MAX_ENCODED_LEN: u64 = 4096;

/// Result of decoding a stored value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Value(LeaseValue),
    /// Not something this codec wrote, or a torn write
    Corrupt,
}

#[derive(Serialize, Deserialize)]
struct WireLease<'a> {
    node: &'a str,
    session: &'a str,
    acquired_at_nanos: u64,
    ttl_millis: u64,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

pub fn encode(value: &LeaseValue) -> Vec<u8> {
    let wire = WireLease {
        node: value.owner.node.as_str(),
        session: value.owner.session.as_str(),
        acquired_at_nanos: value.acquired_at_nanos,
        ttl_millis: value.ttl_millis,
    };

    let mut out = MAGIC.to_vec();
    // Strings and integers into an unbounded Vec: serialization cannot fail
    out.extend(options().serialize(&wire).unwrap_or_default());
    out
}

pub fn decode(bytes: &[u8]) -> Decoded {
    let Some(body) = bytes.strip_prefix(MAGIC.as_slice()) else {
        return Decoded::Corrupt;
    };

    match options()
        .with_limit(MAX_ENCODED_LEN)
        .deserialize::<WireLease<'_>>(body)
    {
        Ok(wire) if !wire.node.is_empty() && !wire.session.is_empty() => {
            Decoded::Value(LeaseValue {
                owner: Owner::new(NodeId::new(wire.node), SessionId::new(wire.session)),
                acquired_at_nanos: wire.acquired_at_nanos,
                ttl_millis: wire.ttl_millis,
            })
        }
        _ => Decoded::Corrupt,
    }
}
