// Lease values and their wire encoding
//
// A lease is stored under an opaque resource key as an encoded `LeaseValue`:
// who holds it (node + session), when it was last written, and for how long
// that write is valid.

pub mod codec;
pub mod key;
pub mod owner;

pub use codec::{decode, encode, Decoded};
pub use key::ResourceKey;
pub use owner::{LeaseValue, NodeId, Owner, SessionId};
