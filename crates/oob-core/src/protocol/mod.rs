//! Protocol module containing command types, the LAN codec, and session framing.

pub mod codec;
pub mod messages;
pub mod sequence;
pub mod session;

pub use codec::{decode_request, decode_response, encode_request, encode_response, ProtocolError};
pub use messages::*;
pub use sequence::SequenceCounter;
