/// DAP wire layer: length-prefixed framing and the message envelope.
pub mod framer;
pub mod protocol;

pub use framer::{decode_all, encode, DapFramer};
pub use protocol::*;
