//! Wire framing for JournalKeeper peers and clients.
//!
//! Frames are length-delimited: a `u32` big-endian length, a fixed header
//! (version, type code, correlation id, sender, receiver), then a typed
//! payload. Every payload codec is symmetric and strict: fixed-width
//! big-endian integers, length-prefixed UTF-8 strings, one presence byte for
//! optional fields, and no tolerated slack on decode.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::FrameCodec;
pub use frame::{Frame, MessageKind, VERSION};
pub use messages::Body;
