//! HTTP/3 wire framing for the braid engine.
//!
//! Everything here is pure: varints, frame and stream-type ids, SETTINGS,
//! the ordered header list, and the QPACK field-section coder all operate
//! on [bytes::Buf]/[bytes::BufMut] with no I/O. The engine crate drives
//! these codecs from its stream state machines.

pub mod code;
mod fields;
mod frame;
pub mod qpack;
mod settings;
mod varint;

pub use fields::*;
pub use frame::*;
pub use settings::*;
pub use varint::*;
