//! Concrete transport implementations.

pub mod datagram;
pub mod stream;

pub use datagram::{DatagramTransport, MAX_DATAGRAM_LEN};
pub use stream::{StreamFraming, StreamTransport};
