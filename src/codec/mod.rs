//! Frame codec: bytes ↔ typed messages for both links.
//!
//! Everything here is pure; no socket is touched. The transports use
//! [`WireFraming`] to cut a byte stream into messages, the orchestrator uses the
//! animation and robot codecs to turn those messages into values.
//!
//! ```rust
//! use motionbridge::codec::{AnimationDecoder, decode_telemetry, encode_robot_packet};
//! use motionbridge::types::SourceId;
//! use std::time::SystemTime;
//!
//! let mut decoder = AnimationDecoder::new(3, SourceId::default());
//! let frame = decoder
//!     .decode_animation_message(b"move 10.0 20.0 30.0", SystemTime::now())
//!     .unwrap()
//!     .unwrap();
//!
//! let packet = encode_robot_packet(&frame);
//! let echoed = decode_telemetry(packet.as_bytes()).unwrap();
//! assert_eq!(echoed.actual_axis_values, vec![10.0, 20.0, 30.0]);
//! ```

mod animation;
mod framing;
mod robot;

pub use animation::{ACK_VERB, AnimationDecoder, FRAME_VERBS, encode_animation_ack, encode_keepalive, parse_command};
pub use framing::{FrameItem, LineFraming, WireFraming};
pub use robot::{
    AXIS_LEN, CHECKSUM_LEN, HEADER_LEN, MAX_PACKET_LEN, RobotPacket, STATUS_LEN, decode_telemetry,
    encode_robot_packet, encode_telemetry,
};
