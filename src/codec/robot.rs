//! Binary packet codec for the robot link
//!
//! All integers and floats are big-endian:
//!
//! ```text
//! robot packet:  sequence:u32 | axis_count:u16 | axis_values:f64*N | checksum:u32
//! telemetry:     sequence:u32 | axis_count:u16 | axis_values:f64*N | status:u32 | checksum:u32
//! ```
//!
//! The checksum is CRC-32C over every preceding byte. A telemetry packet without
//! the status word (i.e. a plain robot packet echoed back) decodes with empty flags.

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::types::{MotionFrame, StatusFlags, Telemetry};

/// sequence + axis_count
pub const HEADER_LEN: usize = 6;
/// Size of one encoded axis value.
pub const AXIS_LEN: usize = 8;
/// Size of the status word in telemetry.
pub const STATUS_LEN: usize = 4;
/// Size of the trailing checksum.
pub const CHECKSUM_LEN: usize = 4;
/// Largest packet the codec can produce.
pub const MAX_PACKET_LEN: usize = HEADER_LEN + AXIS_LEN * u16::MAX as usize + STATUS_LEN + CHECKSUM_LEN;

/// Wire-ready encoding of one [`MotionFrame`].
///
/// Created right before transmission and dropped once the write completes or fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotPacket {
    sequence: u32,
    bytes: Bytes,
}

impl RobotPacket {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Encode a frame for the robot controller.
///
/// At most `u16::MAX` axis values are encoded; configured arities never exceed that.
pub fn encode_robot_packet(frame: &MotionFrame) -> RobotPacket {
    let bytes = encode_body(frame.sequence, &frame.axis_values, None);
    RobotPacket { sequence: frame.sequence, bytes }
}

/// Encode a telemetry packet as a robot controller would send it.
pub fn encode_telemetry(telemetry: &Telemetry) -> Bytes {
    encode_body(
        telemetry.sequence_echoed,
        &telemetry.actual_axis_values,
        Some(telemetry.status_flags),
    )
}

fn encode_body(sequence: u32, values: &[f64], status: Option<StatusFlags>) -> Bytes {
    let count = values.len().min(u16::MAX as usize);
    let status_len = if status.is_some() { STATUS_LEN } else { 0 };
    let mut buf = BytesMut::with_capacity(HEADER_LEN + AXIS_LEN * count + status_len + CHECKSUM_LEN);

    buf.put_u32(sequence);
    buf.put_u16(count as u16);
    for value in &values[..count] {
        buf.put_f64(*value);
    }
    if let Some(status) = status {
        buf.put_u32(status.value());
    }
    let checksum = crc32c::crc32c(&buf);
    buf.put_u32(checksum);

    buf.freeze()
}

/// Decode a telemetry packet received from the robot.
pub fn decode_telemetry(packet: &[u8]) -> Result<Telemetry, DecodeError> {
    if packet.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(DecodeError::malformed(format!(
            "packet of {} bytes is shorter than the {} byte minimum",
            packet.len(),
            HEADER_LEN + CHECKSUM_LEN
        )));
    }

    let mut header = &packet[..HEADER_LEN];
    let sequence = header.get_u32();
    let count = header.get_u16() as usize;

    let values_end = HEADER_LEN + AXIS_LEN * count;
    let has_status = if packet.len() == values_end + CHECKSUM_LEN {
        false
    } else if packet.len() == values_end + STATUS_LEN + CHECKSUM_LEN {
        true
    } else {
        return Err(DecodeError::malformed(format!(
            "packet length {} does not match axis count {}",
            packet.len(),
            count
        )));
    };

    let (body, mut trailer) = packet.split_at(packet.len() - CHECKSUM_LEN);
    let expected = trailer.get_u32();
    let computed = crc32c::crc32c(body);
    if expected != computed {
        return Err(DecodeError::ChecksumMismatch { expected, computed });
    }

    let mut values = &body[HEADER_LEN..values_end];
    let mut axis_values = Vec::with_capacity(count);
    for _ in 0..count {
        let value = values.get_f64();
        if !value.is_finite() {
            return Err(DecodeError::malformed("non-finite axis value in telemetry"));
        }
        axis_values.push(value);
    }

    let status_flags = if has_status {
        let mut status = &body[values_end..];
        StatusFlags::new(status.get_u32())
    } else {
        StatusFlags::empty()
    };

    Ok(Telemetry::new(sequence, axis_values, status_flags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceId;
    use proptest::prelude::*;
    use std::time::SystemTime;

    fn frame(sequence: u32, values: Vec<f64>) -> MotionFrame {
        MotionFrame::new(sequence, SystemTime::UNIX_EPOCH, values, SourceId::default())
    }

    #[test]
    fn packet_layout_is_big_endian() {
        let packet = encode_robot_packet(&frame(0x0102_0304, vec![1.0]));
        let bytes = packet.as_bytes();

        assert_eq!(packet.len(), HEADER_LEN + AXIS_LEN + CHECKSUM_LEN);
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(&bytes[6..14], &1.0f64.to_be_bytes());
        assert_eq!(&bytes[14..], &crc32c::crc32c(&bytes[..14]).to_be_bytes());
        assert_eq!(packet.sequence(), 0x0102_0304);
    }

    #[test]
    fn telemetry_with_status_decodes() {
        let telemetry = Telemetry::new(7, vec![1.0, -2.0, 3.5], StatusFlags::new(StatusFlags::MOVING));
        let decoded = decode_telemetry(&encode_telemetry(&telemetry)).unwrap();
        assert_eq!(decoded, telemetry);
    }

    #[test]
    fn corrupted_packet_fails_checksum() {
        let packet = encode_robot_packet(&frame(9, vec![10.0, 20.0, 30.0]));
        let mut bytes = packet.into_bytes().to_vec();
        bytes[8] ^= 0x40;

        let err = decode_telemetry(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn inconsistent_length_is_malformed() {
        let packet = encode_robot_packet(&frame(1, vec![1.0, 2.0]));
        let bytes = packet.as_bytes();

        assert!(matches!(decode_telemetry(&bytes[..5]), Err(DecodeError::Malformed { .. })));
        assert!(matches!(
            decode_telemetry(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Malformed { .. })
        ));

        let mut padded = bytes.to_vec();
        padded.extend_from_slice(&[0, 0]);
        assert!(matches!(decode_telemetry(&padded), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn empty_frame_roundtrips() {
        let decoded = decode_telemetry(encode_robot_packet(&frame(3, vec![])).as_bytes()).unwrap();
        assert!(decoded.actual_axis_values.is_empty());
        assert_eq!(decoded.sequence_echoed, 3);
    }

    proptest! {
        #[test]
        fn robot_packet_decodes_as_telemetry(
            sequence in any::<u32>(),
            values in prop::collection::vec(-1.0e6f64..1.0e6, 1..12),
        ) {
            let frame = frame(sequence, values.clone());
            let decoded = decode_telemetry(encode_robot_packet(&frame).as_bytes()).unwrap();

            prop_assert_eq!(decoded.sequence_echoed, sequence);
            prop_assert_eq!(decoded.actual_axis_values, values);
            prop_assert_eq!(decoded.status_flags, StatusFlags::empty());
        }

        #[test]
        fn single_bit_flips_never_decode_silently(
            values in prop::collection::vec(-360.0f64..360.0, 6),
            position in 0usize..58,
            bit in 0u8..8,
        ) {
            let packet = encode_robot_packet(&frame(1, values));
            let mut bytes = packet.into_bytes().to_vec();
            bytes[position] ^= 1 << bit;
            prop_assert!(decode_telemetry(&bytes).is_err());
        }
    }
}
