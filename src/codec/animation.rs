//! Text command codec for the animation-tool link
//!
//! One command per line: a verb followed by whitespace-separated axis values,
//! e.g. `move 10.0 20.0 30.0`. Line splitting lives in
//! [`LineFraming`](super::LineFraming); this module only sees complete lines.

use std::fmt::Write as _;
use std::time::SystemTime;

use tokio_util::bytes::Bytes;

use crate::error::DecodeError;
use crate::types::{MotionFrame, SourceId, Telemetry};

/// Verbs that carry a pose.
pub const FRAME_VERBS: [&str; 2] = ["move", "pose"];

/// Verb of the acknowledgement line sent back to the animation tool.
pub const ACK_VERB: &str = "ack";

/// Lines starting with this are ignored.
const COMMENT_PREFIX: char = '#';

/// Parse one command line into its axis values.
///
/// Returns `Ok(None)` for blank and comment lines.
pub fn parse_command(line: &[u8]) -> Result<Option<Vec<f64>>, DecodeError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| DecodeError::malformed(format!("command is not UTF-8: {}", e)))?;
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

    if text.is_empty() || text.starts_with(COMMENT_PREFIX) {
        return Ok(None);
    }

    let mut tokens = text.split_whitespace();
    let verb = tokens.next().unwrap_or_default();
    if !FRAME_VERBS.iter().any(|known| known.eq_ignore_ascii_case(verb)) {
        return Err(DecodeError::malformed(format!("unknown verb '{}'", truncate(verb))));
    }

    let values = tokens
        .map(|token| match token.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            Ok(_) => Err(DecodeError::malformed(format!("non-finite axis value '{}'", token))),
            Err(_) => Err(DecodeError::malformed(format!("non-numeric axis value '{}'", truncate(token)))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if values.is_empty() {
        return Err(DecodeError::malformed(format!("'{}' without axis values", verb)));
    }

    Ok(Some(values))
}

/// Stateful decoder turning command lines into [`MotionFrame`]s.
///
/// Holds the configured arity and assigns a sequence to every accepted
/// frame, so sequences are gapless and strictly increasing per source.
#[derive(Debug, Clone)]
pub struct AnimationDecoder {
    axis_count: usize,
    source_id: SourceId,
    next_sequence: u32,
}

impl AnimationDecoder {
    pub fn new(axis_count: usize, source_id: SourceId) -> Self {
        Self { axis_count, source_id, next_sequence: 1 }
    }

    /// Decode one line captured at `captured_at`.
    ///
    /// Frames with the wrong number of axes are rejected with
    /// [`DecodeError::ArityMismatch`] and do not consume a sequence.
    pub fn decode_animation_message(
        &mut self,
        line: &[u8],
        captured_at: SystemTime,
    ) -> Result<Option<MotionFrame>, DecodeError> {
        let Some(values) = parse_command(line)? else {
            return Ok(None);
        };

        if values.len() != self.axis_count {
            return Err(DecodeError::ArityMismatch { expected: self.axis_count, found: values.len() });
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(Some(MotionFrame::new(sequence, captured_at, values, self.source_id.clone())))
    }

    /// Sequence the next accepted frame will carry.
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn axis_count(&self) -> usize {
        self.axis_count
    }
}

/// Encode the acknowledgement line for a telemetry record:
/// `ack <sequence> <flags> <v1> ... <vN>\n`.
pub fn encode_animation_ack(telemetry: &Telemetry) -> Bytes {
    let mut line = format!(
        "{} {} {}",
        ACK_VERB,
        telemetry.sequence_echoed,
        telemetry.status_flags.value()
    );
    for value in &telemetry.actual_axis_values {
        let _ = write!(line, " {}", value);
    }
    line.push('\n');
    Bytes::from(line)
}

/// Encode the idle keepalive line, `# keepalive <count>\n`.
///
/// It is a comment, so line-oriented peers discard it.
pub fn encode_keepalive(count: u32) -> Bytes {
    Bytes::from(format!("{COMMENT_PREFIX} keepalive {count}\n"))
}

fn truncate(token: &str) -> &str {
    match token.char_indices().nth(32) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StatusFlags;

    fn decoder(axes: usize) -> AnimationDecoder {
        AnimationDecoder::new(axes, SourceId::new("maya"))
    }

    #[test]
    fn decodes_move_command() {
        let mut decoder = decoder(3);
        let frame = decoder
            .decode_animation_message(b"move 10.0 20.0 30.0", SystemTime::UNIX_EPOCH)
            .unwrap()
            .unwrap();

        assert_eq!(frame.axis_values, vec![10.0, 20.0, 30.0]);
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.source_id.as_str(), "maya");
        assert_eq!(frame.timestamp, SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn verbs_are_case_insensitive_and_whitespace_tolerant() {
        let mut decoder = decoder(2);
        let now = SystemTime::now();
        let a = decoder.decode_animation_message(b"  POSE\t1.5   -2e1 \r", now).unwrap().unwrap();
        let b = decoder.decode_animation_message(b"move 0 0\0\0", now).unwrap().unwrap();

        assert_eq!(a.axis_values, vec![1.5, -20.0]);
        assert_eq!((a.sequence, b.sequence), (1, 2));
    }

    #[test]
    fn blank_and_comment_lines_are_ignored() {
        let mut decoder = decoder(3);
        let now = SystemTime::now();
        assert_eq!(decoder.decode_animation_message(b"", now).unwrap(), None);
        assert_eq!(decoder.decode_animation_message(b"   ", now).unwrap(), None);
        assert_eq!(decoder.decode_animation_message(b"# timeline start", now).unwrap(), None);
        assert_eq!(decoder.next_sequence(), 1);
    }

    #[test]
    fn keepalive_is_a_comment_line() {
        let line = encode_keepalive(3);
        assert_eq!(&line[..], b"# keepalive 3\n");

        let mut decoder = decoder(3);
        let body = line.strip_suffix(b"\n").unwrap();
        assert_eq!(decoder.decode_animation_message(body, SystemTime::now()).unwrap(), None);
    }

    #[test]
    fn malformed_commands_are_rejected() {
        let mut decoder = decoder(3);
        let now = SystemTime::now();
        let cases: [&[u8]; 6] = [
            b"move 1.0 abc 3.0",
            b"jump 1.0 2.0 3.0",
            b"move",
            b"move 1.0 NaN 3.0",
            b"move 1.0 inf 3.0",
            b"move \xff\xfe 1.0",
        ];
        for line in cases {
            let err = decoder.decode_animation_message(line, now).unwrap_err();
            assert!(matches!(err, DecodeError::Malformed { .. }), "{:?} -> {err}", line);
        }
        assert_eq!(decoder.next_sequence(), 1);
    }

    #[test]
    fn arity_mismatch_does_not_consume_sequence() {
        let mut decoder = decoder(3);
        let now = SystemTime::now();
        let err = decoder.decode_animation_message(b"move 1.0 2.0", now).unwrap_err();
        assert_eq!(err, DecodeError::ArityMismatch { expected: 3, found: 2 });

        let frame = decoder.decode_animation_message(b"move 1 2 3", now).unwrap().unwrap();
        assert_eq!(frame.sequence, 1);
    }

    #[test]
    fn ack_line_format() {
        let telemetry = Telemetry::new(42, vec![10.0, 20.5, -30.25], StatusFlags::new(0x4));
        let line = encode_animation_ack(&telemetry);
        assert_eq!(&line[..], b"ack 42 4 10 20.5 -30.25\n");
    }

    #[test]
    fn long_tokens_are_truncated_in_errors() {
        let line = format!("move {}", "x".repeat(500));
        let err = parse_command(line.as_bytes()).unwrap_err();
        assert!(err.to_string().len() < 120);
    }
}
