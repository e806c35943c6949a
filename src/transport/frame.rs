//! Self-delimiting wire frames carried inside the per-packet AEAD
//! plaintext: DATA, ACK, CONTROL, HEARTBEAT.
//!
//! Decoding exposes `DATA.payload` as a borrowed sub-slice of the input
//! buffer, so the receive hot path makes no intermediate allocation.

use crate::core::FrameError;

const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;
const KIND_CONTROL: u8 = 2;
const KIND_HEARTBEAT: u8 = 3;

/// A decoded frame, borrowing its payload from the plaintext buffer it was
/// decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Data { stream_id: u64, sequence: u64, fin: bool, payload: &'a [u8] },
    Ack { stream_id: u64, ack: u64, bitmap: u32 },
    Control { kind: u8, payload: &'a [u8] },
    Heartbeat { timestamp_ms: u64, sequence: u64, payload: &'a [u8] },
}

impl<'a> Frame<'a> {
    /// Construct the `(message_id << 32) | fragment_index` sequence value
    /// used by DATA frames belonging to a fragmented message.
    pub fn fragment_sequence(message_id: u32, fragment_index: u32) -> u64 {
        ((message_id as u64) << 32) | fragment_index as u64
    }

    /// Split a DATA frame's sequence field back into `(message_id,
    /// fragment_index)`.
    pub fn split_fragment_sequence(sequence: u64) -> (u32, u32) {
        ((sequence >> 32) as u32, sequence as u32)
    }

    /// Encode this frame to a freshly-allocated buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Frame::Data { stream_id, sequence, fin, payload } => {
                out.push(KIND_DATA);
                out.extend_from_slice(&stream_id.to_be_bytes());
                out.extend_from_slice(&sequence.to_be_bytes());
                out.push(*fin as u8);
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(payload);
            }
            Frame::Ack { stream_id, ack, bitmap } => {
                out.push(KIND_ACK);
                out.extend_from_slice(&stream_id.to_be_bytes());
                out.extend_from_slice(&ack.to_be_bytes());
                out.extend_from_slice(&bitmap.to_be_bytes());
            }
            Frame::Control { kind, payload } => {
                out.push(KIND_CONTROL);
                out.push(*kind);
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(payload);
            }
            Frame::Heartbeat { timestamp_ms, sequence, payload } => {
                out.push(KIND_HEARTBEAT);
                out.extend_from_slice(&timestamp_ms.to_be_bytes());
                out.extend_from_slice(&sequence.to_be_bytes());
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(payload);
            }
        }
        out
    }

    /// Decode a single frame from the front of `buf`, returning the frame
    /// and the number of bytes consumed.
    pub fn decode(buf: &'a [u8]) -> Result<(Frame<'a>, usize), FrameError> {
        if buf.is_empty() {
            return Err(FrameError::Truncated);
        }
        let kind = buf[0];
        let rest = &buf[1..];

        match kind {
            KIND_DATA => {
                if rest.len() < 17 {
                    return Err(FrameError::Truncated);
                }
                let stream_id = u64::from_be_bytes(rest[0..8].try_into().unwrap());
                let sequence = u64::from_be_bytes(rest[8..16].try_into().unwrap());
                let fin = rest[16] != 0;
                let len_start = 17;
                if rest.len() < len_start + 4 {
                    return Err(FrameError::Truncated);
                }
                let payload_len = u32::from_be_bytes(rest[len_start..len_start + 4].try_into().unwrap()) as usize;
                let payload_start = len_start + 4;
                if rest.len() < payload_start + payload_len {
                    return Err(FrameError::Truncated);
                }
                let payload = &rest[payload_start..payload_start + payload_len];
                Ok((Frame::Data { stream_id, sequence, fin, payload }, 1 + payload_start + payload_len))
            }
            KIND_ACK => {
                if rest.len() < 20 {
                    return Err(FrameError::Truncated);
                }
                let stream_id = u64::from_be_bytes(rest[0..8].try_into().unwrap());
                let ack = u64::from_be_bytes(rest[8..16].try_into().unwrap());
                let bitmap = u32::from_be_bytes(rest[16..20].try_into().unwrap());
                Ok((Frame::Ack { stream_id, ack, bitmap }, 1 + 20))
            }
            KIND_CONTROL => {
                if rest.len() < 5 {
                    return Err(FrameError::Truncated);
                }
                let ctrl_kind = rest[0];
                let payload_len = u32::from_be_bytes(rest[1..5].try_into().unwrap()) as usize;
                if rest.len() < 5 + payload_len {
                    return Err(FrameError::Truncated);
                }
                let payload = &rest[5..5 + payload_len];
                Ok((Frame::Control { kind: ctrl_kind, payload }, 1 + 5 + payload_len))
            }
            KIND_HEARTBEAT => {
                if rest.len() < 20 {
                    return Err(FrameError::Truncated);
                }
                let timestamp_ms = u64::from_be_bytes(rest[0..8].try_into().unwrap());
                let sequence = u64::from_be_bytes(rest[8..16].try_into().unwrap());
                let payload_len = u32::from_be_bytes(rest[16..20].try_into().unwrap()) as usize;
                if rest.len() < 20 + payload_len {
                    return Err(FrameError::Truncated);
                }
                let payload = &rest[20..20 + payload_len];
                Ok((Frame::Heartbeat { timestamp_ms, sequence, payload }, 1 + 20 + payload_len))
            }
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trips() {
        let frame = Frame::Data { stream_id: 7, sequence: 42, fin: true, payload: b"hello" };
        let encoded = frame.encode();
        let (decoded, consumed) = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn ack_frame_round_trips() {
        let frame = Frame::Ack { stream_id: 1, ack: 100, bitmap: 0xFF00 };
        let encoded = frame.encode();
        let (decoded, _) = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn control_frame_round_trips() {
        let frame = Frame::Control { kind: 9, payload: b"ctl" };
        let encoded = frame.encode();
        let (decoded, _) = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn heartbeat_frame_round_trips() {
        let frame = Frame::Heartbeat { timestamp_ms: 12345, sequence: 9, payload: b"ping" };
        let encoded = frame.encode();
        let (decoded, _) = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn truncated_buffer_rejected() {
        let frame = Frame::Data { stream_id: 1, sequence: 1, fin: false, payload: b"x" };
        let encoded = frame.encode();
        assert!(Frame::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn unknown_kind_rejected() {
        assert_eq!(Frame::decode(&[0xFF]), Err(FrameError::UnknownType(0xFF)));
    }

    #[test]
    fn fragment_sequence_round_trips() {
        let seq = Frame::fragment_sequence(7, 3);
        assert_eq!(Frame::split_fragment_sequence(seq), (7, 3));
    }

    #[test]
    fn zero_copy_payload_borrows_input() {
        let frame = Frame::Data { stream_id: 1, sequence: 1, fin: false, payload: b"zero-copy" };
        let encoded = frame.encode();
        let (decoded, _) = Frame::decode(&encoded).unwrap();
        if let Frame::Data { payload, .. } = decoded {
            assert_eq!(payload.as_ptr(), &encoded[encoded.len() - payload.len()] as *const u8);
        } else {
            panic!("expected data frame");
        }
    }
}
