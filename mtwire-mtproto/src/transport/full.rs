use super::{DEFAULT_MAX_FRAME_LEN, Transport, TransportError, Unpacked, check_server_error};

/// [MTProto Full] framing: `[len][seq][payload][crc32]`, no init bytes.
///
/// `len` counts the whole frame (12 bytes of overhead plus the payload),
/// `seq` counts frames per direction from 0 and the CRC-32 covers
/// everything before it.
///
/// [MTProto Full]: https://core.telegram.org/mtproto/mtproto-transports#full
#[derive(Debug)]
pub struct Full {
    send_seq: i32,
    recv_seq: i32,
    max_frame_len: usize,
}

impl Full {
    /// Framing with [`DEFAULT_MAX_FRAME_LEN`](super::DEFAULT_MAX_FRAME_LEN).
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Framing that refuses payloads longer than `max_frame_len`.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { send_seq: 0, recv_seq: 0, max_frame_len }
    }
}

impl Default for Full {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for Full {
    fn init(&mut self, _out: &mut Vec<u8>) {}

    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        out.extend(((payload.len() + 12) as u32).to_le_bytes());
        out.extend(self.send_seq.to_le_bytes());
        out.extend_from_slice(payload);
        let crc = crc32fast::hash(&out[start..]);
        out.extend(crc.to_le_bytes());
        self.send_seq += 1;
    }

    fn unpack(&mut self, buffer: &mut [u8]) -> Result<Unpacked, TransportError> {
        if buffer.len() < 4 {
            return Err(TransportError::MissingBytes(4 - buffer.len()));
        }
        let raw = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        if raw < 12 {
            return Err(TransportError::BadLen { len: raw });
        }
        let len = raw as usize;
        if len - 12 > self.max_frame_len {
            return Err(TransportError::FrameTooLarge { len: len - 12, max: self.max_frame_len });
        }
        if buffer.len() < len {
            return Err(TransportError::MissingBytes(len - buffer.len()));
        }

        let seq = i32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        if seq != self.recv_seq {
            return Err(TransportError::BadSeq { expected: self.recv_seq, got: seq });
        }

        let crc_at = len - 4;
        let expected = crc32fast::hash(&buffer[..crc_at]);
        let got = u32::from_le_bytes([
            buffer[crc_at],
            buffer[crc_at + 1],
            buffer[crc_at + 2],
            buffer[crc_at + 3],
        ]);
        if expected != got {
            return Err(TransportError::BadCrc { expected, got });
        }

        self.recv_seq += 1;
        check_server_error(&buffer[8..crc_at])?;
        Ok(Unpacked { data_start: 8, data_end: crc_at, next_offset: len })
    }
}
