use super::{DEFAULT_MAX_FRAME_LEN, Tagged, Transport, TransportError, Unpacked, check_server_error};

/// [MTProto Abridged] framing.
///
/// Send `0xef` once on connect, then each packet is
/// `[length/4 as 1 or 4 bytes][payload]`.
///
/// [MTProto Abridged]: https://core.telegram.org/mtproto/mtproto-transports#abridged
#[derive(Debug)]
pub struct Abridged {
    max_frame_len: usize,
}

impl Abridged {
    /// Framing with [`DEFAULT_MAX_FRAME_LEN`](super::DEFAULT_MAX_FRAME_LEN).
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Framing that refuses payloads longer than `max_frame_len`.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for Abridged {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for Abridged {
    fn init(&mut self, out: &mut Vec<u8>) {
        out.push(0xef);
    }

    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        debug_assert_eq!(payload.len() % 4, 0);
        let words = payload.len() / 4;
        if words < 0x7f {
            out.push(words as u8);
        } else {
            out.extend([
                0x7f,
                (words & 0xff) as u8,
                ((words >> 8) & 0xff) as u8,
                ((words >> 16) & 0xff) as u8,
            ]);
        }
        out.extend_from_slice(payload);
    }

    fn unpack(&mut self, buffer: &mut [u8]) -> Result<Unpacked, TransportError> {
        let Some(&first) = buffer.first() else {
            return Err(TransportError::MissingBytes(1));
        };
        let (words, header) = if first < 0x7f {
            (first as usize, 1)
        } else {
            if buffer.len() < 4 {
                return Err(TransportError::MissingBytes(4 - buffer.len()));
            }
            let w = buffer[1] as usize | (buffer[2] as usize) << 8 | (buffer[3] as usize) << 16;
            (w, 4)
        };

        let len = words * 4;
        if len > self.max_frame_len {
            return Err(TransportError::FrameTooLarge { len, max: self.max_frame_len });
        }
        let end = header + len;
        if buffer.len() < end {
            return Err(TransportError::MissingBytes(end - buffer.len()));
        }
        check_server_error(&buffer[header..end])?;
        Ok(Unpacked { data_start: header, data_end: end, next_offset: end })
    }
}

impl Tagged for Abridged {
    const TAG: [u8; 4] = [0xef; 4];
}
