use super::{DEFAULT_MAX_FRAME_LEN, Tagged, Transport, TransportError, Unpacked, check_server_error};

/// [MTProto Intermediate] framing: `0xeeeeeeee` once, then
/// `[length as u32 LE][payload]` per packet.
///
/// [MTProto Intermediate]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
#[derive(Debug)]
pub struct Intermediate {
    max_frame_len: usize,
}

impl Intermediate {
    /// Framing with [`DEFAULT_MAX_FRAME_LEN`](super::DEFAULT_MAX_FRAME_LEN).
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Framing that refuses payloads longer than `max_frame_len`.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for Intermediate {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for Intermediate {
    fn init(&mut self, out: &mut Vec<u8>) {
        out.extend([0xee; 4]);
    }

    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        out.extend((payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }

    fn unpack(&mut self, buffer: &mut [u8]) -> Result<Unpacked, TransportError> {
        if buffer.len() < 4 {
            return Err(TransportError::MissingBytes(4 - buffer.len()));
        }
        // The top bit flags a quick ack; the length lives in the rest.
        let raw = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) & 0x7fff_ffff;
        let len = raw as usize;
        if len > self.max_frame_len {
            return Err(TransportError::FrameTooLarge { len, max: self.max_frame_len });
        }
        let end = 4 + len;
        if buffer.len() < end {
            return Err(TransportError::MissingBytes(end - buffer.len()));
        }
        check_server_error(&buffer[4..end])?;
        Ok(Unpacked { data_start: 4, data_end: end, next_offset: end })
    }
}

impl Tagged for Intermediate {
    const TAG: [u8; 4] = [0xee; 4];
}
