use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{peek_header, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Upper bound for a reassembled logical packet (MariaDB max_allowed_packet)
pub const MAX_LOGICAL_PACKET: usize = 1 << 30;

/// Errors raised while framing packets
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of order continuation frame: expected sequence {expected}, got {actual}")]
    Sequence { expected: u8, actual: u8 },

    #[error("Packet of {0} bytes exceeds the maximum allowed size")]
    TooLarge(usize),
}

/// MySQL packet codec for use with tokio Framed.
///
/// By default continuation frames are concatenated into one logical packet.
/// [`PacketCodec::frames`] yields every wire frame separately, which lets the
/// client state machine check the sequence of each continuation frame.
#[derive(Debug)]
pub struct PacketCodec {
    reassemble: bool,
    partial: Option<Partial>,
}

#[derive(Debug)]
struct Partial {
    sequence_id: u8,
    next_sequence: u8,
    payload: BytesMut,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            reassemble: true,
            partial: None,
        }
    }
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that yields one item per wire frame
    pub fn frames() -> Self {
        Self {
            reassemble: false,
            partial: None,
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.reassemble {
            return Ok(Packet::decode(src));
        }

        loop {
            let Some((len, seq)) = peek_header(src) else {
                return Ok(None);
            };
            if src.len() < PACKET_HEADER_SIZE + len {
                src.reserve(PACKET_HEADER_SIZE + len - src.len());
                return Ok(None);
            }

            let frame = match Packet::decode(src) {
                Some(frame) => frame,
                None => return Ok(None),
            };

            match self.partial.take() {
                None if len < MAX_PACKET_SIZE => return Ok(Some(frame)),
                None => {
                    let mut payload = BytesMut::with_capacity(MAX_PACKET_SIZE * 2);
                    payload.extend_from_slice(&frame.payload);
                    self.partial = Some(Partial {
                        sequence_id: seq,
                        next_sequence: seq.wrapping_add(1),
                        payload,
                    });
                }
                Some(mut partial) => {
                    if seq != partial.next_sequence {
                        return Err(CodecError::Sequence {
                            expected: partial.next_sequence,
                            actual: seq,
                        });
                    }
                    if partial.payload.len() + len > MAX_LOGICAL_PACKET {
                        return Err(CodecError::TooLarge(partial.payload.len() + len));
                    }
                    partial.payload.extend_from_slice(&frame.payload);
                    partial.next_sequence = seq.wrapping_add(1);

                    if len < MAX_PACKET_SIZE {
                        let payload: Bytes = partial.payload.freeze();
                        return Ok(Some(Packet::new(partial.sequence_id, payload)));
                    }
                    self.partial = Some(partial);
                }
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}
