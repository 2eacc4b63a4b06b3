//! Frame codec: `op_code:u16 | entity_id:33 | payload_len:u32 | payload`,
//! all big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use opmesh_base::Id;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// Frames above this size are refused on both sides.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

const HEADER_LEN: usize = 2 + Id::LEN + 4;

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub op_code: u16,
    pub entity_id: Id,
    pub payload: Bytes,
}

/// Codec for [`Frame`]s over any byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(Error::MalformedEncoding);
        }
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u16(frame.op_code);
        dst.put_slice(frame.entity_id.as_bytes());
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let payload_len =
            u32::from_be_bytes(src[2 + Id::LEN..HEADER_LEN].try_into().expect("sized")) as usize;
        if payload_len > MAX_FRAME_SIZE {
            return Err(Error::MalformedEncoding);
        }
        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }
        let op_code = src.get_u16();
        let mut id_bytes = [0u8; Id::LEN];
        src.copy_to_slice(&mut id_bytes);
        let entity_id = Id::from_bytes(id_bytes);
        let _ = src.get_u32();
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Frame {
            op_code,
            entity_id,
            payload,
        }))
    }
}
