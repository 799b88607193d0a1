//! Codec for framed IO over the data channel.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CouchbaseError, Result};

use super::frame::OperationFrame;

/// Codec for encoding and decoding operation frames.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed IO. The codec is stateless; partial frames simply
/// stay in the read buffer until more bytes arrive.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new codec instance.
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<OperationFrame> for FrameCodec {
    type Error = CouchbaseError;

    fn encode(&mut self, item: OperationFrame, dst: &mut BytesMut) -> Result<()> {
        item.write_to(dst);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = OperationFrame;
    type Error = CouchbaseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        OperationFrame::read_from(src)
    }
}
