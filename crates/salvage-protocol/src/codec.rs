use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Newline-delimited JSON framing: one message per line, bounded by a
/// configurable frame size. An oversized frame is an `InvalidData` error,
/// which is terminal for the connection.
#[derive(Debug)]
pub struct NdJsonCodec<T> {
    max_frame_bytes: usize,
    marker: PhantomData<T>,
}

impl<T> NdJsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            marker: PhantomData,
        }
    }
}

impl<T> NdJsonCodec<T> {
    /// Detaches the next newline-terminated frame from the buffer, with the
    /// line ending and any trailing whitespace stripped. `None` means more
    /// bytes are needed; a frame past the size limit is an error. A frame
    /// that was nothing but whitespace comes back empty.
    fn split_frame(&self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
        let end = match src.iter().position(|&byte| byte == b'\n') {
            Some(end) => end,
            None if src.len() > self.max_frame_bytes => {
                return Err(oversize(src.len(), self.max_frame_bytes));
            }
            None => return Ok(None),
        };
        if end >= self.max_frame_bytes {
            return Err(oversize(end, self.max_frame_bytes));
        }

        let mut frame = src.split_to(end + 1);
        let trailing = frame
            .iter()
            .rev()
            .take_while(|byte| byte.is_ascii_whitespace())
            .count();
        frame.truncate(frame.len() - trailing);
        Ok(Some(frame))
    }
}

impl<T> Default for NdJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Encoder<T> for NdJsonCodec<T>
where
    T: Serialize,
{
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if body.len() + 1 > self.max_frame_bytes {
            return Err(oversize(body.len() + 1, self.max_frame_bytes));
        }
        dst.reserve(body.len() + 1);
        dst.extend_from_slice(&body);
        dst.put_u8(b'\n');
        Ok(())
    }
}

impl<T> Decoder for NdJsonCodec<T>
where
    T: DeserializeOwned,
{
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(frame) = self.split_frame(src)? else {
                return Ok(None);
            };
            if frame.is_empty() {
                continue;
            }
            return serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
        }
    }
}

fn oversize(len: usize, limit: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds the {limit} byte limit"),
    )
}
