use crate::errors::WorkerError;
use salvage_protocol::{Envelope, NdJsonCodec};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, NdJsonCodec<Envelope>>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, NdJsonCodec<Envelope>>;

pub(crate) async fn connect(addr: &str) -> Result<(FrameReader, FrameWriter), WorkerError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| WorkerError::Connection(e.to_string()))?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        FramedRead::new(read_half, NdJsonCodec::new()),
        FramedWrite::new(write_half, NdJsonCodec::new()),
    ))
}
