//! Compressed byte-pump: gzip toward the parent, gunzip toward the local side.
//!
//! The encoder is flushed after every chunk so interactive traffic is not
//! held back by the compressor's internal buffering. Like the plain pump, the
//! first direction to finish wins; the losing direction is dropped mid-flight
//! and both streams close when the caller drops them.

use std::io;

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Pump bytes between `local` and `stream`, compressing local→stream and
/// decompressing stream→local.
pub async fn pump_compressed<A, B>(local: A, stream: B, buffer_size: usize) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_r, mut local_w) = tokio::io::split(local);
    let (stream_r, stream_w) = tokio::io::split(stream);

    let mut encoder = GzipEncoder::new(stream_w);
    let mut decoder = GzipDecoder::new(BufReader::new(stream_r));

    let upstream = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = local_r.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            encoder.write_all(&buf[..n]).await?;
            encoder.flush().await?;
        }
        encoder.shutdown().await?;
        io::Result::Ok(())
    };

    let downstream = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = decoder.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            local_w.write_all(&buf[..n]).await?;
        }
        local_w.shutdown().await?;
        io::Result::Ok(())
    };

    // First direction to finish (or fail) ends the relay.
    tokio::select! {
        res = upstream => res,
        res = downstream => res,
    }
}
