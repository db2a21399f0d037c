//! Bidirectional byte-pump between an inbound socket and a relay stream.
//!
//! Each direction is driven as an independent poll-based state machine within
//! a single future, so back-pressure on one direction never stalls the other.
//! The pump terminates as soon as *either* direction reaches end-of-stream or
//! errors; the finishing direction's writer is shut down first, the other
//! direction is abandoned and closed when the caller drops both streams.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// State machine for one-directional copy with flush.
enum CopyState {
    Reading,
    Writing(usize, usize), // (pos, len)
    Flushing(usize),       // bytes being flushed
    ShuttingDown,
    Done,
}

/// Result of polling one copy direction.
enum CopyPoll {
    /// Data was flushed — contains byte count.
    Flushed(usize),
    /// Direction finished (EOF + shutdown).
    Finished,
}

/// Poll-driven one-directional copy: read → write → flush.
fn poll_copy_direction<R, W>(
    cx: &mut Context<'_>,
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    state: &mut CopyState,
) -> Poll<io::Result<CopyPoll>>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        match state {
            CopyState::Reading => {
                let mut read_buf = ReadBuf::new(buf);
                match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            *state = CopyState::ShuttingDown;
                        } else {
                            *state = CopyState::Writing(0, n);
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            CopyState::Writing(pos, len) => {
                match Pin::new(&mut *writer).poll_write(cx, &buf[*pos..*len]) {
                    Poll::Ready(Ok(n)) => {
                        *pos += n;
                        if *pos >= *len {
                            *state = CopyState::Flushing(*len);
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            CopyState::Flushing(bytes) => {
                let bytes = *bytes;
                match Pin::new(&mut *writer).poll_flush(cx) {
                    Poll::Ready(Ok(())) => {
                        *state = CopyState::Reading;
                        return Poll::Ready(Ok(CopyPoll::Flushed(bytes)));
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            CopyState::ShuttingDown => match Pin::new(&mut *writer).poll_shutdown(cx) {
                Poll::Ready(_) => {
                    *state = CopyState::Done;
                    return Poll::Ready(Ok(CopyPoll::Finished));
                }
                Poll::Pending => return Poll::Pending,
            },
            CopyState::Done => return Poll::Ready(Ok(CopyPoll::Finished)),
        }
    }
}

/// Pump bytes between `a` and `b` until either direction ends.
///
/// Returns the byte counts copied a→b and b→a. The first direction to reach
/// EOF or error wins; the other direction is not drained. Both streams should
/// be dropped by the caller afterwards, which closes them.
pub async fn pump<A, B>(a: A, b: B, buffer_size: usize) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_r, mut a_w) = tokio::io::split(a);
    let (mut b_r, mut b_w) = tokio::io::split(b);

    let mut buf_ab = vec![0u8; buffer_size];
    let mut buf_ba = vec![0u8; buffer_size];
    let mut state_ab = CopyState::Reading;
    let mut state_ba = CopyState::Reading;
    let mut bytes_ab: u64 = 0;
    let mut bytes_ba: u64 = 0;

    std::future::poll_fn(|cx| {
        // Drive each direction until it parks; either finishing ends the pump.
        loop {
            match poll_copy_direction(cx, &mut a_r, &mut b_w, &mut buf_ab, &mut state_ab) {
                Poll::Ready(Ok(CopyPoll::Flushed(n))) => {
                    bytes_ab += n as u64;
                    continue;
                }
                Poll::Ready(Ok(CopyPoll::Finished)) => return Poll::Ready(Ok(())),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }

        loop {
            match poll_copy_direction(cx, &mut b_r, &mut a_w, &mut buf_ba, &mut state_ba) {
                Poll::Ready(Ok(CopyPoll::Flushed(n))) => {
                    bytes_ba += n as u64;
                    continue;
                }
                Poll::Ready(Ok(CopyPoll::Finished)) => return Poll::Ready(Ok(())),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }

        Poll::Pending
    })
    .await?;

    Ok((bytes_ab, bytes_ba))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn pump_copies_both_directions() {
        let (client, near) = duplex(1024);
        let (far, target) = duplex(1024);

        let handle = tokio::spawn(async move { pump(near, far, 1024).await });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut target_r, mut target_w) = tokio::io::split(target);

        client_w.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = target_r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        target_w.write_all(b"world").await.unwrap();
        let n = client_r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");

        // Closing the client side ends the pump.
        client_w.shutdown().await.unwrap();
        let (ab, _ba) = handle.await.unwrap().unwrap();
        assert_eq!(ab, 5);
    }

    #[tokio::test]
    async fn pump_ends_on_first_eof() {
        let (client, near) = duplex(1024);
        let (far, target) = duplex(1024);

        let handle = tokio::spawn(async move { pump(near, far, 1024).await });

        // Target closes immediately without the client ever writing.
        drop(target);
        handle.await.unwrap().unwrap();
        drop(client);
    }

    #[tokio::test]
    async fn pump_counts_bytes() {
        let (client, near) = duplex(1024);
        let (far, target) = duplex(1024);

        let handle = tokio::spawn(async move { pump(near, far, 8).await });

        let (_client_r, mut client_w) = tokio::io::split(client);
        let (mut target_r, _target_w) = tokio::io::split(target);

        let payload = vec![7u8; 100];
        client_w.write_all(&payload).await.unwrap();

        let mut got = Vec::new();
        while got.len() < 100 {
            let mut buf = [0u8; 32];
            let n = target_r.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, payload);

        client_w.shutdown().await.unwrap();
        let (ab, ba) = handle.await.unwrap().unwrap();
        assert_eq!(ab, 100);
        assert_eq!(ba, 0);
    }
}
