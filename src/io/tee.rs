//! Reference-counted fan-out of one byte stream to several readers.
//!
//! The producer side owns a bounded pool of fixed-size buffers. Each read
//! from the source fills one buffer, which is then shared with every reader
//! through an `Arc`; the payload bytes are never copied per reader. When
//! the last holder drops its reference the buffer returns to the free pool.
//! The pool is the backpressure: once the slowest reader sits on every
//! buffer, the producer blocks until one comes back.
//!
//! The pool must hold more buffers than there are readers, otherwise the
//! producer can starve itself while every reader legitimately holds one
//! buffer each.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;

/// Default number of pooled buffers.
pub const DEFAULT_BUFFER_COUNT: usize = 8;
/// Default size of each pooled buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// One filled buffer, shared across readers. The last drop returns the
/// allocation to the free pool.
struct Chunk {
    data: Box<[u8]>,
    len: usize,
    pool: mpsc::UnboundedSender<Box<[u8]>>,
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        // If the producer is gone the pool is gone too; the buffer is then
        // simply freed.
        let _ = self.pool.send(data);
    }
}

#[derive(Clone)]
enum TeeMessage {
    Data(Arc<Chunk>),
    Eof,
    Error(io::ErrorKind, String),
}

/// Producer half of the fan-out. Created together with its readers by
/// [`Tee::new`]; consumed by [`Tee::run`].
pub struct Tee {
    readers: Vec<mpsc::Sender<TeeMessage>>,
    pool_tx: mpsc::UnboundedSender<Box<[u8]>>,
    pool_rx: mpsc::UnboundedReceiver<Box<[u8]>>,
}

impl Tee {
    /// Create a tee with `reader_count` downstream readers and default
    /// buffer dimensions.
    pub fn new(reader_count: usize) -> (Self, Vec<TeeReader>) {
        Self::with_buffers(reader_count, DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE)
    }

    /// Create a tee with explicit buffer dimensions. The pool is sized to
    /// at least `reader_count + 1` buffers regardless of `buffer_count`.
    pub fn with_buffers(
        reader_count: usize,
        buffer_count: usize,
        buffer_size: usize,
    ) -> (Self, Vec<TeeReader>) {
        let buffer_count = buffer_count.max(reader_count + 1);
        let buffer_size = buffer_size.max(1);

        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        for _ in 0..buffer_count {
            let _ = pool_tx.send(vec![0u8; buffer_size].into_boxed_slice());
        }

        let mut senders = Vec::with_capacity(reader_count);
        let mut readers = Vec::with_capacity(reader_count);
        for _ in 0..reader_count {
            // One slot above the pool size so the final Eof/Error marker
            // can always be enqueued without waiting on a reader.
            let (tx, rx) = mpsc::channel(buffer_count + 1);
            senders.push(tx);
            readers.push(TeeReader {
                rx,
                current: None,
                done: false,
                error: None,
            });
        }

        (
            Self {
                readers: senders,
                pool_tx,
                pool_rx,
            },
            readers,
        )
    }

    /// Pump `input` to every reader until end of stream, a read error
    /// (delivered to every reader), or every reader has been closed.
    pub async fn run<R: AsyncRead + Unpin>(mut self, mut input: R) {
        loop {
            if self.readers.iter().all(mpsc::Sender::is_closed) {
                return;
            }
            let Some(mut buf) = self.pool_rx.recv().await else {
                return;
            };
            match input.read(&mut buf[..]).await {
                Ok(0) => {
                    let _ = self.pool_tx.send(buf);
                    self.broadcast(TeeMessage::Eof).await;
                    return;
                }
                Err(e) => {
                    let _ = self.pool_tx.send(buf);
                    self.broadcast(TeeMessage::Error(e.kind(), e.to_string()))
                        .await;
                    return;
                }
                Ok(n) => {
                    let chunk = Arc::new(Chunk {
                        data: buf,
                        len: n,
                        pool: self.pool_tx.clone(),
                    });
                    for tx in &self.readers {
                        // A closed reader rejects the offer; the rejected
                        // clone is dropped, releasing its reference.
                        let _ = tx.send(TeeMessage::Data(Arc::clone(&chunk))).await;
                    }
                    // The producer's own hold ends here; the buffer is
                    // recycled once every reader is done with it.
                }
            }
        }
    }

    async fn broadcast(&self, msg: TeeMessage) {
        for tx in &self.readers {
            let _ = tx.send(msg.clone()).await;
        }
    }
}

/// One independent reader of a [`Tee`]. Observes the produced bytes in
/// order; reaches end of stream only after the producer's EOF marker and
/// everything queued before it have been consumed.
pub struct TeeReader {
    rx: mpsc::Receiver<TeeMessage>,
    /// Buffer currently being consumed and the offset into it.
    current: Option<(Arc<Chunk>, usize)>,
    done: bool,
    error: Option<(io::ErrorKind, String)>,
}

impl TeeReader {
    /// Close this reader early: further offers from the producer are
    /// rejected and every queued buffer is released immediately.
    pub fn close(&mut self) {
        self.rx.close();
        self.current = None;
        while self.rx.try_recv().is_ok() {}
        self.done = true;
    }
}

impl AsyncRead for TeeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some((chunk, offset)) = &mut this.current {
                let remaining = &chunk.data[*offset..chunk.len];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                *offset += n;
                if *offset == chunk.len {
                    this.current = None;
                }
                return Poll::Ready(Ok(()));
            }
            if let Some((kind, msg)) = this.error.take() {
                this.done = true;
                return Poll::Ready(Err(io::Error::new(kind, msg)));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(TeeMessage::Data(chunk))) => {
                    if chunk.len > 0 {
                        this.current = Some((chunk, 0));
                    }
                }
                Poll::Ready(Some(TeeMessage::Eof)) | Poll::Ready(None) => {
                    this.done = true;
                }
                Poll::Ready(Some(TeeMessage::Error(kind, msg))) => {
                    this.error = Some((kind, msg));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_every_reader_sees_the_full_stream() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let (tee, readers) = Tee::with_buffers(3, 4, 64);

        let mut joins = Vec::new();
        for mut r in readers {
            joins.push(tokio::spawn(async move {
                let mut out = Vec::new();
                r.read_to_end(&mut out).await.unwrap();
                out
            }));
        }
        tee.run(payload.as_slice()).await;

        for j in joins {
            assert_eq!(j.await.unwrap(), payload);
        }
    }

    #[tokio::test]
    async fn test_single_reader_passthrough() {
        let (tee, mut readers) = Tee::new(1);
        let producer = tokio::spawn(async move { tee.run(&b"hello tee"[..]).await });
        let mut out = Vec::new();
        readers[0].read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello tee");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_reader_does_not_block_the_rest() {
        let payload = vec![b'A'; 2048];
        let (tee, mut readers) = Tee::with_buffers(2, 3, 32);
        let mut slow = readers.pop().unwrap();
        let mut live = readers.pop().unwrap();
        slow.close();

        let producer = tokio::spawn(async move { tee.run(payload.as_slice()).await });
        let mut out = Vec::new();
        live.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 2048);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_producer_exits_when_all_readers_close() {
        let (tee, readers) = Tee::new(2);
        drop(readers);
        // An endless source would block forever if the tee kept pumping.
        let endless = tokio::io::repeat(b'x');
        tokio::time::timeout(std::time::Duration::from_secs(5), tee.run(endless))
            .await
            .expect("tee did not stop after all readers closed");
    }

    #[tokio::test]
    async fn test_error_is_delivered_to_readers() {
        struct Failing;
        impl AsyncRead for Failing {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "snapped")))
            }
        }
        let (tee, mut readers) = Tee::new(1);
        let producer = tokio::spawn(async move { tee.run(Failing).await });
        let mut out = Vec::new();
        let err = readers[0].read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        producer.await.unwrap();
    }
}
