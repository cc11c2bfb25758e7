//! Integrity pipeline: SHA-256 computed in lock-step with the I/O copy.
//!
//! [`HashingReader`] wraps the byte source feeding the object store. Every
//! block the store adapter pulls is folded into a running hasher before the
//! adapter sees `Poll::Ready`, so a single traversal yields both the stored
//! bytes and their digest. Memory use is the hash state plus whatever block
//! the caller reads into — nothing is re-read or buffered here.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Shared handle onto the running digest. Survives the reader being consumed
/// by the store adapter; the orchestrator keeps a clone and reads the result
/// once the stream is closed.
#[derive(Clone)]
pub struct DigestHandle {
    inner: Arc<DigestState>,
}

struct DigestState {
    hasher: Mutex<Sha256>,
    bytes: AtomicU64,
}

impl DigestHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(DigestState {
                hasher: Mutex::new(Sha256::new()),
                bytes: AtomicU64::new(0),
            }),
        }
    }

    fn update(&self, data: &[u8]) {
        self.inner.hasher.lock().update(data);
        self.inner.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
    }

    /// Hex digest and byte count observed so far. The hasher state is cloned,
    /// so this can be called mid-stream without disturbing the pipeline.
    pub fn snapshot(&self) -> (String, u64) {
        let digest = self.inner.hasher.lock().clone().finalize();
        (hex::encode(digest), self.inner.bytes.load(Ordering::Relaxed))
    }
}

/// Tee construct: an `AsyncRead` that feeds every byte it yields into a
/// running SHA-256.
pub struct HashingReader<R> {
    reader: R,
    digest: DigestHandle,
}

impl<R: AsyncRead + Unpin> HashingReader<R> {
    /// Wrap `reader`; the returned handle observes everything read through it.
    pub fn new(reader: R) -> (Self, DigestHandle) {
        let digest = DigestHandle::new();
        (
            Self {
                reader,
                digest: digest.clone(),
            },
            digest,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.reader).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled();
                if filled.len() > before {
                    this.digest.update(&filled[before..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Drain `reader` through a fixed-size block, returning `(sha256_hex, bytes)`.
///
/// Used to re-verify committed objects by streaming them back from the store.
pub async fn hash_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    block_size: usize,
) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    let mut buf = vec![0u8; block_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// SHA-256 of an in-memory slice, hex-encoded. Test and notifier helper.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
