//! Payload stream type and chunked transfer.
//!
//! [`split`] cuts a payload into consecutive, non-overlapping chunks for upload. The chunks are
//! produced lazily as zero-copy slices of the payload, and calling [`split`] again on the same
//! inputs yields byte-identical chunks. [`reassemble`] is the inverse for download streams and
//! doubles as the correctness check of a transfer.

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};

use crate::error::{Error, Result};

/// Type alias for data streams passed to and returned from object storage backends.
pub type PayloadStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Lazy sequence of upload chunks, created by [`split`].
#[derive(Clone, Debug)]
pub struct Chunks {
    payload: Bytes,
    chunk_size: usize,
    offset: usize,
}

/// Splits `payload` into chunks of `chunk_size` bytes.
///
/// Chunk `i` covers `[i * chunk_size, min((i + 1) * chunk_size, len))`. The last chunk may be
/// shorter, and an empty payload produces no chunks.
///
/// # Panics
///
/// Panics if `chunk_size` is zero.
pub fn split(payload: &Bytes, chunk_size: usize) -> Chunks {
    assert!(chunk_size > 0, "chunk size must be positive");
    Chunks {
        payload: payload.clone(),
        chunk_size,
        offset: 0,
    }
}

impl Chunks {
    /// Converts the chunks into a [`PayloadStream`] that yields one chunk per poll.
    pub fn into_stream(self) -> PayloadStream {
        futures_util::stream::iter(self.map(Ok)).boxed()
    }
}

impl Iterator for Chunks {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let end = self
            .offset
            .saturating_add(self.chunk_size)
            .min(self.payload.len());
        let chunk = self.payload.slice(self.offset..end);
        self.offset = end;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.payload.len() - self.offset).div_ceil(self.chunk_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Chunks {}

/// Collects a chunk stream back into a single payload.
///
/// Fails with [`Error::SizeMismatch`] if the total length differs from `expected_len`.
pub async fn reassemble(mut stream: PayloadStream, expected_len: u64) -> Result<Bytes> {
    let mut payload = BytesMut::with_capacity(usize::try_from(expected_len).unwrap_or(0));
    while let Some(chunk) = stream.try_next().await.map_err(|err| Error::Operation {
        context: "reading object stream".into(),
        source: err.into(),
    })? {
        payload.extend_from_slice(&chunk);
    }

    let actual = payload.len() as u64;
    if actual != expected_len {
        return Err(Error::SizeMismatch {
            expected: expected_len,
            actual,
        });
    }
    Ok(payload.freeze())
}

/// Creates a [`PayloadStream`] from a byte slice.
#[cfg(test)]
pub(crate) fn make_stream(contents: &[u8]) -> PayloadStream {
    let chunk: std::io::Result<Bytes> = Ok(Bytes::copy_from_slice(contents));
    futures_util::stream::iter([chunk]).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_chunk_is_partial() {
        let payload = Bytes::from_static(b"0123456789");
        let chunks: Vec<_> = split(&payload, 4).collect();
        assert_eq!(chunks, [&b"0123"[..], b"4567", b"89"]);
    }

    #[test]
    fn chunk_larger_than_payload() {
        let payload = Bytes::from_static(b"abc");
        let chunks: Vec<_> = split(&payload, 1024).collect();
        assert_eq!(chunks, [&b"abc"[..]]);
    }

    #[test]
    fn empty_payload_has_no_chunks() {
        assert_eq!(split(&Bytes::new(), 8).count(), 0);
    }

    #[test]
    fn split_is_restartable() {
        let payload = Bytes::from((0..=255u8).cycle().take(1000).collect::<Vec<_>>());
        let first: Vec<_> = split(&payload, 64).collect();
        let second: Vec<_> = split(&payload, 64).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn chunk_count_matches_ceiling() {
        let payload = Bytes::from(vec![7u8; 1000]);
        for chunk_size in [1, 3, 7, 100, 999, 1000, 1001] {
            let chunks = split(&payload, chunk_size);
            assert_eq!(chunks.len(), 1000usize.div_ceil(chunk_size));
            let total: usize = chunks.map(|c| c.len()).sum();
            assert_eq!(total, 1000);
        }
    }

    #[tokio::test]
    async fn reassemble_round_trip() {
        let payload = Bytes::from((0..5000u32).map(|i| i as u8).collect::<Vec<_>>());
        for chunk_size in [1, 13, 4096, 5000, 8192] {
            let stream = split(&payload, chunk_size).into_stream();
            let restored = reassemble(stream, payload.len() as u64).await.unwrap();
            assert_eq!(restored, payload);
        }
    }

    #[tokio::test]
    async fn reassemble_detects_size_mismatch() {
        let result = reassemble(make_stream(b"short"), 10).await;
        assert!(matches!(
            result,
            Err(Error::SizeMismatch {
                expected: 10,
                actual: 5
            })
        ));
    }
}
