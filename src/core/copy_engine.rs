//! Block-wise streaming copy onto a random-access disk.
//!
//! Sources are read in fixed-size blocks. Blocks made entirely of zero bytes
//! are never written: the destination is a freshly provisioned disk that
//! already reads back as zeros, so skipping them is equivalent to writing
//! them. Non-zero blocks are written at the exact offset they were read from.

use std::fmt;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::events::TransferEvent;
use crate::error::{Result, TransferError};
use crate::logging::LogThrottle;

/// Size of one transfer block (2 MiB).
pub const BLOCK_SIZE: usize = 2 * 1024 * 1024;

const DEFAULT_BLOCK_SIZE: NonZeroUsize = match NonZeroUsize::new(BLOCK_SIZE) {
    Some(size) => size,
    None => panic!("BLOCK_SIZE must be non-zero"),
};

/// How often per-block progress is written to the log.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Digest of a copied or verified disk image.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Digest(*hash.as_bytes())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Running hash over the blocks of a transfer.
///
/// Intermediate blocks go through [`BlockHasher::absorb`]. The final read is
/// always handed to [`BlockHasher::finish`], which splits it in two and feeds
/// both halves as separate updates, the second one finalizing. This holds even
/// when the final read is empty, so a digest always exists.
pub(crate) struct BlockHasher {
    hasher: blake3::Hasher,
}

impl BlockHasher {
    pub(crate) fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    pub(crate) fn absorb(&mut self, block: &[u8]) {
        self.hasher.update(block);
    }

    pub(crate) fn finish(mut self, last: &[u8]) -> Digest {
        let (head, tail) = last.split_at(last.len() / 2);
        self.hasher.update(head);
        self.hasher.update(tail);
        self.hasher.finalize().into()
    }
}

/// True when every byte of the block is zero.
pub(crate) fn is_zeros(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
pub(crate) fn read_block<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Bytes to read next: what remains, capped at the buffer length.
///
/// `remaining` may exceed `usize::MAX` on 32-bit targets.
pub(crate) fn next_read_len(remaining: u64, buffer_len: usize) -> usize {
    usize::try_from(remaining).map_or(buffer_len, |r| r.min(buffer_len))
}

/// Number of bytes between the current position and the end of the stream.
pub(crate) fn remaining_len<S: Seek + ?Sized>(stream: &mut S) -> io::Result<u64> {
    let current = stream.stream_position()?;
    let end = stream.seek(SeekFrom::End(0))?;
    if end != current {
        stream.seek(SeekFrom::Start(current))?;
    }
    Ok(end.saturating_sub(current))
}

/// Copies streams block by block and keeps the byte counters of the transfer.
///
/// A copier is owned by a single transfer and driven sequentially: `copy` (or
/// `wim_copy`) followed by an optional `verify`, which re-reads exactly as many
/// bytes as the preceding copy wrote.
pub struct StreamCopier {
    buffer: Vec<u8>,
    cancel: CancellationToken,
    bytes_copied: u64,
    bytes_total: u64,
}

impl StreamCopier {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE, cancel)
    }

    /// Create a copier with a non-default block size.
    pub fn with_block_size(block_size: NonZeroUsize, cancel: CancellationToken) -> Self {
        Self {
            buffer: vec![0u8; block_size.get()],
            cancel,
            bytes_copied: 0,
            bytes_total: 0,
        }
    }

    /// Bytes copied by the last operation.
    pub fn position(&self) -> u64 {
        self.bytes_copied
    }

    /// Total bytes of the last operation's source.
    pub fn length(&self) -> u64 {
        self.bytes_total
    }

    pub fn block_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Copy `source` onto `destination`, skipping all-zero blocks.
    ///
    /// Reads from the source's current position to its end. Returns the digest
    /// of the copied data when `compute_hash` is set.
    pub fn copy<R, W, F>(
        &mut self,
        source: &mut R,
        destination: &mut W,
        label: &str,
        compute_hash: bool,
        mut on_event: F,
    ) -> Result<Option<Digest>>
    where
        R: Read + Seek + ?Sized,
        W: Write + Seek + ?Sized,
        F: FnMut(TransferEvent),
    {
        let limit = remaining_len(source).map_err(|e| TransferError::copy(label, e))?;
        self.bytes_total = limit;
        self.bytes_copied = 0;

        info!(bytes = limit, file = %label, "Started copying via iSCSI");
        let start_time = Instant::now();
        let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);

        let message = format!("Copying {} via iSCSI", label);
        on_event(TransferEvent::start(&message, 0, limit));

        let mut hasher = compute_hash.then(BlockHasher::new);
        let mut offset: u64 = 0;
        let mut last_read = 0usize;

        while offset < limit {
            if self.cancel.is_cancelled() {
                warn!(file = %label, offset, "Copy cancelled");
                return Err(TransferError::Cancelled);
            }

            let want = next_read_len(limit - offset, self.buffer.len());
            let n = read_block(source, &mut self.buffer[..want])
                .map_err(|e| TransferError::copy(label, e))?;
            last_read = n;
            if n == 0 {
                break;
            }

            let block = &self.buffer[..n];
            if !is_zeros(block) {
                destination
                    .seek(SeekFrom::Start(offset))
                    .and_then(|_| destination.write_all(block))
                    .map_err(|e| TransferError::copy(label, e))?;

                if offset + (n as u64) < limit {
                    if let Some(hasher) = hasher.as_mut() {
                        hasher.absorb(block);
                    }
                }
            }

            offset += n as u64;
            self.bytes_copied = offset;

            if throttle.should_log() {
                debug!(file = %label, bytes_copied = offset, bytes_total = limit, "Copy progress");
            }
            on_event(TransferEvent::progress(&message, offset, limit));
        }

        if self.cancel.is_cancelled() {
            warn!(file = %label, offset, "Copy cancelled after last block");
            return Err(TransferError::Cancelled);
        }

        let digest = hasher.map(|h| h.finish(&self.buffer[..last_read]));

        destination
            .flush()
            .map_err(|e| TransferError::copy(label, e))?;
        on_event(TransferEvent::complete(&message, self.bytes_copied, limit));

        info!(
            bytes = self.bytes_copied,
            file = %label,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Finished copying via iSCSI"
        );

        Ok(digest)
    }

    /// Copy one file of a multi-file batch.
    ///
    /// Stops once the bytes copied reach the source's declared length (as
    /// reported by seeking to its end). A trailing read that returns more than
    /// remains is clamped, so nothing is written or reported past that length.
    /// With `close_streams` both streams are dropped when the copy finishes,
    /// otherwise they are handed back.
    #[allow(clippy::too_many_arguments)]
    pub fn wim_copy<R, W, F>(
        &mut self,
        mut source: R,
        mut destination: W,
        label: &str,
        close_streams: bool,
        file_index: u64,
        file_count: u64,
        mut on_event: F,
    ) -> Result<Option<(R, W)>>
    where
        R: Read + Seek,
        W: Write + Seek,
        F: FnMut(TransferEvent),
    {
        let declared = remaining_len(&mut source).map_err(|e| TransferError::copy(label, e))?;
        self.bytes_total = declared;
        self.bytes_copied = 0;

        info!(bytes = declared, file = %label, file_index, file_count, "Started batch copy");

        let message = format!("File {} of {}: copying {}", file_index, file_count, label);
        on_event(TransferEvent::start(&message, 0, declared));

        let mut copied: u64 = 0;
        let mut zeros_skipped: u64 = 0;

        while copied < declared {
            let n = read_block(&mut source, &mut self.buffer)
                .map_err(|e| TransferError::copy(label, e))?;
            if n == 0 {
                break;
            }
            let n = next_read_len(declared - copied, n);

            let block = &self.buffer[..n];
            if is_zeros(block) {
                zeros_skipped += n as u64;
            } else {
                destination
                    .seek(SeekFrom::Start(copied))
                    .and_then(|_| destination.write_all(block))
                    .map_err(|e| TransferError::copy(label, e))?;
            }

            if self.cancel.is_cancelled() {
                warn!(file = %label, offset = copied, "Batch copy cancelled");
                return Err(TransferError::Cancelled);
            }

            copied += n as u64;
            self.bytes_copied = copied;
            if copied >= declared {
                break;
            }
            on_event(TransferEvent::progress(&message, copied, declared));
        }

        destination
            .flush()
            .map_err(|e| TransferError::copy(label, e))?;

        let streams = if close_streams {
            drop(source);
            drop(destination);
            None
        } else {
            Some((source, destination))
        };

        on_event(TransferEvent::complete(&message, self.bytes_copied, declared));
        debug!(file = %label, zeros_skipped, "Batch copy done");

        Ok(streams)
    }
}
