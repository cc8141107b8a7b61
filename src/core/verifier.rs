use std::io::{Read, Seek, SeekFrom};

use tracing::{error, info, warn};

use crate::core::copy_engine::{
    BlockHasher, Digest, StreamCopier, is_zeros, next_read_len, read_block,
};
use crate::core::events::TransferEvent;
use crate::error::{Result, TransferError};

impl StreamCopier {
    /// Re-read the destination of the last copy and compare its digest.
    ///
    /// The target is rewound and read up to the number of bytes the last copy
    /// reported, hashing blocks exactly the way [`StreamCopier::copy`] did:
    /// all-zero intermediate blocks are left out and the final read is split
    /// into two updates.
    pub fn verify<T, F>(
        &mut self,
        target: &mut T,
        label: &str,
        expected: &Digest,
        mut on_event: F,
    ) -> Result<()>
    where
        T: Read + Seek + ?Sized,
        F: FnMut(TransferEvent),
    {
        let limit = self.position();
        info!(bytes = limit, file = %label, "Started verifying after copy via iSCSI");

        let message = format!("Verifying {} after copy via iSCSI", label);
        on_event(TransferEvent::start(&message, 0, limit));

        target
            .seek(SeekFrom::Start(0))
            .map_err(|e| TransferError::verify_io(label, e))?;

        let cancel = self.cancellation_token().clone();
        let buffer = self.buffer_mut();

        let mut hasher = BlockHasher::new();
        let mut offset: u64 = 0;
        let mut last_read = 0usize;

        while offset < limit {
            if cancel.is_cancelled() {
                warn!(file = %label, offset, "Verification cancelled");
                return Err(TransferError::Cancelled);
            }

            let want = next_read_len(limit - offset, buffer.len());
            let n = read_block(target, &mut buffer[..want])
                .map_err(|e| TransferError::verify_io(label, e))?;
            last_read = n;
            if n == 0 {
                break;
            }

            let block = &buffer[..n];
            if !is_zeros(block) && offset + (n as u64) < limit {
                hasher.absorb(block);
            }

            offset += n as u64;
            on_event(TransferEvent::progress(&message, offset, limit));
        }

        if cancel.is_cancelled() {
            warn!(file = %label, offset, "Verification cancelled after last block");
            return Err(TransferError::Cancelled);
        }

        let digest = hasher.finish(&buffer[..last_read]);
        if digest != *expected {
            error!(
                file = %label,
                expected = %expected,
                actual = %digest,
                "Verification failed: digest mismatch"
            );
            return Err(TransferError::Verification {
                label: label.to_string(),
            });
        }

        on_event(TransferEvent::complete(&message, offset, limit));
        info!(bytes = offset, file = %label, digest = %digest, "Finished verifying after copy via iSCSI");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::num::NonZeroUsize;
    use tokio_util::sync::CancellationToken;

    const BLOCK: usize = 16;

    fn copier() -> StreamCopier {
        StreamCopier::with_block_size(NonZeroUsize::new(BLOCK).unwrap(), CancellationToken::new())
    }

    #[test]
    fn test_verify_matches_copy_digest() {
        let data: Vec<u8> = (0..100u8).map(|b| b.wrapping_add(1)).collect();
        let mut source = Cursor::new(data.clone());
        let mut dest = Cursor::new(vec![0u8; data.len()]);

        let mut copier = copier();
        let digest = copier
            .copy(&mut source, &mut dest, "disk", true, |_| {})
            .unwrap()
            .unwrap();

        copier.verify(&mut dest, "disk", &digest, |_| {}).unwrap();
    }

    #[test]
    fn test_verify_detects_corruption() {
        let data = vec![0xAAu8; 64];
        let mut source = Cursor::new(data.clone());
        let mut dest = Cursor::new(vec![0u8; data.len()]);

        let mut copier = copier();
        let digest = copier
            .copy(&mut source, &mut dest, "disk", true, |_| {})
            .unwrap()
            .unwrap();

        dest.get_mut()[5] = 0x55;
        let err = copier.verify(&mut dest, "disk", &digest, |_| {}).unwrap_err();
        assert!(matches!(err, TransferError::Verification { ref label } if label == "disk"));
    }

    #[test]
    fn test_verify_emits_complete_only_on_success() {
        let data = vec![0x11u8; 40];
        let mut source = Cursor::new(data.clone());
        let mut dest = Cursor::new(vec![0u8; data.len()]);

        let mut copier = copier();
        let digest = copier
            .copy(&mut source, &mut dest, "disk", true, |_| {})
            .unwrap()
            .unwrap();

        let mut events = Vec::new();
        copier
            .verify(&mut dest, "disk", &digest, |e| events.push(e))
            .unwrap();
        assert!(matches!(events.first(), Some(TransferEvent::Start(_))));
        assert!(events.last().unwrap().is_complete());
        assert_eq!(events.last().unwrap().detail().bytes_done, 40);

        dest.get_mut()[0] = 0;
        let mut events = Vec::new();
        assert!(copier.verify(&mut dest, "disk", &digest, |e| events.push(e)).is_err());
        assert!(!events.iter().any(TransferEvent::is_complete));
    }

    #[test]
    fn test_verify_honors_cancellation() {
        let data = vec![0x22u8; 64];
        let mut source = Cursor::new(data.clone());
        let mut dest = Cursor::new(vec![0u8; data.len()]);

        let mut copier = copier();
        let digest = copier
            .copy(&mut source, &mut dest, "disk", true, |_| {})
            .unwrap()
            .unwrap();

        copier.cancellation_token().cancel();
        let err = copier.verify(&mut dest, "disk", &digest, |_| {}).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_verify_cancelled_during_last_block() {
        let data = vec![0x33u8; BLOCK * 2];
        let mut source = Cursor::new(data.clone());
        let mut dest = Cursor::new(vec![0u8; data.len()]);

        let mut copier = copier();
        let digest = copier
            .copy(&mut source, &mut dest, "disk", true, |_| {})
            .unwrap()
            .unwrap();

        let token = copier.cancellation_token().clone();
        let mut events = Vec::new();
        let err = copier
            .verify(&mut dest, "disk", &digest, |e| {
                if e.detail().bytes_done == (BLOCK * 2) as u64 {
                    token.cancel();
                }
                events.push(e);
            })
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!events.iter().any(TransferEvent::is_complete));
    }
}
