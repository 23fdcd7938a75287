//! Checksummed record framing over a [`StorageBackend`].
//!
//! Each frame is laid out as:
//!
//! ```text
//! | magic (4) | payload len (4) | crc32 (4) | payload (len) |
//! ```
//!
//! All integers are little-endian. A frame whose header or payload is cut
//! short, or whose checksum does not match, marks the end of the valid log.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use tracing::{debug, warn};

/// Magic bytes at the start of every frame ("TESS").
pub const FRAME_MAGIC: u32 = 0x5445_5353;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 12;

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn checksum(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Wraps `payload` in a frame header.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&checksum(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Result of scanning a log for frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameScan {
    /// Payloads of every intact frame, in append order.
    pub frames: Vec<Vec<u8>>,
    /// Byte length of the intact prefix of the log.
    pub valid_len: u64,
    /// Whether bytes after `valid_len` were discarded.
    pub torn_tail: bool,
}

/// A sequence of framed records on top of a byte backend.
pub struct FrameLog {
    backend: Box<dyn StorageBackend>,
}

impl std::fmt::Debug for FrameLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLog").finish_non_exhaustive()
    }
}

impl FrameLog {
    /// Creates a frame log over `backend`.
    #[must_use]
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Appends one record and syncs the backend.
    ///
    /// Returns the offset of the frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the append or the sync fails.
    pub fn append(&mut self, payload: &[u8]) -> StorageResult<u64> {
        let frame = encode_frame(payload);
        let offset = self.backend.append(&frame)?;
        self.backend.sync()?;
        debug!(offset, len = payload.len(), "frame appended");
        Ok(offset)
    }

    /// Reads every intact frame without modifying the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub fn scan(&self) -> StorageResult<FrameScan> {
        let bytes = self.backend.read_all()?;
        let mut frames = Vec::new();
        let mut pos = 0usize;

        while pos < bytes.len() {
            match decode_at(&bytes, pos) {
                Some((payload, next)) => {
                    frames.push(payload.to_vec());
                    pos = next;
                }
                None => break,
            }
        }

        Ok(FrameScan {
            frames,
            valid_len: pos as u64,
            torn_tail: pos < bytes.len(),
        })
    }

    /// Reads every intact frame and cuts off a torn tail.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if the log is non-empty but its
    /// first frame does not start with [`FRAME_MAGIC`]: such a file was not
    /// written by this log and is left untouched.
    pub fn recover(&mut self) -> StorageResult<Vec<Vec<u8>>> {
        let scan = self.scan()?;
        if scan.torn_tail {
            if scan.valid_len == 0 {
                let head = self
                    .backend
                    .read_at(0, FRAME_HEADER_LEN.min(self.backend.size()? as usize))?;
                if head.len() >= 4 {
                    let magic = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
                    if magic != FRAME_MAGIC {
                        return Err(StorageError::Corrupted(format!(
                            "unexpected magic {magic:#010x} at offset 0"
                        )));
                    }
                }
            }
            warn!(
                valid_len = scan.valid_len,
                "discarding torn tail of frame log"
            );
            self.backend.truncate(scan.valid_len)?;
        }
        debug!(frames = scan.frames.len(), "frame log recovered");
        Ok(scan.frames)
    }

    /// Returns the current size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.size()
    }

    /// Returns the underlying backend.
    #[must_use]
    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Consumes the log and returns its backend.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn StorageBackend> {
        self.backend
    }
}

fn decode_at(bytes: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let header = bytes.get(pos..pos + FRAME_HEADER_LEN)?;
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != FRAME_MAGIC {
        return None;
    }
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

    let start = pos + FRAME_HEADER_LEN;
    let payload = bytes.get(start..start.checked_add(len)?)?;
    if checksum(payload) != crc {
        return None;
    }
    Some((payload, start + len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use proptest::prelude::*;

    #[test]
    fn checksum_known_value() {
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn frames_come_back_in_order() {
        let mut log = FrameLog::new(Box::new(InMemoryBackend::new()));
        log.append(b"a").unwrap();
        log.append(b"").unwrap();
        log.append(b"ccc").unwrap();

        let scan = log.scan().unwrap();
        assert_eq!(scan.frames, vec![b"a".to_vec(), Vec::new(), b"ccc".to_vec()]);
        assert!(!scan.torn_tail);
        assert_eq!(scan.valid_len, log.size().unwrap());
    }

    #[test]
    fn recover_truncates_partial_frame() {
        let backend = InMemoryBackend::new();
        let mut log = FrameLog::new(Box::new(backend.clone()));
        log.append(b"committed").unwrap();
        let intact = log.size().unwrap();

        let partial = encode_frame(b"interrupted");
        let mut raw = backend.clone();
        raw.append(&partial[..partial.len() - 3]).unwrap();

        let frames = log.recover().unwrap();
        assert_eq!(frames, vec![b"committed".to_vec()]);
        assert_eq!(backend.data().len() as u64, intact);
    }

    #[test]
    fn recover_stops_at_checksum_mismatch() {
        let mut bytes = encode_frame(b"first");
        let mut second = encode_frame(b"second");
        let last = second.len() - 1;
        second[last] ^= 0xFF;
        bytes.extend_from_slice(&second);

        let backend = InMemoryBackend::with_data(bytes);
        let mut log = FrameLog::new(Box::new(backend.clone()));
        let frames = log.recover().unwrap();

        assert_eq!(frames, vec![b"first".to_vec()]);
        assert_eq!(backend.data(), encode_frame(b"first"));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let backend = InMemoryBackend::with_data(b"not a tessera log at all".to_vec());
        let mut log = FrameLog::new(Box::new(backend.clone()));

        assert!(matches!(log.recover(), Err(StorageError::Corrupted(_))));
        assert_eq!(backend.data().len(), 24);
    }

    proptest! {
        #[test]
        fn any_prefix_recovers_whole_frames(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..8),
            cut in 0usize..512,
        ) {
            let mut bytes = Vec::new();
            let mut boundaries = vec![0usize];
            for payload in &payloads {
                bytes.extend_from_slice(&encode_frame(payload));
                boundaries.push(bytes.len());
            }
            let cut = cut.min(bytes.len());
            bytes.truncate(cut);

            let log = FrameLog::new(Box::new(InMemoryBackend::with_data(bytes)));
            let scan = log.scan().unwrap();
            let whole = boundaries.iter().filter(|&&b| b != 0 && b <= cut).count();

            prop_assert_eq!(scan.frames.len(), whole);
            prop_assert_eq!(&scan.frames[..], &payloads[..whole]);
            prop_assert_eq!(scan.valid_len as usize, boundaries[whole]);
        }
    }
}
