//! Reassembly of chunked files streamed back by devices.
//!
//! A device announces a file with `file_info` (name, declared size, optional
//! SHA-256), streams it as base64 `file_chunk` messages carrying a sequence
//! number, and closes it with `file_end`.  Chunks can arrive out of order;
//! they are kept in a `BTreeMap` keyed by sequence number and concatenated in
//! order only when the transfer is finished.
//!
//! The reassembler does no I/O and holds no locks.  The session orchestrator
//! owns one behind a mutex and feeds it the typed payloads.

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use capsync_core::protocol::messages::{FileChunk, FileEnd, FileInfo};
use capsync_core::DeviceId;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest file a device may announce.
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Transfers one device may have open at once.
pub const MAX_OPEN_TRANSFERS_PER_DEVICE: usize = 8;

/// Errors raised while reassembling a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("declared size {declared} exceeds the {max} byte limit")]
    TooLarge { declared: u64, max: u64 },

    #[error("{open} transfers already open (limit {max})")]
    TooManyTransfers { open: usize, max: usize },

    #[error("no open transfer named {name:?}")]
    NoOpenTransfer { name: String },

    #[error("chunk without a name but {open} transfers are open")]
    AmbiguousTransfer { open: usize },

    #[error("chunk {seq} is not valid base64")]
    InvalidChunkData {
        seq: u64,
        #[source]
        source: base64::DecodeError,
    },

    #[error("chunk {seq} was already received")]
    DuplicateChunk { seq: u64 },

    #[error("received bytes exceed declared size of {declared}")]
    Overflow { declared: u64 },

    #[error("missing chunk {expected} (next received was {found})")]
    SequenceGap { expected: u64, found: u64 },

    #[error("declared {declared} bytes but received {received}")]
    SizeMismatch { declared: u64, received: u64 },
}

/// A fully reassembled file, ready for integrity verification.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedFile {
    pub device_id: DeviceId,
    pub name: String,
    pub data: Vec<u8>,
    /// Hash from `file_end`, falling back to the one in `file_info`.
    pub declared_hash: Option<String>,
}

/// Progress of one open transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub device_id: DeviceId,
    pub name: String,
    pub declared_size: u64,
    pub received_bytes: u64,
    pub chunks: usize,
}

#[derive(Debug)]
struct Transfer {
    declared_size: u64,
    declared_hash: Option<String>,
    chunks: BTreeMap<u64, Vec<u8>>,
    received_bytes: u64,
}

/// Open transfers keyed by `(device, file name)`.
#[derive(Debug, Default)]
pub struct FileReassembler {
    transfers: HashMap<(DeviceId, String), Transfer>,
}

impl FileReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transfer.  Re-announcing a name restarts it from scratch.
    pub fn open(&mut self, device_id: &str, info: &FileInfo) -> Result<(), TransferError> {
        if info.size > MAX_FILE_SIZE {
            return Err(TransferError::TooLarge {
                declared: info.size,
                max: MAX_FILE_SIZE,
            });
        }
        let key = (device_id.to_string(), info.name.clone());
        if !self.transfers.contains_key(&key) {
            let open = self
                .transfers
                .keys()
                .filter(|(owner, _)| owner == device_id)
                .count();
            if open >= MAX_OPEN_TRANSFERS_PER_DEVICE {
                return Err(TransferError::TooManyTransfers {
                    open,
                    max: MAX_OPEN_TRANSFERS_PER_DEVICE,
                });
            }
        }
        let replaced = self
            .transfers
            .insert(
                key,
                Transfer {
                    declared_size: info.size,
                    declared_hash: info.sha256.clone(),
                    chunks: BTreeMap::new(),
                    received_bytes: 0,
                },
            )
            .is_some();
        if replaced {
            warn!("device {device_id}: file {} re-announced, restarting transfer", info.name);
        } else {
            debug!("device {device_id}: receiving file {} ({} bytes)", info.name, info.size);
        }
        Ok(())
    }

    /// Stores one chunk.  Returns the resolved file name.
    pub fn add_chunk(&mut self, device_id: &str, chunk: &FileChunk) -> Result<String, TransferError> {
        let key = self.resolve(device_id, chunk.name.as_deref())?;
        let data = STANDARD
            .decode(chunk.data.as_bytes())
            .map_err(|source| TransferError::InvalidChunkData {
                seq: chunk.seq,
                source,
            })?;

        let transfer = self
            .transfers
            .get_mut(&key)
            .ok_or_else(|| TransferError::NoOpenTransfer { name: key.1.clone() })?;

        if transfer.chunks.contains_key(&chunk.seq) {
            return Err(TransferError::DuplicateChunk { seq: chunk.seq });
        }
        let received = transfer.received_bytes + data.len() as u64;
        if received > transfer.declared_size {
            return Err(TransferError::Overflow {
                declared: transfer.declared_size,
            });
        }
        transfer.received_bytes = received;
        transfer.chunks.insert(chunk.seq, data);
        Ok(key.1)
    }

    /// Closes a transfer and returns the reassembled bytes.
    ///
    /// The transfer is removed whatever the outcome: a failed file is
    /// discarded, never retried from partial state.
    pub fn finish(&mut self, device_id: &str, end: &FileEnd) -> Result<CompletedFile, TransferError> {
        let key = self.resolve(device_id, end.name.as_deref())?;
        let transfer = self
            .transfers
            .remove(&key)
            .ok_or_else(|| TransferError::NoOpenTransfer { name: key.1.clone() })?;

        for (expected, &found) in (0u64..).zip(transfer.chunks.keys()) {
            if expected != found {
                return Err(TransferError::SequenceGap { expected, found });
            }
        }
        if transfer.received_bytes != transfer.declared_size {
            return Err(TransferError::SizeMismatch {
                declared: transfer.declared_size,
                received: transfer.received_bytes,
            });
        }

        let mut data = Vec::with_capacity(transfer.received_bytes as usize);
        for chunk in transfer.chunks.into_values() {
            data.extend_from_slice(&chunk);
        }
        let (device_id, name) = key;
        Ok(CompletedFile {
            device_id,
            name,
            data,
            declared_hash: end.sha256.clone().or(transfer.declared_hash),
        })
    }

    /// Drops every open transfer for a device.  Returns how many were dropped.
    pub fn discard_device(&mut self, device_id: &str) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|(owner, _), _| owner != device_id);
        before - self.transfers.len()
    }

    pub fn open_transfers(&self) -> Vec<TransferProgress> {
        let mut out: Vec<_> = self
            .transfers
            .iter()
            .map(|((device_id, name), t)| TransferProgress {
                device_id: device_id.clone(),
                name: name.clone(),
                declared_size: t.declared_size,
                received_bytes: t.received_bytes,
                chunks: t.chunks.len(),
            })
            .collect();
        out.sort_by(|a, b| (&a.device_id, &a.name).cmp(&(&b.device_id, &b.name)));
        out
    }

    /// Picks the transfer a chunk or end message belongs to.  A nameless
    /// message goes to the device's only open transfer.
    fn resolve(&self, device_id: &str, name: Option<&str>) -> Result<(DeviceId, String), TransferError> {
        if let Some(name) = name {
            return Ok((device_id.to_string(), name.to_string()));
        }
        let mut open = self
            .transfers
            .keys()
            .filter(|(owner, _)| owner == device_id);
        match (open.next(), open.next()) {
            (Some(key), None) => Ok(key.clone()),
            (None, _) => Err(TransferError::NoOpenTransfer {
                name: String::new(),
            }),
            (Some(_), Some(_)) => Err(TransferError::AmbiguousTransfer {
                open: self
                    .transfers
                    .keys()
                    .filter(|(owner, _)| owner == device_id)
                    .count(),
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, size: u64) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size,
            sha256: None,
        }
    }

    fn chunk(name: Option<&str>, seq: u64, bytes: &[u8]) -> FileChunk {
        FileChunk {
            name: name.map(str::to_string),
            seq,
            data: STANDARD.encode(bytes),
        }
    }

    fn end(name: Option<&str>) -> FileEnd {
        FileEnd {
            name: name.map(str::to_string),
            sha256: None,
        }
    }

    fn reassemble(order: &[u64]) -> Vec<u8> {
        let parts: [&[u8]; 3] = [b"alpha-", b"bravo-", b"charlie"];
        let mut r = FileReassembler::new();
        r.open("cam", &info("v.mp4", 19)).unwrap();
        for &seq in order {
            r.add_chunk("cam", &chunk(Some("v.mp4"), seq, parts[seq as usize]))
                .unwrap();
        }
        r.finish("cam", &end(Some("v.mp4"))).unwrap().data
    }

    #[test]
    fn test_out_of_order_chunks_reassemble_identically() {
        // Arrange / Act
        let in_order = reassemble(&[0, 1, 2]);
        let shuffled = reassemble(&[0, 2, 1]);

        // Assert
        assert_eq!(in_order, b"alpha-bravo-charlie");
        assert_eq!(shuffled, in_order);
    }

    #[test]
    fn test_size_mismatch_discards_transfer() {
        // Arrange
        let mut r = FileReassembler::new();
        r.open("cam", &info("a.bin", 10)).unwrap();
        r.add_chunk("cam", &chunk(Some("a.bin"), 0, b"short")).unwrap();

        // Act
        let result = r.finish("cam", &end(Some("a.bin")));

        // Assert
        assert!(matches!(
            result,
            Err(TransferError::SizeMismatch { declared: 10, received: 5 })
        ));
        assert!(r.open_transfers().is_empty());
    }

    #[test]
    fn test_missing_middle_chunk_is_a_sequence_gap() {
        let mut r = FileReassembler::new();
        r.open("cam", &info("a.bin", 2)).unwrap();
        r.add_chunk("cam", &chunk(Some("a.bin"), 0, b"a")).unwrap();
        r.add_chunk("cam", &chunk(Some("a.bin"), 2, b"c")).unwrap();

        let result = r.finish("cam", &end(Some("a.bin")));

        assert!(matches!(
            result,
            Err(TransferError::SequenceGap { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_duplicate_chunk_keeps_first_copy() {
        // Arrange
        let mut r = FileReassembler::new();
        r.open("cam", &info("a.bin", 2)).unwrap();
        r.add_chunk("cam", &chunk(Some("a.bin"), 0, b"x")).unwrap();

        // Act
        let dup = r.add_chunk("cam", &chunk(Some("a.bin"), 0, b"y"));
        r.add_chunk("cam", &chunk(Some("a.bin"), 1, b"z")).unwrap();
        let done = r.finish("cam", &end(Some("a.bin"))).unwrap();

        // Assert
        assert!(matches!(dup, Err(TransferError::DuplicateChunk { seq: 0 })));
        assert_eq!(done.data, b"xz");
    }

    #[test]
    fn test_nameless_chunk_routes_to_single_open_transfer() {
        let mut r = FileReassembler::new();
        r.open("cam", &info("only.bin", 3)).unwrap();

        let name = r.add_chunk("cam", &chunk(None, 0, b"abc")).unwrap();
        let done = r.finish("cam", &end(None)).unwrap();

        assert_eq!(name, "only.bin");
        assert_eq!(done.name, "only.bin");
    }

    #[test]
    fn test_nameless_chunk_with_two_open_transfers_is_ambiguous() {
        let mut r = FileReassembler::new();
        r.open("cam", &info("a.bin", 1)).unwrap();
        r.open("cam", &info("b.bin", 1)).unwrap();

        let result = r.add_chunk("cam", &chunk(None, 0, b"a"));

        assert!(matches!(result, Err(TransferError::AmbiguousTransfer { open: 2 })));
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let mut r = FileReassembler::new();
        r.open("cam", &info("a.bin", 1)).unwrap();
        let bad = FileChunk {
            name: Some("a.bin".to_string()),
            seq: 0,
            data: "***".to_string(),
        };

        assert!(matches!(
            r.add_chunk("cam", &bad),
            Err(TransferError::InvalidChunkData { seq: 0, .. })
        ));
    }

    #[test]
    fn test_chunk_past_declared_size_overflows() {
        let mut r = FileReassembler::new();
        r.open("cam", &info("a.bin", 2)).unwrap();

        let result = r.add_chunk("cam", &chunk(Some("a.bin"), 0, b"abc"));

        assert!(matches!(result, Err(TransferError::Overflow { declared: 2 })));
    }

    #[test]
    fn test_end_hash_overrides_info_hash() {
        let mut r = FileReassembler::new();
        r.open(
            "cam",
            &FileInfo {
                name: "a.bin".to_string(),
                size: 0,
                sha256: Some("from-info".to_string()),
            },
        )
        .unwrap();
        let done = r
            .finish(
                "cam",
                &FileEnd {
                    name: Some("a.bin".to_string()),
                    sha256: Some("from-end".to_string()),
                },
            )
            .unwrap();
        assert_eq!(done.declared_hash.as_deref(), Some("from-end"));
    }

    #[test]
    fn test_discard_device_drops_only_its_transfers() {
        let mut r = FileReassembler::new();
        r.open("cam", &info("a.bin", 1)).unwrap();
        r.open("cam", &info("b.bin", 1)).unwrap();
        r.open("thermal", &info("t.bin", 1)).unwrap();

        assert_eq!(r.discard_device("cam"), 2);
        let left = r.open_transfers();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].device_id, "thermal");
    }

    #[test]
    fn test_oversized_announcement_is_refused() {
        // Arrange
        let mut r = FileReassembler::new();

        // Act
        let err = r.open("cam", &info("huge.bin", MAX_FILE_SIZE + 1)).unwrap_err();

        // Assert
        assert!(matches!(err, TransferError::TooLarge { declared, .. } if declared == MAX_FILE_SIZE + 1));
        assert!(r.open_transfers().is_empty());
    }

    #[test]
    fn test_open_transfers_are_capped_per_device() {
        // Arrange
        let mut r = FileReassembler::new();
        for i in 0..MAX_OPEN_TRANSFERS_PER_DEVICE {
            r.open("cam", &info(&format!("f{i}.bin"), 1)).unwrap();
        }

        // Act
        let refused = r.open("cam", &info("extra.bin", 1));
        let reannounced = r.open("cam", &info("f0.bin", 1));
        let other_device = r.open("thermal", &info("t.bin", 1));

        // Assert
        assert!(matches!(
            refused,
            Err(TransferError::TooManyTransfers { open, max })
                if open == MAX_OPEN_TRANSFERS_PER_DEVICE && max == MAX_OPEN_TRANSFERS_PER_DEVICE
        ));
        assert!(reannounced.is_ok());
        assert!(other_device.is_ok());
        assert_eq!(r.open_transfers().len(), MAX_OPEN_TRANSFERS_PER_DEVICE + 1);
    }
}
