//! # Tessera Storage
//!
//! Byte-level storage for Tessera's append-based backing store.
//!
//! The query engine never talks to this crate directly. It is consumed by the
//! `LogStore` adapter in `tessera_core`, which appends one framed commit
//! record per transaction and replays the log when a database is opened.
//!
//! ## Pieces
//!
//! - [`StorageBackend`]: an opaque, append-only byte log
//! - [`InMemoryBackend`]: a backend for tests and ephemeral databases
//! - [`FileBackend`]: a backend over a single OS file
//! - [`FrameLog`]: checksummed record framing with torn-tail recovery
//!
//! ## Example
//!
//! ```rust
//! use tessera_storage::{FrameLog, InMemoryBackend};
//!
//! let mut log = FrameLog::new(Box::new(InMemoryBackend::new()));
//! log.append(b"first commit").unwrap();
//! log.append(b"second commit").unwrap();
//!
//! let frames = log.recover().unwrap();
//! assert_eq!(frames.len(), 2);
//! assert_eq!(frames[1], b"second commit");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod frame;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use frame::{checksum, encode_frame, FrameLog, FrameScan, FRAME_HEADER_LEN, FRAME_MAGIC};
pub use memory::InMemoryBackend;
