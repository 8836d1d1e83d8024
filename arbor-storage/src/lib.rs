//! # arbor-storage
//!
//! Storage layer for arbor.
//!
//! This crate provides:
//! - Framed, checksummed save slot files
//! - A binary encoding for the save document's variable side table
//! - A slot index with per-slot metadata
//! - A [`arbor_core::SaveBackend`] implementation over a directory

pub mod codec;
pub mod error;
pub mod slot;

pub use codec::{SlotFormat, SlotHeader, MAX_PAYLOAD_SIZE, SLOT_MAGIC};
pub use error::StorageError;
pub use slot::{SlotMeta, SlotStore};
