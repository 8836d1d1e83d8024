//! Save slot storage.

use crate::codec::{self, SlotFormat, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::StorageError;
use arbor_core::{CoreError, Limits, SaveBackend, SaveDocument};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Slot metadata kept in the store's index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotMeta {
    pub slot: String,
    pub saved_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksum: String,
    pub instance_count: usize,
    pub format: SlotFormat,
}

/// Directory of slot files plus an index of their metadata.
pub struct SlotStore {
    dir: PathBuf,
    format: SlotFormat,
    limits: Limits,
    /// In-memory index of slots by name.
    index: RwLock<BTreeMap<String, SlotMeta>>,
}

impl SlotStore {
    /// Opens or creates a slot store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            format: SlotFormat::default(),
            limits: Limits::default(),
            index: RwLock::new(BTreeMap::new()),
        };
        store.load_index()?;
        Ok(store)
    }

    /// Sets the format used for subsequent writes. Reads accept either.
    pub fn with_format(mut self, format: SlotFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_index(&self) -> Result<(), StorageError> {
        let index_path = self.index_path();
        if !index_path.exists() {
            return Ok(());
        }

        let file = File::open(&index_path)?;
        let reader = BufReader::new(file);
        let index: BTreeMap<String, SlotMeta> = serde_json::from_reader(reader)?;

        // Drop entries whose file has gone missing.
        let mut index = index;
        index.retain(|slot, _| {
            let present = self.slot_path(slot).exists();
            if !present {
                tracing::warn!(slot = %slot, "slot file missing; dropping index entry");
            }
            present
        });
        *self.index.write() = index;
        Ok(())
    }

    fn save_index(&self) -> Result<(), StorageError> {
        let tmp = self.dir.join("index.json.tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &*self.index.read())?;
            writer.flush()?;
        }
        fs::rename(&tmp, self.index_path())?;
        Ok(())
    }

    /// Writes a document to a slot, replacing any previous contents.
    pub fn write(&self, slot: &str, doc: &SaveDocument) -> Result<SlotMeta, StorageError> {
        validate_slot_name(slot)?;
        let data = codec::encode(doc, self.format)?;
        let header = codec::decode_header(&data)?;

        // Write next to the target and rename so a crash never leaves a
        // half-written slot.
        let path = self.slot_path(slot);
        let tmp = self.dir.join(format!("{}.sav.tmp", slot));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let meta = SlotMeta {
            slot: slot.to_string(),
            saved_at: Utc::now(),
            size_bytes: data.len() as u64,
            checksum: format!("{:08x}", header.crc32c),
            instance_count: doc.instances.len(),
            format: self.format,
        };
        self.index.write().insert(slot.to_string(), meta.clone());
        self.save_index()?;

        tracing::info!(
            "Wrote slot {} ({} bytes, {} instances, {})",
            slot,
            meta.size_bytes,
            meta.instance_count,
            meta.format
        );
        Ok(meta)
    }

    /// Reads and validates a slot.
    pub fn read(&self, slot: &str) -> Result<SaveDocument, StorageError> {
        validate_slot_name(slot)?;
        let path = self.slot_path(slot);
        if !path.exists() {
            return Err(StorageError::SlotNotFound(slot.to_string()));
        }

        let file = File::open(&path)?;
        let size = file.metadata()?.len() as usize;
        if size > HEADER_SIZE + MAX_PAYLOAD_SIZE {
            return Err(StorageError::RecordTooLarge {
                size,
                max: HEADER_SIZE + MAX_PAYLOAD_SIZE,
            });
        }
        let mut data = Vec::with_capacity(size);
        file.take((HEADER_SIZE + MAX_PAYLOAD_SIZE) as u64)
            .read_to_end(&mut data)?;

        let (header, doc) = codec::decode(&data, &self.limits)?;

        if let Some(meta) = self.index.read().get(slot) {
            let actual = format!("{:08x}", header.crc32c);
            if actual != meta.checksum {
                return Err(StorageError::Corruption(format!(
                    "slot {} checksum {} does not match index {}",
                    slot, actual, meta.checksum
                )));
            }
        }

        tracing::debug!(slot = %slot, format = %header.format, instances = doc.instances.len(), "read slot");
        Ok(doc)
    }

    pub fn exists(&self, slot: &str) -> bool {
        validate_slot_name(slot).is_ok() && self.slot_path(slot).exists()
    }

    /// Deletes a slot. Deleting a missing slot is not an error.
    pub fn delete(&self, slot: &str) -> Result<(), StorageError> {
        validate_slot_name(slot)?;
        let path = self.slot_path(slot);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        self.index.write().remove(slot);
        self.save_index()?;
        Ok(())
    }

    pub fn meta(&self, slot: &str) -> Option<SlotMeta> {
        self.index.read().get(slot).cloned()
    }

    /// Lists slot metadata ordered by slot name.
    pub fn list(&self) -> Vec<SlotMeta> {
        self.index.read().values().cloned().collect()
    }

    pub fn slot_count(&self) -> usize {
        self.index.read().len()
    }

    fn slot_path(&self, slot: &str) -> PathBuf {
        self.dir.join(format!("{}.sav", slot))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }
}

/// Slot names become file names: ASCII letters, digits, `-` and `_` only.
fn validate_slot_name(slot: &str) -> Result<(), StorageError> {
    let valid = !slot.is_empty()
        && slot.len() <= 128
        && slot
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidSlotName(slot.to_string()))
    }
}

impl SaveBackend for SlotStore {
    fn write(&self, slot: &str, doc: &SaveDocument) -> Result<(), CoreError> {
        SlotStore::write(self, slot, doc)?;
        Ok(())
    }

    fn read(&self, slot: &str) -> Result<SaveDocument, CoreError> {
        Ok(SlotStore::read(self, slot)?)
    }

    fn exists(&self, slot: &str) -> bool {
        SlotStore::exists(self, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{Condition, Controller, ControllerConfig, Node, NodeKind, Transition, Value};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn controller() -> Controller {
        let mut controller = Controller::new(ControllerConfig::default());
        let content = controller.content_mut();
        let world = content.add_node(Node::new("WorldSystem", NodeKind::Root));
        let region = content.add_node(Node::new("Region", NodeKind::Region));
        let location = content.add_node(Node::new("Location", NodeKind::Location));
        content.add_child(world, region).unwrap();
        content.add_child(region, location).unwrap();
        content
            .add_transition(world, Transition::new("travel", region).when(Condition::input("travel")))
            .unwrap();
        content
            .add_transition(region, Transition::new("walk", location).when(Condition::input("walk")))
            .unwrap();
        controller.register_system("WorldSystem", world).unwrap();
        controller
    }

    fn document() -> SaveDocument {
        let mut c = controller();
        c.create_instance("player", "WorldSystem");
        c.process_input("player", "travel", Default::default());
        c.set_global_variable("gold", Value::Int(12));
        c.save_document()
    }

    #[test]
    fn test_slot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SlotStore::open(dir.path()).unwrap();
        let doc = document();

        let meta = store.write("quick", &doc).unwrap();
        assert_eq!(meta.instance_count, 1);
        assert_eq!(meta.format, SlotFormat::Json);
        assert!(dir.path().join("quick.sav").exists());

        assert_eq!(store.read("quick").unwrap(), doc);
    }

    #[test]
    fn test_binary_slot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SlotStore::open(dir.path()).unwrap().with_format(SlotFormat::Binary);
        let doc = document();
        store.write("slot_1", &doc).unwrap();
        assert_eq!(store.meta("slot_1").unwrap().format, SlotFormat::Binary);
        assert_eq!(store.read("slot_1").unwrap(), doc);
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = SlotStore::open(dir.path()).unwrap();
            store.write("a", &document()).unwrap();
            store.write("b", &document()).unwrap();
        }
        fs::remove_file(dir.path().join("b.sav")).unwrap();

        let store = SlotStore::open(dir.path()).unwrap();
        let slots: Vec<String> = store.list().into_iter().map(|m| m.slot).collect();
        assert_eq!(slots, vec!["a".to_string()]);
    }

    #[test]
    fn test_missing_and_invalid_slots() {
        let dir = TempDir::new().unwrap();
        let store = SlotStore::open(dir.path()).unwrap();
        assert!(matches!(store.read("nope"), Err(StorageError::SlotNotFound(_))));
        assert!(matches!(
            store.write("../escape", &document()),
            Err(StorageError::InvalidSlotName(_))
        ));
        assert!(!store.exists("../escape"));
        assert!(store.write("", &document()).is_err());
    }

    #[test]
    fn test_corrupted_slot_detected() {
        let dir = TempDir::new().unwrap();
        let store = SlotStore::open(dir.path()).unwrap();
        store.write("quick", &document()).unwrap();

        let path = dir.path().join("quick.sav");
        let mut data = fs::read(&path).unwrap();
        let mid = HEADER_SIZE + (data.len() - HEADER_SIZE) / 2;
        data[mid] ^= 0x55;
        fs::write(&path, &data).unwrap();

        let err = store.read("quick").unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = SlotStore::open(dir.path()).unwrap();
        store.write("quick", &document()).unwrap();
        assert_eq!(store.slot_count(), 1);
        store.delete("quick").unwrap();
        store.delete("quick").unwrap();
        assert_eq!(store.slot_count(), 0);
        assert!(!store.exists("quick"));
    }

    #[test]
    fn test_controller_backend() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SlotStore::open(dir.path()).unwrap().with_format(SlotFormat::Binary));

        let mut c = controller();
        c.set_backend(Box::new(store.clone()));
        c.create_instance("player", "WorldSystem");
        c.process_input("player", "travel", Default::default());
        c.set_global_variable("gold", Value::Int(3));
        assert!(c.save("slot1"));

        c.process_input("player", "walk", Default::default());
        c.set_global_variable("gold", Value::Int(0));
        assert!(c.load("slot1"));
        assert_eq!(c.current_node_id("player").as_deref(), Some("WorldSystem/Region"));
        assert_eq!(c.get_global_variable("gold"), Some(&Value::Int(3)));

        // A corrupted slot fails the load and leaves the controller as it was.
        let path = dir.path().join("slot1.sav");
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        fs::write(&path, &data).unwrap();
        c.process_input("player", "walk", Default::default());
        assert!(!c.load("slot1"));
        assert_eq!(c.current_node_name("player").as_deref(), Some("Location"));
        assert_eq!(store.list().len(), 1);
    }
}
