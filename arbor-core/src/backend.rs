//! Where saved documents go.

use crate::document::SaveDocument;
use crate::error::CoreError;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Slot-addressed document storage used by [`crate::Controller::save`] and
/// [`crate::Controller::load`].
pub trait SaveBackend: Send + Sync {
    fn write(&self, slot: &str, doc: &SaveDocument) -> Result<(), CoreError>;

    fn read(&self, slot: &str) -> Result<SaveDocument, CoreError>;

    fn exists(&self, slot: &str) -> bool;
}

/// Keeps documents in memory. Useful for tests and quicksave slots.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    slots: Mutex<HashMap<String, SaveDocument>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl SaveBackend for MemoryBackend {
    fn write(&self, slot: &str, doc: &SaveDocument) -> Result<(), CoreError> {
        self.slots.lock().insert(slot.to_string(), doc.clone());
        Ok(())
    }

    fn read(&self, slot: &str) -> Result<SaveDocument, CoreError> {
        self.slots
            .lock()
            .get(slot)
            .cloned()
            .ok_or_else(|| CoreError::Backend(format!("slot not found: {}", slot)))
    }

    fn exists(&self, slot: &str) -> bool {
        self.slots.lock().contains_key(slot)
    }
}

impl<T: SaveBackend + ?Sized> SaveBackend for std::sync::Arc<T> {
    fn write(&self, slot: &str, doc: &SaveDocument) -> Result<(), CoreError> {
        (**self).write(slot, doc)
    }

    fn read(&self, slot: &str) -> Result<SaveDocument, CoreError> {
        (**self).read(slot)
    }

    fn exists(&self, slot: &str) -> bool {
        (**self).exists(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend() {
        let backend = MemoryBackend::new();
        assert!(!backend.exists("quick"));
        assert!(backend.read("quick").is_err());

        backend.write("quick", &SaveDocument::default()).unwrap();
        assert!(backend.exists("quick"));
        assert_eq!(backend.read("quick").unwrap(), SaveDocument::default());
        assert_eq!(backend.slot_names(), vec!["quick".to_string()]);
    }
}
