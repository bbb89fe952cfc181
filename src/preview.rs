use bytes::Bytes;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;
use uuid::Uuid;

use crate::models::ImageFile;

#[derive(Debug, Clone)]
pub struct Preview {
    pub bytes: Bytes,
    pub mime: String,
}

/// Locally served copies of selected images, addressed by `/previews/{id}`.
#[derive(Debug, Clone, Default)]
pub struct PreviewStore {
    entries: Arc<RwLock<HashMap<Uuid, Preview>>>,
}

impl PreviewStore {
    /// Registers the file and returns the handle that owns the entry.
    pub fn create(&self, file: &ImageFile) -> PreviewHandle {
        let id = Uuid::new_v4();
        self.entries.write().insert(id, Preview { bytes: file.bytes.clone(), mime: file.mime.clone() });
        debug!(%id, name = %file.name, "preview created");
        PreviewHandle { id, store: self.clone() }
    }

    pub fn get(&self, id: &Uuid) -> Option<Preview> {
        self.entries.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn release(&self, id: &Uuid) {
        if self.entries.write().remove(id).is_some() {
            debug!(%id, "preview released");
        }
    }
}

/// Owns one preview entry; dropping it frees the bytes.
#[derive(Debug)]
pub struct PreviewHandle {
    id: Uuid,
    store: PreviewStore,
}

impl PreviewHandle {
    pub fn url(&self) -> String {
        format!("/previews/{}", self.id)
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.store.release(&self.id);
    }
}
