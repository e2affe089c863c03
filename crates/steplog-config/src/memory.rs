// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory `ConfigStore` for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{check_key, ConfigError, ConfigStore};

/// Config blobs held in a map.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl ConfigStore for MemoryConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        check_key(key)?;
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| ConfigError::Other("config store poisoned".into()))?;
        blobs.get(key).cloned().ok_or(ConfigError::NotFound)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        check_key(key)?;
        self.blobs
            .lock()
            .map_err(|_| ConfigError::Other("config store poisoned".into()))?
            .insert(key.to_owned(), data.to_vec());
        Ok(())
    }
}
