//! Ordered byte-key/byte-value store with atomic batches and snapshots.
//!
//! The fast and snail chains share one database under disjoint key-space
//! prefixes. Values are snappy-compressed. A persistent on-disk backend is
//! an external collaborator; the in-memory backend here implements the full
//! contract and is what every test runs against.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use im::OrdMap;
use snap::raw::{Decoder, Encoder};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("stored value failed to decompress, database is corrupted")]
struct CorruptValue;

type Map = OrdMap<Vec<u8>, Vec<u8>>;

#[derive(Clone, Default)]
pub struct Database {
    map: Arc<Mutex<Map>>,
}

impl Database {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        self.lock()
            .get(key.as_ref())
            .map(|compressed| decompress(compressed))
            .transpose()
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.lock().contains_key(key.as_ref()))
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let compressed = compress(value.as_ref())?;
        let _previous = self.lock().insert(key.as_ref().to_vec(), compressed);
        Ok(())
    }

    /// Applies every write in one step. Readers observe either none or all
    /// of the batch.
    pub fn put_batch(
        &self,
        pairs: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        let compressed = pairs
            .into_iter()
            .map(|(key, value)| Ok((key, compress(&value)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut map = self.lock();
        let mut new_map = map.clone();
        for (key, value) in compressed {
            let _previous = new_map.insert(key, value);
        }
        *map = new_map;

        Ok(())
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let _previous = self.lock().remove(key.as_ref());
        Ok(())
    }

    /// Point-in-time view. Cheap: the underlying map is persistent.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            map: self.lock().clone(),
        }
    }

    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.snapshot().keys_with_prefix(prefix)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map> {
        self.map.lock().expect("database mutex is poisoned")
    }
}

pub struct Snapshot {
    map: Map,
}

impl Snapshot {
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        self.map
            .get(key.as_ref())
            .map(|compressed| decompress(compressed))
            .transpose()
    }

    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.map
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    Encoder::new().compress_vec(bytes).map_err(Into::into)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    Decoder::new()
        .decompress_vec(bytes)
        .map_err(|_| CorruptValue.into())
}
