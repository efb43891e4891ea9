//! Almacenamiento clave/valor respaldado por archivos.


use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use dashmap::DashMap;
use tracing::debug;
use super::domain::{Storage, StorageError};


/// Un archivo por clave dentro de `dir`. Las escrituras pasan por un archivo
/// temporal y un `rename`, así el documento se reemplaza completo o no se toca.
pub struct FileStorage {
    dir: PathBuf,
}


impl FileStorage {
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io { key: dir.display().to_string(), source })?;
        Ok(Self { dir })
    }
}


impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.dir.join(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { key: key.to_string(), source }),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.dir.join(key);
        let tmp = self.dir.join(format!("{key}.tmp"));
        fs::write(&tmp, bytes).map_err(|source| StorageError::Io { key: key.to_string(), source })?;
        fs::rename(&tmp, &path).map_err(|source| StorageError::Io { key: key.to_string(), source })?;
        debug!("Debug: {} bytes escritos en {}", bytes.len(), path.display());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.dir.join(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { key: key.to_string(), source }),
        }
    }
}


/// Almacenamiento en memoria para el banco de pruebas.
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Vec<u8>>,
}


impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}


impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_replaces_documents_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested")).unwrap();

        assert!(storage.load("doc.json").unwrap().is_none());
        storage.save("doc.json", b"{\"a\":1,\"long\":true}").unwrap();
        storage.save("doc.json", b"{\"a\":2}").unwrap();
        assert_eq!(storage.load("doc.json").unwrap().unwrap(), b"{\"a\":2}");
        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());

        storage.delete("doc.json").unwrap();
        storage.delete("doc.json").unwrap();
        assert!(storage.load("doc.json").unwrap().is_none());
    }

    #[test]
    fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        storage.save("k", b"v").unwrap();
        assert!(storage.contains("k"));
        storage.delete("k").unwrap();
        assert!(storage.load("k").unwrap().is_none());
    }
}
