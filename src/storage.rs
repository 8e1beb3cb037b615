use std::io::Write;
use std::path::{Path, PathBuf};

use crate::eid::Eid;

/// Flat key/value file storage rooted at one directory.
pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    /// Appends in place, creating the file if needed. Not atomic: readers
    /// must tolerate a torn last record.
    fn append(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> std::io::Result<()>;
    fn path_of(&self, ident: &str) -> PathBuf;
}

#[derive(Clone, Debug)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Ok(BackendLocal { base_dir: path })
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.path_of(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path_of(ident))
    }

    /// Writes through a uniquely named temp file and renames it into place,
    /// so readers never observe a half-written file.
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.path_of(ident);
        let temp_path = self.base_dir.join(format!("{}-{ident}", Eid::new()));

        if let Err(err) = std::fs::write(&temp_path, data) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        std::fs::rename(&temp_path, &path)
    }

    fn append(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_of(ident))?;
        file.write_all(data)
    }

    fn delete(&self, ident: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.path_of(ident))
    }

    fn path_of(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();

        assert!(!store.exists("state.json"));
        store.write("state.json", b"{}").unwrap();
        assert!(store.exists("state.json"));
        assert_eq!(store.read("state.json").unwrap(), b"{}");

        // overwrite leaves no temp files behind
        store.write("state.json", b"{\"a\":1}").unwrap();
        let files: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(files.len(), 1);

        store.delete("state.json").unwrap();
        assert!(!store.exists("state.json"));
    }

    #[test]
    fn test_append_extends_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();

        store.append("journal", b"a\n").unwrap();
        store.append("journal", b"b\n").unwrap();
        assert_eq!(store.read("journal").unwrap(), b"a\nb\n");
    }

    #[test]
    fn test_new_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        let store = BackendLocal::new(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(store.path_of("x"), nested.join("x"));
    }
}
