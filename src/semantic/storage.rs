//! On-disk embedding collections, one file each (`content_vectors.bin`,
//! `module_vectors.bin`). All integers and floats are little-endian.
//!
//! A 47 byte header comes first: format version (u8), model fingerprint
//! (sha256 of the model name, 32 bytes), dimensions (u16), entry count
//! (u64) and a crc32 over everything before it.
//!
//! Each entry is the item id (u64), the hash of the text that was embedded
//! (u64) and `dimensions` f32 components.
//!
//! Incremental writes go to a `.log` file next to the snapshot: bare entries
//! in the same layout, replayed over the snapshot on load, last one wins.
//! A full save folds the log away.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::VectorIndex;

const FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 47;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("vector file io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed vector file: {0}")]
    InvalidFormat(String),

    #[error("vector file format v{0} is newer than supported v{1}")]
    VersionMismatch(u8, u8),

    #[error("vectors were produced by a different embedding model")]
    ModelMismatch,

    #[error("vector file header failed its checksum")]
    ChecksumMismatch,
}

pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the collection written for `expected_model_id`.
    pub fn load(&self, expected_model_id: &[u8; 32]) -> Result<VectorIndex, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        let dimensions = header.dimensions as usize;
        let mut index = VectorIndex::with_capacity(dimensions, header.entry_count as usize);
        let mut buf = vec![0f32; dimensions];

        for _ in 0..header.entry_count {
            let (id, text_hash) = read_entry(&mut reader, &mut buf)?;
            // zero-norm rows cannot be scored, skip them
            let _ = index.insert(id, text_hash, &buf);
        }

        let log_path = self.log_path();
        if log_path.exists() {
            let mut logged = BufReader::new(File::open(&log_path)?);
            let mut replayed = 0usize;
            loop {
                match read_entry(&mut logged, &mut buf) {
                    Ok((id, text_hash)) => {
                        let _ = index.insert(id, text_hash, &buf);
                        replayed += 1;
                    }
                    Err(VectorStorageError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e),
                }
            }
            log::debug!("{}: replayed {replayed} logged vectors", self.path.display());
        }

        Ok(index)
    }

    fn log_path(&self) -> PathBuf {
        self.path.with_extension("log")
    }

    /// A snapshot the log can extend: same model and dimensions.
    fn snapshot_accepts(&self, index: &VectorIndex, model_id: &[u8; 32]) -> bool {
        let Ok(file) = File::open(&self.path) else {
            return false;
        };
        match read_header(&mut BufReader::new(file)) {
            Ok(header) => header.model_id == *model_id && header.dimensions as usize == index.dimensions(),
            Err(_) => false,
        }
    }

    fn log_outgrew_snapshot(&self) -> bool {
        let size = |path: &Path| std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        size(&self.log_path()) > size(&self.path)
    }

    /// Persist only the entries for `ids`. Falls back to a full save when
    /// there is no compatible snapshot yet or the log has grown past it.
    pub fn append(&self, index: &VectorIndex, ids: &[u64], model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        if !self.snapshot_accepts(index, model_id) || self.log_outgrew_snapshot() {
            return self.save(index, model_id);
        }

        let file = OpenOptions::new().create(true).append(true).open(self.log_path())?;
        let mut writer = BufWriter::new(file);
        for entry in ids.iter().filter_map(|id| index.get(*id)) {
            write_entry(&mut writer, entry.id, entry.text_hash, entry.embedding)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Load, treating a missing file or a file from another model as empty.
    /// Corruption is still an error.
    pub fn load_or_empty(&self, model_id: &[u8; 32]) -> Result<VectorIndex, VectorStorageError> {
        if !self.exists() {
            return Ok(VectorIndex::default());
        }

        match self.load(model_id) {
            Err(VectorStorageError::ModelMismatch) => {
                log::warn!(
                    "{} was written by a different embedding model, discarding",
                    self.path.display()
                );
                Ok(VectorIndex::default())
            }
            other => other,
        }
    }

    /// Atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        if let Err(err) = self.write_to_file(&temp_path, index, model_id) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        std::fs::rename(&temp_path, &self.path)?;

        let log_path = self.log_path();
        if log_path.exists() {
            std::fs::remove_file(&log_path)?;
        }
        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the header",
                index.dimensions()
            ))
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        write_header(
            &mut writer,
            &Header {
                version: FORMAT_VERSION,
                model_id: *model_id,
                dimensions,
                entry_count: index.len() as u64,
            },
        )?;

        for entry in index.iter() {
            write_entry(&mut writer, entry.id, entry.text_hash, entry.embedding)?;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            VectorStorageError::InvalidFormat("truncated header".to_string())
        } else {
            VectorStorageError::Io(e)
        }
    })?;

    let version = bytes[0];
    if version > FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes([bytes[43], bytes[44], bytes[45], bytes[46]]);
    if stored_checksum != crc32fast::hash(&bytes[0..43]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&bytes[1..33]);

    let mut count = [0u8; 8];
    count.copy_from_slice(&bytes[35..43]);

    Ok(Header {
        version,
        model_id,
        dimensions: u16::from_le_bytes([bytes[33], bytes[34]]),
        entry_count: u64::from_le_bytes(count),
    })
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];

    bytes[0] = header.version;
    bytes[1..33].copy_from_slice(&header.model_id);
    bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&bytes[0..43]);
    bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&bytes)?;
    Ok(())
}

fn write_entry(writer: &mut impl Write, id: u64, text_hash: u64, embedding: &[f32]) -> Result<(), VectorStorageError> {
    writer.write_all(&id.to_le_bytes())?;
    writer.write_all(&text_hash.to_le_bytes())?;
    for value in embedding {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_entry(reader: &mut impl Read, embedding: &mut [f32]) -> Result<(u64, u64), VectorStorageError> {
    let mut word = [0u8; 8];
    reader.read_exact(&mut word)?;
    let id = u64::from_le_bytes(word);

    reader.read_exact(&mut word)?;
    let text_hash = u64::from_le_bytes(word);

    let mut float_bytes = [0u8; 4];
    for value in embedding.iter_mut() {
        reader.read_exact(&mut float_bytes)?;
        *value = f32::from_le_bytes(float_bytes);
    }

    Ok((id, text_hash))
}
