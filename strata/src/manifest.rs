use crate::error::*;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use strata_utils::RefCounter;

/// The file name of the manifest.
pub const MANIFEST_FILENAME: &str = "MANIFEST";
const MANIFEST_REWRITE_FILENAME: &str = "MANIFEST-REWRITE";

const MAGIC: &[u8; 4] = b"STRM";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 8;
const CHANGE_SIZE: usize = 13;

// Rewrite the log once it holds ten thousand deletions outnumbering live
// creations ten to one.
const DELETIONS_REWRITE_THRESHOLD: usize = 10_000;
const DELETIONS_RATIO: usize = 10;

/// One edit to the `{file_id -> level}` map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ManifestChange {
    Create { id: u64, level: u32 },
    Delete { id: u64 },
    MoveDown { id: u64, level: u32 },
}

impl ManifestChange {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            ManifestChange::Create { id, level } => {
                buf.put_u8(0);
                buf.put_u64(*id);
                buf.put_u32(*level);
            }
            ManifestChange::Delete { id } => {
                buf.put_u8(1);
                buf.put_u64(*id);
                buf.put_u32(0);
            }
            ManifestChange::MoveDown { id, level } => {
                buf.put_u8(2);
                buf.put_u64(*id);
                buf.put_u32(*level);
            }
        }
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        let tag = buf.get_u8();
        let id = buf.get_u64();
        let level = buf.get_u32();
        match tag {
            0 => Ok(ManifestChange::Create { id, level }),
            1 => Ok(ManifestChange::Delete { id }),
            2 => Ok(ManifestChange::MoveDown { id, level }),
            _ => Err(Error::Corruption(format!("unknown manifest tag {}", tag))),
        }
    }
}

/// The manifest's knowledge about one table file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TableManifest {
    pub level: u32,
}

struct Inner {
    file: File,
    dir: PathBuf,
    read_only: bool,
    tables: HashMap<u64, TableManifest>,
    creations: usize,
    deletions: usize,
}

/// The append-only log of level assignments. Replaying its change sets in
/// order yields the `{file_id -> level}` map; appends are serialized and
/// fsynced before the caller may install the change in memory.
#[derive(Clone)]
#[repr(transparent)]
pub struct Manifest {
    inner: RefCounter<Mutex<Inner>>,
}

impl Manifest {
    /// Opens the manifest in `dir`, creating an empty one unless `read_only`.
    /// A torn trailing record left by a crash is truncated away.
    pub fn open(dir: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(MANIFEST_FILENAME);

        if !path.exists() {
            if read_only {
                return Err(Error::Corruption(
                    "no manifest in read-only directory".to_string(),
                ));
            }
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            let mut header = BytesMut::with_capacity(HEADER_SIZE);
            header.put_slice(MAGIC);
            header.put_u32(VERSION);
            file.write_all(&header)?;
            file.sync_all()?;
            sync_dir(&dir)?;
            return Ok(Self {
                inner: RefCounter::new(Mutex::new(Inner {
                    file,
                    dir,
                    read_only,
                    tables: HashMap::new(),
                    creations: 0,
                    deletions: 0,
                })),
            });
        }

        let mut file = if read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new().read(true).write(true).open(&path)?
        };

        let (tables, creations, deletions, good_offset) = Self::replay(&mut file)?;
        if !read_only {
            file.set_len(good_offset)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            inner: RefCounter::new(Mutex::new(Inner {
                file,
                dir,
                read_only,
                tables,
                creations,
                deletions,
            })),
        })
    }

    fn replay(file: &mut File) -> Result<(HashMap<u64, TableManifest>, usize, usize, u64)> {
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)
            .map_err(|_| Error::Corruption("manifest too short for header".to_string()))?;
        if &header[..4] != MAGIC {
            return Err(Error::Corruption("bad manifest magic".to_string()));
        }
        let version = u32::from_be_bytes(header[4..].try_into().unwrap());
        if version != VERSION {
            return Err(Error::Corruption(format!(
                "unsupported manifest version {}",
                version
            )));
        }

        let mut tables = HashMap::new();
        let mut creations = 0;
        let mut deletions = 0;
        let mut good_offset = HEADER_SIZE as u64;

        loop {
            let mut frame = [0u8; 8];
            match file.read_exact(&mut frame) {
                Ok(()) => {}
                // A torn trailing record ends replay.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
            let crc = u32::from_be_bytes(frame[4..].try_into().unwrap());

            let mut payload = vec![0u8; len];
            match file.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if crc32fast::hash(&payload) != crc {
                return Err(Error::Corruption(
                    "manifest record checksum mismatch".to_string(),
                ));
            }
            if len % CHANGE_SIZE != 0 {
                return Err(Error::Corruption(format!(
                    "manifest record of {} bytes is not a change set",
                    len
                )));
            }

            for chunk in payload.chunks(CHANGE_SIZE) {
                let change = ManifestChange::decode(chunk)?;
                Self::apply(&mut tables, &mut creations, &mut deletions, change)?;
            }
            good_offset += (8 + len) as u64;
        }

        Ok((tables, creations, deletions, good_offset))
    }

    fn apply(
        tables: &mut HashMap<u64, TableManifest>,
        creations: &mut usize,
        deletions: &mut usize,
        change: ManifestChange,
    ) -> Result<()> {
        match change {
            ManifestChange::Create { id, level } => {
                if tables.insert(id, TableManifest { level }).is_some() {
                    return Err(Error::Corruption(format!(
                        "manifest creates table {} twice",
                        id
                    )));
                }
                *creations += 1;
            }
            ManifestChange::Delete { id } => {
                if tables.remove(&id).is_none() {
                    return Err(Error::Corruption(format!(
                        "manifest deletes unknown table {}",
                        id
                    )));
                }
                *deletions += 1;
            }
            ManifestChange::MoveDown { id, level } => match tables.get_mut(&id) {
                Some(tm) => tm.level = level,
                None => {
                    return Err(Error::Corruption(format!(
                        "manifest moves unknown table {}",
                        id
                    )))
                }
            },
        }
        Ok(())
    }

    /// Applies a change set to the in-memory map, then appends it durably.
    /// Callers must not install the change elsewhere until this returns; a
    /// failure here leaves disk and memory about to diverge and is treated
    /// as fatal by the engine.
    pub fn add_changes(&self, changes: Vec<ManifestChange>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.read_only {
            return Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "manifest is read-only",
            )));
        }
        let inner = &mut *inner;

        let mut payload = BytesMut::with_capacity(changes.len() * CHANGE_SIZE);
        for change in &changes {
            Self::apply(
                &mut inner.tables,
                &mut inner.creations,
                &mut inner.deletions,
                *change,
            )?;
            change.encode(&mut payload);
        }

        if inner.deletions > DELETIONS_REWRITE_THRESHOLD
            && inner.deletions > DELETIONS_RATIO * inner.creations
        {
            Self::rewrite(inner)?;
            return Ok(());
        }

        let mut frame = BytesMut::with_capacity(8 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_u32(crc32fast::hash(&payload));
        frame.put_slice(&payload);

        inner.file.write_all(&frame)?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Compacts the log to one change set describing the live tables, via a
    /// temp file and an atomic rename.
    fn rewrite(inner: &mut Inner) -> Result<()> {
        tracing::info!(
            target: "manifest",
            creations = inner.creations,
            deletions = inner.deletions,
            "rewriting manifest"
        );

        let mut payload = BytesMut::with_capacity(inner.tables.len() * CHANGE_SIZE);
        for (id, tm) in &inner.tables {
            ManifestChange::Create {
                id: *id,
                level: tm.level,
            }
            .encode(&mut payload);
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 8 + payload.len());
        buf.put_slice(MAGIC);
        buf.put_u32(VERSION);
        buf.put_u32(payload.len() as u32);
        buf.put_u32(crc32fast::hash(&payload));
        buf.put_slice(&payload);

        let tmp_path = inner.dir.join(MANIFEST_REWRITE_FILENAME);
        let path = inner.dir.join(MANIFEST_FILENAME);
        let mut tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        drop(tmp);

        std::fs::rename(&tmp_path, &path)?;
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        sync_dir(&inner.dir)?;

        inner.file = file;
        inner.creations = inner.tables.len();
        inner.deletions = 0;
        Ok(())
    }

    /// A snapshot of the `{file_id -> level}` map.
    pub fn tables(&self) -> HashMap<u64, TableManifest> {
        self.inner.lock().tables.clone()
    }

    #[cfg(test)]
    fn force_rewrite(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::rewrite(&mut inner)
    }
}

/// Ensures directory entries (created, renamed, removed files) are durable.
pub(crate) fn sync_dir(dir: impl AsRef<Path>) -> Result<()> {
    File::open(dir.as_ref())?.sync_all().map_err(From::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn replay_rebuilds_the_map() {
        let dir = tempdir().unwrap();
        let m = Manifest::open(dir.path(), false).unwrap();
        m.add_changes(vec![
            ManifestChange::Create { id: 1, level: 0 },
            ManifestChange::Create { id: 2, level: 0 },
        ])
        .unwrap();
        m.add_changes(vec![
            ManifestChange::Create { id: 3, level: 1 },
            ManifestChange::Delete { id: 1 },
            ManifestChange::MoveDown { id: 2, level: 1 },
        ])
        .unwrap();
        drop(m);

        let m = Manifest::open(dir.path(), false).unwrap();
        let tables = m.tables();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[&2].level, 1);
        assert_eq!(tables[&3].level, 1);
        assert!(!tables.contains_key(&1));
    }

    #[test]
    fn rejects_inconsistent_changes() {
        let dir = tempdir().unwrap();
        let m = Manifest::open(dir.path(), false).unwrap();
        m.add_changes(vec![ManifestChange::Create { id: 1, level: 0 }])
            .unwrap();
        assert!(m
            .add_changes(vec![ManifestChange::Create { id: 1, level: 0 }])
            .is_err());
        assert!(m
            .add_changes(vec![ManifestChange::Delete { id: 99 }])
            .is_err());
    }

    #[test]
    fn torn_trailing_record_is_truncated() {
        let dir = tempdir().unwrap();
        let m = Manifest::open(dir.path(), false).unwrap();
        m.add_changes(vec![ManifestChange::Create { id: 1, level: 0 }])
            .unwrap();
        drop(m);

        let path = dir.path().join(MANIFEST_FILENAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        // A frame header promising more bytes than exist.
        file.write_all(&[0, 0, 0, 13, 0, 0, 0, 0, 9]).unwrap();
        drop(file);

        let m = Manifest::open(dir.path(), false).unwrap();
        assert_eq!(m.tables().len(), 1);
        // The torn bytes are gone; further appends land on a clean tail.
        m.add_changes(vec![ManifestChange::Create { id: 2, level: 0 }])
            .unwrap();
        drop(m);
        let m = Manifest::open(dir.path(), false).unwrap();
        assert_eq!(m.tables().len(), 2);
    }

    #[test]
    fn rewrite_compacts_the_log() {
        let dir = tempdir().unwrap();
        let m = Manifest::open(dir.path(), false).unwrap();
        for id in 0..20u64 {
            m.add_changes(vec![ManifestChange::Create { id, level: 0 }])
                .unwrap();
        }
        for id in 0..19u64 {
            m.add_changes(vec![
                ManifestChange::Create {
                    id: 100 + id,
                    level: 1,
                },
                ManifestChange::Delete { id },
            ])
            .unwrap();
        }
        let before = std::fs::metadata(dir.path().join(MANIFEST_FILENAME))
            .unwrap()
            .len();

        m.force_rewrite().unwrap();
        let after = std::fs::metadata(dir.path().join(MANIFEST_FILENAME))
            .unwrap()
            .len();
        assert!(after < before, "rewrite must shrink the log");

        // The rewritten log replays to the same map and accepts appends.
        let snapshot = m.tables();
        m.add_changes(vec![ManifestChange::Create { id: 500, level: 2 }])
            .unwrap();
        drop(m);

        let m = Manifest::open(dir.path(), false).unwrap();
        let tables = m.tables();
        assert_eq!(tables.len(), snapshot.len() + 1);
        for (id, tm) in snapshot {
            assert_eq!(tables[&id], tm);
        }
        assert_eq!(tables[&500].level, 2);
    }

    #[test]
    fn read_only_refuses_appends() {
        let dir = tempdir().unwrap();
        let m = Manifest::open(dir.path(), false).unwrap();
        m.add_changes(vec![ManifestChange::Create { id: 1, level: 0 }])
            .unwrap();
        drop(m);

        let m = Manifest::open(dir.path(), true).unwrap();
        assert_eq!(m.tables().len(), 1);
        assert!(m
            .add_changes(vec![ManifestChange::Create { id: 2, level: 0 }])
            .is_err());
    }
}
