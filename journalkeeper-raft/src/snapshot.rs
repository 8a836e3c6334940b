//! Snapshot files: immutable once closed, named by the last included
//! position, renamed into place atomically.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use journalkeeper_core::error::{KeeperError, Result};

use crate::raft::{LogIndex, Term};

const SNAPSHOT_MAGIC: u32 = 0x4A4B_534E;
const SNAPSHOT_HEADER_LEN: usize = 4 + 8 + 8;
/// How many closed snapshots stay on disk.
const RETAINED: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
}

pub struct Snapshotter {
    dir: PathBuf,
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn parse_name(path: &Path) -> Option<SnapshotMeta> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()?.to_str()? != "snapshot" {
        return None;
    }
    let mut parts = stem.splitn(2, '-');
    let index = parts.next()?.parse().ok()?;
    let term = parts.next()?.parse().ok()?;
    Some(SnapshotMeta {
        last_included_index: index,
        last_included_term: term,
    })
}

impl Snapshotter {
    pub fn open(dir: PathBuf) -> Result<Snapshotter> {
        fs::create_dir_all(&dir)?;
        Ok(Snapshotter { dir })
    }

    fn path(&self, meta: SnapshotMeta) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.snapshot",
            meta.last_included_index, meta.last_included_term
        ))
    }

    /// The newest closed snapshot, by included index.
    pub fn latest(&self) -> Result<Option<SnapshotMeta>> {
        let mut latest: Option<SnapshotMeta> = None;
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if let Some(meta) = parse_name(&path) {
                if latest
                    .map(|l| meta.last_included_index > l.last_included_index)
                    .unwrap_or(true)
                {
                    latest = Some(meta);
                }
            }
        }
        Ok(latest)
    }

    pub fn write(&self, meta: SnapshotMeta, data: &[u8]) -> Result<()> {
        let path = self.path(meta);
        if path.exists() {
            return Ok(());
        }
        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut header = [0u8; SNAPSHOT_HEADER_LEN];
        BigEndian::write_u32(&mut header[0..4], SNAPSHOT_MAGIC);
        BigEndian::write_u64(&mut header[4..12], meta.last_included_index);
        BigEndian::write_u64(&mut header[12..20], meta.last_included_term);
        file.write_all(&header)?;
        file.write_all(data)?;
        file.sync_data()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        sync_dir(&self.dir)?;
        self.prune()?;
        Ok(())
    }

    fn prune(&self) -> Result<()> {
        let mut metas = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if let Some(meta) = parse_name(&path) {
                metas.push(meta);
            }
        }
        metas.sort_by_key(|m| m.last_included_index);
        while metas.len() > RETAINED {
            let meta = metas.remove(0);
            fs::remove_file(self.path(meta))?;
        }
        Ok(())
    }

    pub fn read(&self, meta: SnapshotMeta) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        File::open(self.path(meta))?.read_to_end(&mut raw)?;
        if raw.len() < SNAPSHOT_HEADER_LEN
            || BigEndian::read_u32(&raw[0..4]) != SNAPSHOT_MAGIC
            || BigEndian::read_u64(&raw[4..12]) != meta.last_included_index
            || BigEndian::read_u64(&raw[12..20]) != meta.last_included_term
        {
            return Err(KeeperError::StorageFault(format!(
                "snapshot {}-{} is corrupt",
                meta.last_included_index, meta.last_included_term
            )));
        }
        Ok(raw[SNAPSHOT_HEADER_LEN..].to_vec())
    }

    /// One chunk of the snapshot body, plus whether it is the final one.
    pub fn read_chunk(
        &self,
        meta: SnapshotMeta,
        offset: u64,
        chunk: usize,
    ) -> Result<(Vec<u8>, bool)> {
        let data = self.read(meta)?;
        let from = (offset as usize).min(data.len());
        let to = (from + chunk).min(data.len());
        Ok((data[from..to].to_vec(), to == data.len()))
    }
}

/// Follower-side assembly of a streamed snapshot.
#[derive(Debug)]
pub struct IncomingSnapshot {
    pub meta: SnapshotMeta,
    data: Vec<u8>,
}

impl IncomingSnapshot {
    pub fn new(meta: SnapshotMeta) -> IncomingSnapshot {
        IncomingSnapshot {
            meta,
            data: Vec::new(),
        }
    }

    pub fn next_offset(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn accept(&mut self, chunk: Vec<u8>) {
        self.data.extend_from_slice(&chunk);
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = Snapshotter::open(dir.path().to_path_buf()).unwrap();
        assert!(snapshots.latest().unwrap().is_none());

        let meta = SnapshotMeta {
            last_included_index: 10,
            last_included_term: 2,
        };
        snapshots.write(meta, b"state-at-10").unwrap();
        assert_eq!(snapshots.latest().unwrap(), Some(meta));
        assert_eq!(snapshots.read(meta).unwrap(), b"state-at-10".to_vec());
    }

    #[test]
    fn chunked_reads_cover_the_body() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = Snapshotter::open(dir.path().to_path_buf()).unwrap();
        let meta = SnapshotMeta {
            last_included_index: 5,
            last_included_term: 1,
        };
        snapshots.write(meta, &[7u8; 10]).unwrap();

        let (first, done) = snapshots.read_chunk(meta, 0, 6).unwrap();
        assert_eq!(first.len(), 6);
        assert!(!done);
        let (second, done) = snapshots.read_chunk(meta, 6, 6).unwrap();
        assert_eq!(second.len(), 4);
        assert!(done);
    }

    #[test]
    fn old_snapshots_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = Snapshotter::open(dir.path().to_path_buf()).unwrap();
        for index in 1..=4 {
            let meta = SnapshotMeta {
                last_included_index: index,
                last_included_term: 1,
            };
            snapshots.write(meta, b"x").unwrap();
        }
        let survivors = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| parse_name(&e.as_ref().unwrap().path()).is_some())
            .count();
        assert_eq!(survivors, RETAINED);
        assert_eq!(
            snapshots.latest().unwrap().unwrap().last_included_index,
            4
        );
    }

    #[test]
    fn incoming_snapshot_assembles_in_order() {
        let meta = SnapshotMeta {
            last_included_index: 3,
            last_included_term: 1,
        };
        let mut incoming = IncomingSnapshot::new(meta);
        assert_eq!(incoming.next_offset(), 0);
        incoming.accept(b"ab".to_vec());
        incoming.accept(b"cd".to_vec());
        assert_eq!(incoming.next_offset(), 4);
        assert_eq!(incoming.into_data(), b"abcd".to_vec());
    }
}
