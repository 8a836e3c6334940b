use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, Bytes, BytesMut};
use journalkeeper_core::error::{KeeperError, Result};
use journalkeeper_wire::messages::WireEntry;

use crate::journal::Journal;
use crate::raft::{now_millis, Entry, LogIndex, Term};

const SEGMENT_MAGIC: u32 = 0x4A4B_5347;
/// magic + first_index + first_term + created_at.
const SEGMENT_HEADER_LEN: u64 = 4 + 8 + 8 + 8;
const DEFAULT_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn crc(body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

/// One journal file covering a dense index range, with a fixed header and a
/// sequence of length + body + crc records.
#[derive(Debug)]
struct Segment {
    path: PathBuf,
    file: File,
    first_index: LogIndex,
    /// Per record: absolute offset of the body, body length, entry term.
    records: Vec<(u64, u32, Term)>,
    size: u64,
}

impl Segment {
    fn create(dir: &Path, first_index: LogIndex, first_term: Term) -> Result<Segment> {
        let path = dir.join(format!("{:020}.seg", first_index));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut header = [0u8; SEGMENT_HEADER_LEN as usize];
        BigEndian::write_u32(&mut header[0..4], SEGMENT_MAGIC);
        BigEndian::write_u64(&mut header[4..12], first_index);
        BigEndian::write_u64(&mut header[12..20], first_term);
        BigEndian::write_u64(&mut header[20..28], now_millis());
        file.write_all_at(&header, 0)?;
        file.sync_data()?;
        sync_dir(dir)?;
        Ok(Segment {
            path,
            file,
            first_index,
            records: Vec::new(),
            size: SEGMENT_HEADER_LEN,
        })
    }

    /// Validates the whole segment. A torn tail is recoverable only in the
    /// final segment; `None` means the file carried no usable header and
    /// should be deleted.
    fn open(path: PathBuf, is_last: bool) -> Result<Option<Segment>> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        if raw.len() < SEGMENT_HEADER_LEN as usize {
            if is_last {
                return Ok(None);
            }
            return Err(KeeperError::StorageFault(format!(
                "segment {} has no header",
                path.display()
            )));
        }
        if BigEndian::read_u32(&raw[0..4]) != SEGMENT_MAGIC {
            return Err(KeeperError::StorageFault(format!(
                "segment {} has a bad magic number",
                path.display()
            )));
        }
        let first_index = BigEndian::read_u64(&raw[4..12]);

        let mut records = Vec::new();
        let mut pos = SEGMENT_HEADER_LEN as usize;
        let mut torn = None;
        while pos < raw.len() {
            if pos + 4 > raw.len() {
                torn = Some(pos);
                break;
            }
            let len = BigEndian::read_u32(&raw[pos..pos + 4]) as usize;
            if pos + 4 + len + 4 > raw.len() {
                torn = Some(pos);
                break;
            }
            let body = &raw[pos + 4..pos + 4 + len];
            let stored = BigEndian::read_u32(&raw[pos + 4 + len..pos + 8 + len]);
            if crc(body) != stored {
                torn = Some(pos);
                break;
            }
            let mut bytes = Bytes::copy_from_slice(body);
            let wire = WireEntry::decode(&mut bytes)
                .map_err(|e| KeeperError::StorageFault(e.to_string()))?;
            if bytes.has_remaining() {
                return Err(KeeperError::StorageFault(format!(
                    "record slack in segment {}",
                    path.display()
                )));
            }
            let expected = first_index + records.len() as u64;
            if wire.index != expected {
                return Err(KeeperError::StorageFault(format!(
                    "segment {} holds index {} where {} was expected",
                    path.display(),
                    wire.index,
                    expected
                )));
            }
            records.push((pos as u64 + 4, len as u32, wire.term));
            pos += 8 + len;
        }

        if let Some(good) = torn {
            if !is_last {
                return Err(KeeperError::StorageFault(format!(
                    "torn record inside non-final segment {}",
                    path.display()
                )));
            }
            file.set_len(good as u64)?;
            file.sync_data()?;
            pos = good;
        }

        Ok(Some(Segment {
            path,
            file,
            first_index,
            records,
            size: pos as u64,
        }))
    }

    fn last_index(&self) -> Option<LogIndex> {
        if self.records.is_empty() {
            None
        } else {
            Some(self.first_index + self.records.len() as u64 - 1)
        }
    }

    /// Writes the record without a durability barrier; the caller syncs.
    fn append(&mut self, entry: &Entry) -> Result<()> {
        let mut body = BytesMut::new();
        entry.to_wire().encode(&mut body);
        let mut buf = Vec::with_capacity(body.len() + 8);
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&crc(&body).to_be_bytes());
        self.file.write_all_at(&buf, self.size)?;
        self.records
            .push((self.size + 4, body.len() as u32, entry.term));
        self.size += buf.len() as u64;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn read(&self, index: LogIndex) -> Result<Entry> {
        let slot = (index - self.first_index) as usize;
        let (offset, len, _) = self.records[slot];
        let mut record = vec![0u8; len as usize + 4];
        self.file.read_exact_at(&mut record, offset)?;
        let body = &record[..len as usize];
        let stored = BigEndian::read_u32(&record[len as usize..]);
        if crc(body) != stored {
            return Err(KeeperError::StorageFault(format!(
                "crc mismatch at index {}",
                index
            )));
        }
        let mut bytes = Bytes::copy_from_slice(body);
        let wire = WireEntry::decode(&mut bytes)
            .map_err(|e| KeeperError::StorageFault(e.to_string()))?;
        let entry = Entry::from_wire(wire).map_err(|e| KeeperError::StorageFault(e.to_string()))?;
        if entry.index != index {
            return Err(KeeperError::StorageFault(format!(
                "record at slot {} carries index {}",
                index, entry.index
            )));
        }
        Ok(entry)
    }

    fn truncate_to(&mut self, keep: usize) -> Result<()> {
        let new_size = if keep == 0 {
            SEGMENT_HEADER_LEN
        } else {
            let (offset, len, _) = self.records[keep - 1];
            offset + len as u64 + 4
        };
        self.file.set_len(new_size)?;
        self.file.sync_data()?;
        self.records.truncate(keep);
        self.size = new_size;
        Ok(())
    }
}

/// The on-disk journal: segment files named by their first index, owned
/// exclusively by the server process.
#[derive(Debug)]
pub struct FileJournal {
    dir: PathBuf,
    segments: Vec<Segment>,
    compacted_index: LogIndex,
    compacted_term: Term,
    segment_bytes: u64,
}

impl FileJournal {
    pub fn open(dir: PathBuf, compacted_index: LogIndex, compacted_term: Term) -> Result<FileJournal> {
        Self::with_segment_bytes(dir, compacted_index, compacted_term, DEFAULT_SEGMENT_BYTES)
    }

    pub fn with_segment_bytes(
        dir: PathBuf,
        compacted_index: LogIndex,
        compacted_term: Term,
        segment_bytes: u64,
    ) -> Result<FileJournal> {
        fs::create_dir_all(&dir)?;
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "seg").unwrap_or(false))
            .collect();
        paths.sort();

        let mut segments = Vec::new();
        let count = paths.len();
        for (i, path) in paths.into_iter().enumerate() {
            match Segment::open(path.clone(), i + 1 == count)? {
                Some(segment) => segments.push(segment),
                None => {
                    fs::remove_file(&path)?;
                    sync_dir(&dir)?;
                }
            }
        }

        let mut expected: Option<LogIndex> = None;
        for segment in &segments {
            if let Some(expected) = expected {
                if segment.first_index != expected {
                    return Err(KeeperError::StorageFault(format!(
                        "journal gap: segment starts at {} where {} was expected",
                        segment.first_index, expected
                    )));
                }
            }
            expected = Some(segment.first_index + segment.records.len() as u64);
        }

        Ok(FileJournal {
            dir,
            segments,
            compacted_index,
            compacted_term,
            segment_bytes,
        })
    }

    fn tail_index(&self) -> Option<LogIndex> {
        self.segments.iter().rev().find_map(|s| s.last_index())
    }

    fn locate(&self, index: LogIndex) -> Option<&Segment> {
        let slot = self.segments.partition_point(|s| s.first_index <= index);
        if slot == 0 {
            return None;
        }
        let segment = &self.segments[slot - 1];
        match segment.last_index() {
            Some(last) if index <= last => Some(segment),
            _ => None,
        }
    }

    fn check_readable(&self, index: LogIndex) -> Result<()> {
        if index <= self.compacted_index || index > self.last_index() {
            return Err(KeeperError::IoError(format!(
                "index {} not in journal [{}, {}]",
                index,
                self.first_index(),
                self.last_index()
            )));
        }
        Ok(())
    }

    /// Appends without syncing and reports whether a new segment was rolled.
    fn append_unsynced(&mut self, entry: &Entry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(KeeperError::StorageFault(format!(
                "non-contiguous append: {} after {}",
                entry.index,
                self.last_index()
            )));
        }
        let roll = match self.segments.last() {
            Some(segment) => segment.size >= self.segment_bytes,
            None => true,
        };
        if roll {
            self.segments
                .push(Segment::create(&self.dir, entry.index, entry.term)?);
        }
        self.segments.last_mut().unwrap().append(entry)
    }
}

impl Journal for FileJournal {
    fn first_index(&self) -> LogIndex {
        self.compacted_index + 1
    }

    fn last_index(&self) -> LogIndex {
        self.tail_index().unwrap_or(0).max(self.compacted_index)
    }

    fn last_term(&self) -> Term {
        match self.tail_index() {
            Some(index) => self.term_at(index).unwrap_or(self.compacted_term),
            None => self.compacted_term,
        }
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.compacted_index && index > 0 {
            return Some(self.compacted_term);
        }
        if index <= self.compacted_index {
            return None;
        }
        let segment = self.locate(index)?;
        let slot = (index - segment.first_index) as usize;
        segment.records.get(slot).map(|r| r.2)
    }

    fn append(&mut self, entry: Entry) -> Result<LogIndex> {
        let index = entry.index;
        self.append_unsynced(&entry)?;
        self.segments.last().unwrap().sync()?;
        Ok(index)
    }

    fn append_batch(&mut self, entries: Vec<Entry>) -> Result<LogIndex> {
        if entries.is_empty() {
            return Ok(self.last_index());
        }
        let before = self.segments.len();
        for entry in &entries {
            self.append_unsynced(entry)?;
        }
        // One durability barrier per touched segment: the previous tail if
        // the batch continued it, plus anything rolled since.
        let from = before.saturating_sub(1);
        for segment in &self.segments[from..] {
            segment.sync()?;
        }
        Ok(self.last_index())
    }

    fn read_at(&self, index: LogIndex) -> Result<Entry> {
        self.check_readable(index)?;
        match self.locate(index) {
            Some(segment) => segment.read(index),
            None => Err(KeeperError::IoError(format!(
                "index {} not in journal",
                index
            ))),
        }
    }

    fn read_range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        let mut index = from;
        while index < to {
            entries.push(self.read_at(index)?);
            index += 1;
        }
        Ok(entries)
    }

    fn truncate_after(&mut self, index: LogIndex) -> Result<()> {
        if index >= self.last_index() {
            return Ok(());
        }
        if index < self.compacted_index {
            return Err(KeeperError::IoError(format!(
                "cannot truncate into compacted prefix at {}",
                index
            )));
        }
        let mut removed = false;
        loop {
            let drop = match self.segments.last() {
                Some(segment) => segment.first_index > index,
                None => false,
            };
            if !drop {
                break;
            }
            let segment = self.segments.pop().unwrap();
            fs::remove_file(&segment.path)?;
            removed = true;
        }
        if removed {
            sync_dir(&self.dir)?;
        }
        if let Some(segment) = self.segments.last_mut() {
            if let Some(last) = segment.last_index() {
                if last > index {
                    segment.truncate_to((index + 1 - segment.first_index) as usize)?;
                }
            }
        }
        Ok(())
    }

    fn compact_to(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index <= self.compacted_index {
            return Ok(());
        }
        self.compacted_index = index;
        self.compacted_term = term;
        let mut removed = false;
        while !self.segments.is_empty() {
            let fully = {
                let segment = &self.segments[0];
                match segment.last_index() {
                    Some(last) => last <= index,
                    None => segment.first_index <= index,
                }
            };
            if !fully {
                break;
            }
            let segment = self.segments.remove(0);
            fs::remove_file(&segment.path)?;
            removed = true;
        }
        if removed {
            sync_dir(&self.dir)?;
        }
        Ok(())
    }

    fn reset(&mut self, index: LogIndex, term: Term) -> Result<()> {
        for segment in self.segments.drain(..) {
            fs::remove_file(&segment.path)?;
        }
        sync_dir(&self.dir)?;
        self.compacted_index = index;
        self.compacted_term = term;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::EntryKind;

    fn entry(term: Term, index: LogIndex) -> Entry {
        Entry {
            term,
            index,
            partition: (index % 4) as u16,
            batch_size: 1,
            timestamp: now_millis(),
            kind: EntryKind::Entry,
            header: None,
            payload: format!("payload-{}", index).into_bytes(),
        }
    }

    fn journal(dir: &Path) -> FileJournal {
        FileJournal::with_segment_bytes(dir.to_path_buf(), 0, 0, 256).unwrap()
    }

    #[test]
    fn append_read_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = journal(dir.path());
        for i in 1..=20 {
            let e = entry(1, i);
            assert_eq!(j.append(e.clone()).unwrap(), i);
            assert_eq!(j.read_at(i).unwrap(), e);
        }
        assert!(j.segments.len() > 1, "small segments should have rolled");
        drop(j);

        let j = journal(dir.path());
        assert_eq!(j.last_index(), 20);
        assert_eq!(j.read_at(7).unwrap().payload, b"payload-7".to_vec());
    }

    #[test]
    fn truncate_after_drops_suffix_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = journal(dir.path());
        for i in 1..=20 {
            j.append(entry(1, i)).unwrap();
        }
        j.truncate_after(5).unwrap();
        assert_eq!(j.last_index(), 5);
        assert!(j.read_at(5).is_ok());
        assert!(j.read_at(6).is_err());

        // Appends continue from the truncation point and survive reopen.
        j.append(entry(2, 6)).unwrap();
        drop(j);
        let j = journal(dir.path());
        assert_eq!(j.last_index(), 6);
        assert_eq!(j.term_at(6), Some(2));
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = journal(dir.path());
        for i in 1..=3 {
            j.append(entry(1, i)).unwrap();
        }
        let path = j.segments.last().unwrap().path.clone();
        let size = j.segments.last().unwrap().size;
        drop(j);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(size - 3).unwrap();
        drop(file);

        let j = journal(dir.path());
        assert_eq!(j.last_index(), 2);
        assert!(j.read_at(2).is_ok());
    }

    #[test]
    fn corruption_in_sealed_segment_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = journal(dir.path());
        for i in 1..=20 {
            j.append(entry(1, i)).unwrap();
        }
        assert!(j.segments.len() > 1);
        let path = j.segments[0].path.clone();
        let (offset, _, _) = j.segments[0].records[0];
        drop(j);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0xFF], offset + 9).unwrap();
        drop(file);

        let err = FileJournal::with_segment_bytes(dir.path().to_path_buf(), 0, 0, 256).unwrap_err();
        assert!(matches!(err, KeeperError::StorageFault(_)));
    }

    #[test]
    fn compaction_moves_first_index_and_deletes_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = journal(dir.path());
        for i in 1..=20 {
            j.append(entry(1, i)).unwrap();
        }
        let before = j.segments.len();
        j.compact_to(10, 1).unwrap();
        assert!(j.segments.len() < before);
        assert_eq!(j.first_index(), 11);
        assert!(j.read_at(10).is_err());
        assert_eq!(j.term_at(10), Some(1));
        assert!(j.read_at(11).is_ok());

        // The boundary survives reopen through the metadata the caller keeps.
        drop(j);
        let j = FileJournal::with_segment_bytes(dir.path().to_path_buf(), 10, 1, 256).unwrap();
        assert_eq!(j.first_index(), 11);
        assert_eq!(j.last_index(), 20);
    }

    #[test]
    fn reset_discards_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = journal(dir.path());
        for i in 1..=5 {
            j.append(entry(1, i)).unwrap();
        }
        j.reset(100, 7).unwrap();
        assert_eq!(j.first_index(), 101);
        assert_eq!(j.last_index(), 100);
        assert_eq!(j.term_at(100), Some(7));
        j.append(entry(8, 101)).unwrap();
        assert_eq!(j.read_at(101).unwrap().term, 8);
    }
}
