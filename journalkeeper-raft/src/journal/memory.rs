use journalkeeper_core::error::{KeeperError, Result};

use crate::journal::Journal;
use crate::raft::{Entry, LogIndex, Term};

/// In-memory journal used for tests and wiring experiments.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    compacted_index: LogIndex,
    compacted_term: Term,
    entries: Vec<Entry>,
}

impl MemoryJournal {
    pub fn new() -> MemoryJournal {
        MemoryJournal::default()
    }

    fn offset(&self, index: LogIndex) -> Result<usize> {
        if index <= self.compacted_index || index > self.last_index() {
            return Err(KeeperError::IoError(format!(
                "index {} not in journal [{}, {}]",
                index,
                self.first_index(),
                self.last_index()
            )));
        }
        Ok((index - self.compacted_index - 1) as usize)
    }
}

impl Journal for MemoryJournal {
    fn first_index(&self) -> LogIndex {
        self.compacted_index + 1
    }

    fn last_index(&self) -> LogIndex {
        self.compacted_index + self.entries.len() as u64
    }

    fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.compacted_term)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.compacted_index && index > 0 {
            return Some(self.compacted_term);
        }
        let offset = self.offset(index).ok()?;
        Some(self.entries[offset].term)
    }

    fn append(&mut self, entry: Entry) -> Result<LogIndex> {
        if entry.index != self.last_index() + 1 {
            return Err(KeeperError::StorageFault(format!(
                "non-contiguous append: {} after {}",
                entry.index,
                self.last_index()
            )));
        }
        let index = entry.index;
        self.entries.push(entry);
        Ok(index)
    }

    fn append_batch(&mut self, entries: Vec<Entry>) -> Result<LogIndex> {
        for entry in entries {
            self.append(entry)?;
        }
        Ok(self.last_index())
    }

    fn read_at(&self, index: LogIndex) -> Result<Entry> {
        let offset = self.offset(index)?;
        Ok(self.entries[offset].clone())
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
        if index < self.compacted_index {
            return Err(KeeperError::IoError(format!(
                "cannot truncate into compacted prefix at {}",
                index
            )));
        }
        let keep = (index - self.compacted_index) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    fn compact_to(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index <= self.compacted_index {
            return Ok(());
        }
        let drop = ((index - self.compacted_index) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.compacted_index = index;
        self.compacted_term = term;
        Ok(())
    }

    fn reset(&mut self, index: LogIndex, term: Term) -> Result<()> {
        self.entries.clear();
        self.compacted_index = index;
        self.compacted_term = term;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{now_millis, EntryKind};

    fn entry(term: Term, index: LogIndex) -> Entry {
        Entry {
            term,
            index,
            partition: 0,
            batch_size: 1,
            timestamp: now_millis(),
            kind: EntryKind::Entry,
            header: None,
            payload: index.to_be_bytes().to_vec(),
        }
    }

    #[test]
    fn append_then_read_round_trips() {
        let mut journal = MemoryJournal::new();
        let e = entry(1, 1);
        let index = journal.append(e.clone()).unwrap();
        assert_eq!(journal.read_at(index).unwrap(), e);
    }

    #[test]
    fn truncate_keeps_prefix_and_drops_suffix() {
        let mut journal = MemoryJournal::new();
        for i in 1..=5 {
            journal.append(entry(1, i)).unwrap();
        }
        journal.truncate_after(3).unwrap();
        assert!(journal.read_at(3).is_ok());
        assert!(journal.read_at(4).is_err());
        assert_eq!(journal.last_index(), 3);
    }

    #[test]
    fn compaction_hides_prefix_but_keeps_boundary_term() {
        let mut journal = MemoryJournal::new();
        for i in 1..=5 {
            journal.append(entry(2, i)).unwrap();
        }
        journal.compact_to(3, 2).unwrap();
        assert_eq!(journal.first_index(), 4);
        assert!(journal.read_at(3).is_err());
        assert_eq!(journal.term_at(3), Some(2));
        assert_eq!(journal.read_at(4).unwrap().index, 4);
    }

    #[test]
    fn non_contiguous_append_rejected() {
        let mut journal = MemoryJournal::new();
        journal.append(entry(1, 1)).unwrap();
        assert!(journal.append(entry(1, 3)).is_err());
    }
}
