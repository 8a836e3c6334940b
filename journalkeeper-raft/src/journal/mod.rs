//! The append-only, partitioned, term-tagged journal.
//!
//! Indices are dense and 1-based. `first_index` is the lowest readable
//! index; everything below it was compacted away behind a snapshot, except
//! that `term_at` still answers for the compaction boundary itself so the
//! log-matching check works across a snapshot.

use journalkeeper_core::error::Result;

use crate::raft::{Entry, LogIndex, Term};

pub mod memory;
pub mod segment;

pub use memory::MemoryJournal;
pub use segment::FileJournal;

pub trait Journal: Send {
    /// Lowest readable index; `compacted + 1`, so 1 for a fresh journal.
    fn first_index(&self) -> LogIndex;

    /// Highest known index, counting the compaction boundary; 0 when the
    /// journal has never held an entry.
    fn last_index(&self) -> LogIndex;

    fn last_term(&self) -> Term;

    /// The term recorded at `index`. Answers for the compaction boundary
    /// via the snapshot metadata; `None` below it or past the tail.
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// Durable before it returns.
    fn append(&mut self, entry: Entry) -> Result<LogIndex>;

    /// Appends a dense batch with a single durability barrier. Returns the
    /// last assigned index.
    fn append_batch(&mut self, entries: Vec<Entry>) -> Result<LogIndex>;

    fn read_at(&self, index: LogIndex) -> Result<Entry>;

    /// Entries in `[from, to)`. Readers never observe a torn record.
    fn read_range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<Entry>>;

    /// Removes every entry with index greater than `index`, durably. Only a
    /// follower reconciling with a leader calls this.
    fn truncate_after(&mut self, index: LogIndex) -> Result<()>;

    /// Drops storage at or below `index`, which must sit at or below the
    /// applied snapshot boundary.
    fn compact_to(&mut self, index: LogIndex, term: Term) -> Result<()>;

    /// Discards the whole journal in favor of an installed snapshot at
    /// `(index, term)`.
    fn reset(&mut self, index: LogIndex, term: Term) -> Result<()>;
}
