use crate::id::ReplicaId;

/// What a log entry asks the state machine to do.
///
/// Modeled as a sum rather than a struct with optional fields: the sentinel and no-op variants
/// carry no client data, and only `Put` ever mutates the state machine on apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogCommand {
    /// The index-0 entry. Never transmitted, never applied, never modified after construction.
    Sentinel,
    /// Appended by a leader solely to confirm its leadership for outstanding reads.
    NoOp,
    Put {
        src: ReplicaId,
        mid: String,
        key: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub command: LogCommand,
}

impl LogEntry {
    pub fn sentinel() -> Self {
        LogEntry {
            term: 0,
            command: LogCommand::Sentinel,
        }
    }
}

/// The replicated log. 1-indexed: `entries[0]` is always the sentinel and is never sent on the
/// wire or applied to the state machine.
#[derive(Debug, Clone)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Log {
            entries: vec![LogEntry::sentinel()],
        }
    }

    pub fn last_index(&self) -> u64 {
        (self.entries.len() - 1) as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn entry(&self, idx: u64) -> Option<&LogEntry> {
        self.entries.get(idx as usize)
    }

    /// True iff `idx == 0`, or `idx` names an entry in this log whose term is `term`.
    pub fn prefix_matches(&self, idx: u64, term: u64) -> bool {
        if idx == 0 {
            return true;
        }
        idx <= self.last_index() && self.entry(idx).map(|e| e.term) == Some(term)
    }

    /// Entries at index `from..=last_index()`, inclusive, for replicating to a lagging peer.
    pub fn slice_from(&self, from: u64) -> &[LogEntry] {
        if from > self.last_index() {
            return &[];
        }
        &self.entries[from as usize..]
    }

    /// Removes every entry at index `>= from`. Callers must ensure `from > commit_idx`: this
    /// never legitimately truncates a committed entry, so violating it is a caller bug rather
    /// than a recoverable error.
    pub fn truncate_from(&mut self, from: u64, commit_idx: u64) {
        debug_assert!(
            from > commit_idx,
            "refusing to truncate at {from} with commit_idx {commit_idx}"
        );
        self.entries.truncate(from as usize);
    }

    pub fn append_many(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        self.entries.extend(entries);
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Lowest index `j <= i` with `entry(j).term == entry(i).term`. If `i` is past the end of the
    /// log, returns `last_index()` instead (used to build AppendEntries conflict hints when the
    /// follower's log is simply too short).
    pub fn first_index_of_term_at(&self, i: u64) -> u64 {
        if i > self.last_index() {
            return self.last_index();
        }
        let term = match self.entry(i) {
            Some(e) => e.term,
            None => return self.last_index(),
        };
        let mut j = i;
        while j > 0 && self.entries[(j - 1) as usize].term == term {
            j -= 1;
        }
        j
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}
