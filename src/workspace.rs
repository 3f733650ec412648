use crate::render::{ApplyCode, BlockKey, KnownPaths};
use chrono::{DateTime, Local};
use ropey::Rope;
use similar::{DiffTag, TextDiff};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub name: String,
    pub created: DateTime<Local>,
    files: BTreeMap<String, Rope>,
}

impl Checkpoint {
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.created.format("%H:%M:%S"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStat {
    pub added: usize,
    pub removed: usize,
}

/// The candidate's working copy: path to buffer. Paths are fixed at load
/// time; buffers change through edits, applies and checkpoint restores.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    files: BTreeMap<String, Rope>,
    original: BTreeMap<String, String>,
    open: Vec<String>,
    active: Option<String>,
    checkpoints: Vec<Checkpoint>,
}

impl Workspace {
    pub fn from_files<I, P, T>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, T)>,
        P: Into<String>,
        T: AsRef<str>,
    {
        let mut ws = Self::default();
        for (path, text) in files {
            let path = path.into();
            ws.original.insert(path.clone(), text.as_ref().to_string());
            ws.files.insert(path, Rope::from_str(text.as_ref()));
        }
        ws
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&Rope> {
        self.files.get(path)
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.files.get(path).map(Rope::to_string)
    }

    pub fn buffer_mut(&mut self, path: &str) -> Option<&mut Rope> {
        self.files.get_mut(path)
    }

    /// Plain-text copy of every buffer, as sent to the backend.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.paths()
            .filter_map(|path| Some((path.to_string(), self.text(path)?)))
            .collect()
    }

    pub fn open(&mut self, path: &str) -> bool {
        if !self.contains(path) {
            return false;
        }
        if !self.open.iter().any(|p| p == path) {
            self.open.push(path.to_string());
        }
        self.active = Some(path.to_string());
        true
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn open_files(&self) -> &[String] {
        &self.open
    }

    /// Overwrites every buffer with its initial snapshot text and forgets
    /// checkpoints and open tabs.
    pub fn reset(&mut self) {
        for (path, text) in &self.original {
            self.files.insert(path.clone(), Rope::from_str(text));
        }
        self.open.clear();
        self.active = None;
        self.checkpoints.clear();
    }

    pub fn checkpoint(&mut self, name: impl Into<String>) -> usize {
        let checkpoint = Checkpoint {
            name: name.into(),
            created: Local::now(),
            files: self.files.clone(),
        };
        info!(name = %checkpoint.name, files = self.files.len(), "checkpoint created");
        self.checkpoints.push(checkpoint);
        self.checkpoints.len() - 1
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn restore(&mut self, index: usize) -> bool {
        let Some(checkpoint) = self.checkpoints.get(index) else {
            return false;
        };
        for (path, rope) in &checkpoint.files {
            self.files.insert(path.clone(), rope.clone());
        }
        info!(name = %checkpoint.name, "checkpoint restored");
        true
    }

    pub fn is_modified(&self, path: &str) -> bool {
        match (self.files.get(path), self.original.get(path)) {
            (Some(rope), Some(text)) => *rope != text.as_str(),
            _ => false,
        }
    }

    /// Per-file line changes against the initial snapshot, modified files only.
    pub fn diff_stats(&self) -> BTreeMap<String, DiffStat> {
        let mut out = BTreeMap::new();
        for (path, rope) in &self.files {
            let Some(original) = self.original.get(path) else {
                continue;
            };
            let current = rope.to_string();
            if current == *original {
                continue;
            }
            out.insert(path.clone(), line_diff(original, &current));
        }
        out
    }
}

impl KnownPaths for Workspace {
    fn is_known(&self, path: &str) -> bool {
        self.contains(path)
    }
}

impl ApplyCode for Workspace {
    fn apply_code(&mut self, path: &str, content: &str) -> bool {
        let Some(rope) = self.files.get_mut(path) else {
            debug!(path, "apply ignored for unknown path");
            return false;
        };
        *rope = Rope::from_str(content);
        self.open(path);
        info!(path, bytes = content.len(), "code block applied");
        true
    }
}

/// Blocks the candidate has already applied, keyed by message index and
/// block position. Entries are only ever added.
#[derive(Debug, Clone, Default)]
pub struct AppliedBlocks {
    applied: HashSet<(usize, BlockKey)>,
}

impl AppliedBlocks {
    /// Returns false if the block was already marked.
    pub fn mark_applied(&mut self, message: usize, key: BlockKey) -> bool {
        self.applied.insert((message, key))
    }

    pub fn is_applied(&self, message: usize, key: BlockKey) -> bool {
        self.applied.contains(&(message, key))
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn clear(&mut self) {
        self.applied.clear();
    }
}

fn line_diff(before: &str, after: &str) -> DiffStat {
    let diff = TextDiff::from_lines(before, after);
    let mut stat = DiffStat::default();
    for op in diff.ops() {
        match op.tag() {
            DiffTag::Equal => {}
            DiffTag::Delete => stat.removed += op.old_range().len(),
            DiffTag::Insert => stat.added += op.new_range().len(),
            DiffTag::Replace => {
                stat.removed += op.old_range().len();
                stat.added += op.new_range().len();
            }
        }
    }
    stat
}
