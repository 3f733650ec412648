use crate::workspace::Workspace;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

/// Line in `rq/queue.py` carrying the seeded off-by-one defect.
pub const SEEDED_DEFECT: &str = "return len(self._job_ids) - 1";
/// Replacement the canned test suite looks for.
pub const SEEDED_FIX: &str = "return len(self._job_ids)";

const QUEUE_PY: &str = r#"from .job import Job


class Queue:
    """A named FIFO of job ids backed by an in-memory list."""

    def __init__(self, name="default", connection=None):
        self.name = name
        self.connection = connection
        self._job_ids = []

    @property
    def count(self):
        return len(self._job_ids) - 1

    def is_empty(self):
        return self.count == 0

    def enqueue(self, func, *args, **kwargs):
        job = Job.create(func, args=args, kwargs=kwargs, origin=self.name)
        self._job_ids.append(job.id)
        return job

    def dequeue(self):
        if not self._job_ids:
            return None
        return self._job_ids.pop(0)

    def empty(self):
        removed = len(self._job_ids)
        self._job_ids.clear()
        return removed
"#;

const JOB_PY: &str = r#"import uuid


class Job:
    def __init__(self, func, args=(), kwargs=None, origin=None):
        self.id = str(uuid.uuid4())
        self.func = func
        self.args = args
        self.kwargs = kwargs or {}
        self.origin = origin
        self.status = "queued"

    @classmethod
    def create(cls, func, args=(), kwargs=None, origin=None):
        return cls(func, args=args, kwargs=kwargs, origin=origin)

    def perform(self):
        self.status = "started"
        result = self.func(*self.args, **self.kwargs)
        self.status = "finished"
        return result
"#;

const WORKER_PY: &str = r#"class Worker:
    def __init__(self, queues, jobs):
        self.queues = queues
        self.jobs = jobs

    def work(self, burst=True):
        processed = 0
        for queue in self.queues:
            while True:
                job_id = queue.dequeue()
                if job_id is None:
                    break
                self.jobs[job_id].perform()
                processed += 1
            if not burst:
                break
        return processed
"#;

const TEST_QUEUE_PY: &str = r#"from rq.queue import Queue


def say_hello(name):
    return "hello " + name


def test_empty_queue_is_empty():
    assert Queue().is_empty()


def test_count_tracks_enqueued_jobs():
    q = Queue()
    q.enqueue(say_hello, "a")
    q.enqueue(say_hello, "b")
    assert q.count == 2


def test_dequeue_is_fifo():
    q = Queue()
    first = q.enqueue(say_hello, "a")
    q.enqueue(say_hello, "b")
    assert q.dequeue() == first.id
"#;

const README_MD: &str = r#"# rq (snapshot)

A trimmed copy of the rq job queue. `Queue.count` misreports the number of
queued jobs; find and fix it, then run the test suite.
"#;

pub fn builtin() -> Workspace {
    Workspace::from_files([
        ("README.md", README_MD),
        ("rq/job.py", JOB_PY),
        ("rq/queue.py", QUEUE_PY),
        ("rq/worker.py", WORKER_PY),
        ("tests/test_queue.py", TEST_QUEUE_PY),
    ])
}

/// Loads every text file under `root` whose extension is in `extensions`.
/// Paths are keyed relative to `root` with `/` separators; hidden entries are
/// skipped.
pub fn load_dir(root: &Path, extensions: &[String]) -> Result<Workspace> {
    if !root.is_dir() {
        bail!("Snapshot directory not found: {}", root.display());
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        if !extensions.iter().any(|allowed| allowed == ext) {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(path);
        let key = rel
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect::<Vec<_>>()
            .join("/");
        let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        match String::from_utf8(bytes) {
            Ok(text) => files.push((key, text)),
            Err(_) => debug!(path = %path.display(), "skipping non-utf8 file"),
        }
    }
    if files.is_empty() {
        bail!("No matching files under {}", root.display());
    }
    info!(root = %root.display(), files = files.len(), "snapshot loaded");
    Ok(Workspace::from_files(files))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}
