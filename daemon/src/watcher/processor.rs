//! Applies transcript changes to the repositories.
//!
//! Events are serialized per path: while a batch for a path is in flight,
//! newer events for it collapse into one pending slot that runs when the
//! batch finishes. Different paths run concurrently up to the worker limit.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::log_parser::{render_content, EntryKind, LogEntry, ParsedLogFile};
use super::{FileEvent, FileEventKind, IntakeReceiver};
use crate::context::IngestContext;
use crate::error::Error;
use crate::models::{message_id, project_id, Message, Project, Session, TrackingRecord};
use crate::repository::CursorUpdate;

/// Longest session name derived from the first prompt.
const MAX_SESSION_NAME_CHARS: usize = 80;

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub path: PathBuf,
    pub kind: FileEventKind,
    /// Entries past the previous cursor.
    pub applied: usize,
    /// Messages that did not exist before.
    pub inserted: usize,
    /// Invalid lines in the file.
    pub skipped: usize,
    /// Cursor after the batch.
    pub cursor: u64,
    /// Another run advanced the cursor first; this batch was dropped.
    pub discarded: bool,
}

impl BatchOutcome {
    fn empty(path: &Path, kind: FileEventKind) -> Self {
        Self {
            path: path.to_path_buf(),
            kind,
            applied: 0,
            inserted: 0,
            skipped: 0,
            cursor: 0,
            discarded: false,
        }
    }
}

/// Totals over a processor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub batches: usize,
    pub failed: usize,
    pub discarded: usize,
    pub inserted: usize,
}

#[derive(Default)]
struct Counters {
    batches: AtomicUsize,
    failed: AtomicUsize,
    discarded: AtomicUsize,
    inserted: AtomicUsize,
}

pub struct BatchProcessor {
    ctx: Arc<IngestContext>,
    workers: Semaphore,
    /// Paths with a batch in flight, each with at most one pending event.
    slots: Mutex<HashMap<PathBuf, Option<FileEvent>>>,
    counters: Counters,
}

impl BatchProcessor {
    pub fn new(ctx: Arc<IngestContext>, worker_limit: usize) -> Self {
        Self {
            ctx,
            workers: Semaphore::new(worker_limit.max(1)),
            slots: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            inserted: self.counters.inserted.load(Ordering::Relaxed),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PathBuf, Option<FileEvent>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Consume the intake until it closes or `shutdown` resolves, then wait
    /// for in-flight batches.
    pub async fn run(
        self: Arc<Self>,
        mut rx: IntakeReceiver,
        shutdown: impl Future<Output = ()>,
    ) -> ProcessorStats {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event, &mut tasks),
                    None => break,
                },
                _ = &mut shutdown => {
                    info!("Processor shutting down, waiting for in-flight batches");
                    break;
                }
            }

            while let Some(res) = tasks.try_join_next() {
                report_join(res);
            }
        }

        while let Some(res) = tasks.join_next().await {
            report_join(res);
        }

        self.stats()
    }

    fn dispatch(self: &Arc<Self>, event: FileEvent, tasks: &mut JoinSet<()>) {
        {
            let mut slots = self.slots();
            if let Some(pending) = slots.get_mut(&event.path) {
                debug!(path = %event.path.display(), kind = %event.kind, "Batch in flight, coalescing");
                *pending = Some(event);
                return;
            }
            slots.insert(event.path.clone(), None);
        }

        let this = Arc::clone(self);
        tasks.spawn(async move { this.drive(event).await });
    }

    /// Run batches for one path until no event is pending for it.
    async fn drive(self: Arc<Self>, mut event: FileEvent) {
        loop {
            let result = {
                let _permit = self.workers.acquire().await;
                let this = Arc::clone(&self);
                let current = event.clone();
                tokio::task::spawn_blocking(move || this.process_event(&current)).await
            };
            self.record(&event, result);

            let next = {
                let mut slots = self.slots();
                let next = slots.get_mut(&event.path).and_then(Option::take);
                if next.is_none() {
                    slots.remove(&event.path);
                }
                next
            };
            match next {
                Some(next) => event = next,
                None => break,
            }
        }
    }

    fn record(&self, event: &FileEvent, result: Result<Result<BatchOutcome, Error>, JoinError>) {
        self.counters.batches.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(Ok(outcome)) => {
                self.counters
                    .inserted
                    .fetch_add(outcome.inserted, Ordering::Relaxed);
                if outcome.discarded {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                } else if outcome.applied > 0 {
                    info!(
                        path = %outcome.path.display(),
                        applied = outcome.applied,
                        inserted = outcome.inserted,
                        cursor = outcome.cursor,
                        "Ingested transcript entries"
                    );
                }
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    path = %event.path.display(),
                    code = %e.code(),
                    error = %e,
                    "Batch failed, left for the next event or reconciliation"
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(path = %event.path.display(), error = %e, "Batch task panicked");
            }
        }
    }

    /// Handle one event synchronously.
    pub fn process_event(&self, event: &FileEvent) -> Result<BatchOutcome, Error> {
        match event.kind {
            FileEventKind::Add | FileEventKind::Change => self.ingest(&event.path, event.kind),
            FileEventKind::Unlink => self.unlink(&event.path),
        }
    }

    fn ingest(&self, path: &Path, kind: FileEventKind) -> Result<BatchOutcome, Error> {
        let ctx = &self.ctx;

        if !ctx.reader.file_exists(path)? {
            debug!(path = %path.display(), "File vanished before processing");
            return Ok(BatchOutcome::empty(path, kind));
        }

        let record = ctx.tracking.active_record(path)?;
        // Taken before the read: anything written after it compares as newer
        // during reconciliation.
        let read_at = Utc::now();
        let parsed = ctx.parser.parse_file(path)?;
        let line_count = parsed.line_count as u64;

        let (file_key, first_seen_at, prior) = match record {
            Some(r) if line_count < r.cursor => {
                info!(
                    path = %path.display(),
                    cursor = r.cursor,
                    lines = line_count,
                    "Transcript shrank, starting a new identity"
                );
                ctx.tracking.tombstone(&r.file_key)?;
                let (key, first_seen) = self.new_identity(path, read_at)?;
                (key, first_seen, 0)
            }
            Some(r) => (r.file_key, r.first_seen_at, r.cursor),
            None => {
                let (key, first_seen) = self.new_identity(path, read_at)?;
                (key, first_seen, 0)
            }
        };

        let fresh: Vec<&LogEntry> = parsed
            .entries
            .iter()
            .filter(|e| e.line as u64 >= prior)
            .collect();

        let mut outcome = BatchOutcome {
            applied: fresh.len(),
            skipped: parsed.skipped,
            cursor: prior,
            ..BatchOutcome::empty(path, kind)
        };

        if fresh.is_empty() {
            // Still committed below, which refreshes last_updated_at.
            debug!(path = %path.display(), cursor = prior, lines = line_count, "No new entries");
        } else {
            outcome.inserted = self.apply(&parsed, &fresh)?;
        }

        let update = CursorUpdate {
            file_key: &file_key,
            path,
            expected: prior,
            new: line_count,
            first_seen_at,
            read_at,
        };
        match ctx.tracking.compare_and_set(&update) {
            Ok(()) => outcome.cursor = line_count,
            Err(e) if e.is_conflict() => {
                debug!(path = %path.display(), error = %e, "Lost cursor race, discarding batch");
                outcome.discarded = true;
            }
            Err(e) => return Err(e),
        }

        Ok(outcome)
    }

    /// Key and first-seen time for a new identity, skipping keys taken by
    /// tombstoned records.
    fn new_identity(
        &self,
        path: &Path,
        seen_at: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), Error> {
        // Keys carry milliseconds; keep the stored column in agreement.
        let mut first_seen =
            DateTime::<Utc>::from_timestamp_millis(seen_at.timestamp_millis()).unwrap_or(seen_at);
        loop {
            let key = TrackingRecord::key_for(path, first_seen);
            if self.ctx.tracking.get(&key)?.is_none() {
                return Ok((key, first_seen));
            }
            first_seen += chrono::Duration::milliseconds(1);
        }
    }

    /// Write entries to the repositories. Returns the number of new messages.
    fn apply(&self, parsed: &ParsedLogFile, fresh: &[&LogEntry]) -> Result<usize, Error> {
        let ctx = &self.ctx;
        let now = Utc::now();
        let session_id = &parsed.session_id;

        let project_id = project_id(&parsed.project_name);
        ctx.projects.upsert_project(&Project {
            id: project_id.clone(),
            name: parsed.project_name.clone(),
            path: parsed
                .file_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            created_at: now,
        })?;

        ctx.sessions.upsert_session(&Session {
            id: session_id.clone(),
            project_id,
            name: session_name(parsed),
            cwd: parsed.entries.iter().find_map(|e| e.cwd.clone()),
            status: None,
            created_at: parsed.entries.first().map(|e| e.timestamp).unwrap_or(now),
            updated_at: now,
            last_message_at: None,
        })?;

        let mut inserted = 0;
        let mut latest: Option<DateTime<Utc>> = None;

        for entry in fresh {
            match entry.kind {
                EntryKind::User | EntryKind::Assistant => {
                    let natural_key = entry.natural_key();
                    let message = Message {
                        id: message_id(session_id, &natural_key),
                        session_id: session_id.clone(),
                        natural_key,
                        seq: entry.line as u64,
                        role: entry.role().to_string(),
                        content: entry
                            .message
                            .as_ref()
                            .map(|m| render_content(&m.content))
                            .unwrap_or_default(),
                        timestamp: entry.timestamp,
                        raw_payload: entry.raw.clone(),
                    };
                    if ctx.messages.upsert_message(&message)? {
                        inserted += 1;
                    }
                    latest = latest.max(Some(entry.timestamp));
                }
                EntryKind::System | EntryKind::Result => {
                    let status = entry.subtype.as_deref().unwrap_or(entry.role());
                    ctx.sessions
                        .touch_session(session_id, entry.timestamp, Some(status))?;
                }
            }
        }

        if let Some(at) = latest {
            ctx.sessions.touch_session(session_id, at, None)?;
        }

        Ok(inserted)
    }

    fn unlink(&self, path: &Path) -> Result<BatchOutcome, Error> {
        let ctx = &self.ctx;

        if ctx.reader.file_exists(path)? {
            // Atomic-rename writers report an unlink for a file that is back.
            debug!(path = %path.display(), "Unlinked file still exists, treating as change");
            return self.ingest(path, FileEventKind::Change);
        }

        let mut outcome = BatchOutcome::empty(path, FileEventKind::Unlink);
        match ctx.tracking.active_record(path)? {
            Some(record) => {
                ctx.tracking.tombstone(&record.file_key)?;
                info!(path = %path.display(), cursor = record.cursor, "Transcript removed");
                outcome.cursor = record.cursor;
            }
            None => debug!(path = %path.display(), "Unlink for untracked file"),
        }
        Ok(outcome)
    }
}

fn report_join(res: Result<(), JoinError>) {
    if let Err(e) = res {
        error!(error = %e, "Processor task failed");
    }
}

/// First line of the first user prompt, or the session id.
fn session_name(parsed: &ParsedLogFile) -> String {
    parsed
        .entries
        .iter()
        .filter(|e| e.kind == EntryKind::User)
        .filter_map(|e| e.message.as_ref())
        .map(|m| render_content(&m.content))
        .find_map(|text| {
            text.lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(|l| l.chars().take(MAX_SESSION_NAME_CHARS).collect())
        })
        .unwrap_or_else(|| parsed.session_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::fs::MemoryFs;
    use crate::repository::{
        MessageRepository, ProjectRepository, SessionRepository, TrackingStore,
    };
    use crate::watcher::log_parser::tests::entry_line;
    use crate::watcher::{FileWatcher, Intake, MemoryWatcher};
    use crate::config::WatcherConfig;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    const PATH: &str = "/root/myproj/abc123.jsonl";

    struct Harness {
        fs: Arc<MemoryFs>,
        db: Arc<Database>,
        processor: Arc<BatchProcessor>,
    }

    fn harness() -> Harness {
        let fs = Arc::new(MemoryFs::new());
        let db = Arc::new(Database::open_memory().unwrap());
        let ctx = IngestContext::new(fs.clone(), db.clone());
        Harness {
            fs,
            db,
            processor: Arc::new(BatchProcessor::new(Arc::new(ctx), 2)),
        }
    }

    fn lines(specs: &[(&str, &str, &str)]) -> String {
        specs
            .iter()
            .map(|(kind, uuid, ts)| format!("{}\n", entry_line(kind, uuid, ts)))
            .collect()
    }

    fn change() -> FileEvent {
        FileEvent::new(FileEventKind::Change, PATH)
    }

    #[test]
    fn test_ingest_projects_entries() {
        let h = harness();
        h.fs.write(
            PATH,
            &lines(&[
                ("user", "u-1", "2026-01-06T17:07:10Z"),
                ("assistant", "a-1", "2026-01-06T17:07:12Z"),
                ("system", "s-1", "2026-01-06T17:07:15Z"),
            ]),
        );

        let outcome = h.processor.process_event(&change()).unwrap();
        assert_eq!(outcome.applied, 3);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.cursor, 3);
        assert!(!outcome.discarded);

        let project = h.db.get_project(&project_id("myproj")).unwrap().unwrap();
        assert_eq!(project.path, PathBuf::from("/root/myproj"));

        let session = h.db.get_session("abc123").unwrap().unwrap();
        assert_eq!(session.project_id, project.id);
        assert_eq!(session.cwd.as_deref(), Some("/home/dev/myproj"));
        assert_eq!(session.name, "user says u-1");
        assert_eq!(session.status.as_deref(), Some("system"));
        assert_eq!(
            session.last_message_at,
            Some("2026-01-06T17:07:15Z".parse::<DateTime<Utc>>().unwrap())
        );

        let messages = h.db.list_messages("abc123").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].content, "assistant says a-1");
    }

    #[test]
    fn test_reprocessing_is_idempotent() {
        let h = harness();
        h.fs.write(
            PATH,
            &lines(&[
                ("user", "u-1", "2026-01-06T17:07:10Z"),
                ("assistant", "a-1", "2026-01-06T17:07:12Z"),
            ]),
        );

        h.processor.process_event(&change()).unwrap();
        let again = h.processor.process_event(&change()).unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.cursor, 2);

        // Losing the cursor replays every line without duplicating rows.
        let record = h.db.active_record(Path::new(PATH)).unwrap().unwrap();
        h.db.tombstone(&record.file_key).unwrap();
        let replay = h.processor.process_event(&change()).unwrap();
        assert_eq!(replay.applied, 2);
        assert_eq!(replay.inserted, 0);
        assert_eq!(h.db.count_messages("abc123").unwrap(), 2);
    }

    #[test]
    fn test_appended_lines_only() {
        let h = harness();
        h.fs.write(PATH, &lines(&[("user", "u-1", "2026-01-06T17:07:10Z")]));
        let first = h.processor.process_event(&change()).unwrap();

        h.fs.append(
            PATH,
            &lines(&[
                ("assistant", "a-1", "2026-01-06T17:07:12Z"),
                ("user", "u-2", "2026-01-06T17:07:20Z"),
            ]),
        );
        let second = h.processor.process_event(&change()).unwrap();

        assert_eq!(second.applied, 2);
        assert_eq!(second.inserted, 2);
        assert!(second.cursor >= first.cursor);
        assert_eq!(second.cursor, 3);
        assert_eq!(h.db.count_messages("abc123").unwrap(), 3);
    }

    #[test]
    fn test_partial_write_is_picked_up_later() {
        let h = harness();
        let second = entry_line("assistant", "a-1", "2026-01-06T17:07:12Z");
        let (head, tail) = second.split_at(20);
        h.fs.write(
            PATH,
            &format!(
                "{}{}",
                lines(&[("user", "u-1", "2026-01-06T17:07:10Z")]),
                head
            ),
        );

        let outcome = h.processor.process_event(&change()).unwrap();
        assert_eq!(outcome.cursor, 1);

        h.fs.append(PATH, &format!("{tail}\n"));
        let outcome = h.processor.process_event(&change()).unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.cursor, 2);
        assert_eq!(h.db.count_messages("abc123").unwrap(), 2);
    }

    #[test]
    fn test_key_and_first_seen_agree() {
        let h = harness();
        h.fs.write(PATH, &lines(&[("user", "u-1", "2026-01-06T17:07:10Z")]));
        h.processor.process_event(&change()).unwrap();

        let record = h.db.active_record(Path::new(PATH)).unwrap().unwrap();
        assert_eq!(
            record.file_key,
            TrackingRecord::key_for(Path::new(PATH), record.first_seen_at)
        );
        assert!(record.last_updated_at >= record.first_seen_at);
    }

    #[test]
    fn test_session_named_once_a_prompt_arrives() {
        let h = harness();
        h.fs.write(PATH, &lines(&[("system", "s-1", "2026-01-06T17:07:10Z")]));
        h.processor.process_event(&change()).unwrap();
        assert_eq!(h.db.get_session("abc123").unwrap().unwrap().name, "abc123");

        h.fs.append(PATH, &lines(&[("user", "u-1", "2026-01-06T17:07:12Z")]));
        h.processor.process_event(&change()).unwrap();
        assert_eq!(
            h.db.get_session("abc123").unwrap().unwrap().name,
            "user says u-1"
        );
    }

    #[test]
    fn test_malformed_line_is_isolated() {
        let h = harness();
        let mut content = String::new();
        for i in 0..9 {
            let uuid = format!("u-{i}");
            let ts = format!("2026-01-06T17:07:1{i}Z");
            content.push_str(&lines(&[("user", uuid.as_str(), ts.as_str())]));
            if i == 2 {
                content.push_str("{\"type\": \"user\", broken\n");
            }
        }
        h.fs.write(PATH, &content);

        let outcome = h.processor.process_event(&change()).unwrap();
        assert_eq!(outcome.inserted, 9);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.cursor, 10);
        assert_eq!(h.db.count_messages("abc123").unwrap(), 9);
    }

    #[test]
    fn test_unparseable_file_leaves_no_cursor() {
        let h = harness();
        h.fs.write(PATH, "garbage\nmore garbage\n");

        let err = h.processor.process_event(&change()).unwrap_err();
        assert_eq!(err.code().as_str(), "PARSER_ERROR");
        assert!(h.db.active_record(Path::new(PATH)).unwrap().is_none());
    }

    #[test]
    fn test_empty_file_is_discovered() {
        let h = harness();
        h.fs.write(PATH, "");

        let outcome = h.processor.process_event(&change()).unwrap();
        assert_eq!(outcome.cursor, 0);
        let record = h.db.active_record(Path::new(PATH)).unwrap().unwrap();
        assert_eq!(record.cursor, 0);
        assert!(h.db.get_session("abc123").unwrap().is_none());
    }

    #[test]
    fn test_unlink_tombstones_without_deleting_rows() {
        let h = harness();
        h.fs.write(PATH, &lines(&[("user", "u-1", "2026-01-06T17:07:10Z")]));
        h.processor.process_event(&change()).unwrap();
        let old_key = h
            .db
            .active_record(Path::new(PATH))
            .unwrap()
            .unwrap()
            .file_key;

        h.fs.remove(Path::new(PATH));
        let outcome = h
            .processor
            .process_event(&FileEvent::new(FileEventKind::Unlink, PATH))
            .unwrap();
        assert_eq!(outcome.cursor, 1);
        assert!(h.db.active_record(Path::new(PATH)).unwrap().is_none());
        assert!(h.db.get(&old_key).unwrap().unwrap().tombstoned);
        assert_eq!(h.db.count_messages("abc123").unwrap(), 1);

        // Recreated file is a new identity starting from zero.
        h.fs.write(PATH, &lines(&[("user", "u-new", "2026-01-07T09:00:00Z")]));
        let outcome = h
            .processor
            .process_event(&FileEvent::new(FileEventKind::Add, PATH))
            .unwrap();
        assert_eq!(outcome.applied, 1);
        let record = h.db.active_record(Path::new(PATH)).unwrap().unwrap();
        assert_ne!(record.file_key, old_key);
        assert_eq!(record.cursor, 1);
        assert_eq!(h.db.count_messages("abc123").unwrap(), 2);
    }

    #[test]
    fn test_unlink_of_existing_file_is_a_change() {
        let h = harness();
        h.fs.write(PATH, &lines(&[("user", "u-1", "2026-01-06T17:07:10Z")]));

        let outcome = h
            .processor
            .process_event(&FileEvent::new(FileEventKind::Unlink, PATH))
            .unwrap();
        assert_eq!(outcome.kind, FileEventKind::Change);
        assert_eq!(outcome.inserted, 1);
    }

    #[test]
    fn test_shrunk_file_starts_new_identity() {
        let h = harness();
        h.fs.write(
            PATH,
            &lines(&[
                ("user", "u-1", "2026-01-06T17:07:10Z"),
                ("assistant", "a-1", "2026-01-06T17:07:12Z"),
                ("user", "u-2", "2026-01-06T17:07:20Z"),
            ]),
        );
        h.processor.process_event(&change()).unwrap();
        let old = h.db.active_record(Path::new(PATH)).unwrap().unwrap();

        h.fs.write(PATH, &lines(&[("user", "u-9", "2026-01-08T10:00:00Z")]));
        let outcome = h.processor.process_event(&change()).unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.cursor, 1);
        let current = h.db.active_record(Path::new(PATH)).unwrap().unwrap();
        assert_ne!(current.file_key, old.file_key);
        assert_eq!(h.db.get(&old.file_key).unwrap().unwrap().cursor, 3);
    }

    /// Lets a competing run commit just before ours.
    struct RacingStore {
        inner: Arc<Database>,
        raced: AtomicBool,
    }

    impl TrackingStore for RacingStore {
        fn get(&self, file_key: &str) -> Result<Option<TrackingRecord>, Error> {
            self.inner.get(file_key)
        }

        fn active_record(&self, path: &Path) -> Result<Option<TrackingRecord>, Error> {
            self.inner.active_record(path)
        }

        fn compare_and_set(&self, update: &CursorUpdate<'_>) -> Result<(), Error> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner.compare_and_set(update)?;
            }
            self.inner.compare_and_set(update)
        }

        fn tombstone(&self, file_key: &str) -> Result<(), Error> {
            self.inner.tombstone(file_key)
        }

        fn list_records(&self) -> Result<Vec<TrackingRecord>, Error> {
            self.inner.list_records()
        }
    }

    #[test]
    fn test_lost_race_discards_batch() {
        let fs = Arc::new(MemoryFs::new());
        let db = Arc::new(Database::open_memory().unwrap());
        let racing = Arc::new(RacingStore {
            inner: db.clone(),
            raced: AtomicBool::new(false),
        });
        let ctx = IngestContext::new(fs.clone(), db.clone()).with_tracking(racing);
        let processor = BatchProcessor::new(Arc::new(ctx), 1);

        fs.write(
            PATH,
            &lines(&[
                ("user", "u-1", "2026-01-06T17:07:10Z"),
                ("assistant", "a-1", "2026-01-06T17:07:12Z"),
            ]),
        );
        let outcome = processor.process_event(&change()).unwrap();

        assert!(outcome.discarded);
        assert_eq!(outcome.cursor, 0);
        // The winner's cursor stands and the idempotent writes are harmless.
        assert_eq!(db.active_record(Path::new(PATH)).unwrap().unwrap().cursor, 2);
        assert_eq!(db.count_messages("abc123").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_events_for_one_path_coalesce() {
        let h = harness();
        h.fs.write(
            PATH,
            &lines(&[
                ("user", "u-1", "2026-01-06T17:07:10Z"),
                ("assistant", "a-1", "2026-01-06T17:07:12Z"),
            ]),
        );

        let (intake, rx) = Intake::channel();
        for _ in 0..3 {
            crate::watcher::EventHandler::handle(&intake, change()).unwrap();
        }
        drop(intake);

        let stats = h.processor.clone().run(rx, std::future::pending()).await;
        // First event runs, the other two collapse into one rerun.
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.inserted, 2);
        assert_eq!(h.db.count_messages("abc123").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_debounced_writes_produce_one_batch() {
        let h = harness();
        let watcher = MemoryWatcher::new();
        let (intake, rx) = Intake::channel();
        let config = WatcherConfig {
            stability_threshold_ms: 100,
            ..WatcherConfig::for_root("/root")
        };
        watcher.start(&config, Arc::new(intake)).unwrap();

        for (i, uuid) in ["u-1", "u-2", "u-3"].iter().enumerate() {
            let ts = format!("2026-01-06T17:07:1{i}Z");
            h.fs.append(PATH, &lines(&[("user", *uuid, ts.as_str())]));
            watcher.emit(FileEventKind::Change, PATH);
            watcher.advance(Duration::from_millis(10));
        }
        assert_eq!(watcher.advance(Duration::from_millis(200)), 1);
        watcher.stop().unwrap();

        let stats = h.processor.clone().run(rx, std::future::pending()).await;
        assert_eq!(stats.batches, 1);
        assert_eq!(h.db.count_messages("abc123").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_many_files_with_bounded_workers() {
        let h = harness();
        let (intake, rx) = Intake::channel();
        for n in 0..6 {
            let path = format!("/root/proj{}/s{n}.jsonl", n % 2);
            h.fs.write(
                &path,
                &format!(
                    "{}\n",
                    entry_line("user", &format!("u-{n}"), "2026-01-06T17:07:10Z")
                ),
            );
            crate::watcher::EventHandler::handle(&intake, FileEvent::new(FileEventKind::Add, path))
                .unwrap();
        }
        drop(intake);

        let stats = h.processor.clone().run(rx, std::future::pending()).await;
        assert_eq!(stats.batches, 6);
        assert_eq!(stats.inserted, 6);
        assert_eq!(h.db.list_projects().unwrap().len(), 2);
        assert_eq!(h.db.list_sessions(&project_id("proj0")).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_interleaved_triggers_keep_order() {
        let h = harness();
        h.fs.write(
            PATH,
            &lines(&[
                ("user", "u-1", "2026-01-06T17:07:10Z"),
                ("assistant", "a-1", "2026-01-06T17:07:12Z"),
            ]),
        );
        let (intake, rx) = Intake::channel();
        let handle = tokio::spawn(h.processor.clone().run(rx, std::future::pending()));

        // Live event, then a reconciliation-style event after more lines land.
        crate::watcher::EventHandler::handle(&intake, change()).unwrap();
        h.fs.append(
            PATH,
            &lines(&[
                ("user", "u-2", "2026-01-06T17:08:00Z"),
                ("assistant", "a-2", "2026-01-06T17:08:05Z"),
            ]),
        );
        crate::watcher::EventHandler::handle(&intake, change()).unwrap();
        crate::watcher::EventHandler::handle(&intake, change()).unwrap();
        drop(intake);
        handle.await.unwrap();

        let messages = h.db.list_messages("abc123").unwrap();
        assert_eq!(messages.len(), 4);
        assert!(messages
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
        let record = h.db.active_record(Path::new(PATH)).unwrap().unwrap();
        assert_eq!(record.cursor, 4);
    }
}
