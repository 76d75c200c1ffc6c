//! Per-topic data logs
//!
//! The store keeps one directory per topic under its root. Each topic has
//! its own position authority from the moment it exists, so subscribers can
//! attach before anything was published; the writer is created by the
//! first save.

use crate::config::LogConfig;
use crate::disk::fsync::Fsyncer;
use crate::disk::reader::{ReaderOptions, SegmentBlockReader};
use crate::disk::recover;
use crate::disk::writer::SegmentWriter;
use crate::error::{Error, Result};
use crate::frame::check_text_field;
use crate::notify::control::{LogFileControl, Position};
use crate::record::topic::{topic_encoder, TopicBatch, TopicMessage, TopicParser};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct TopicLog {
    dir: PathBuf,
    control: Arc<LogFileControl>,
    writer: Mutex<Option<SegmentWriter<TopicBatch>>>,
}

impl TopicLog {
    fn open(name: &str, dir: PathBuf, config: &LogConfig) -> Result<Self> {
        recover::drop_trailing_empty(&dir)?;
        recover::truncate_torn_tail(&dir, &mut TopicParser)?;
        let control = LogFileControl::open(name, &dir, config.log_sample)?;
        Ok(Self {
            dir,
            control,
            writer: Mutex::new(None),
        })
    }
}

/// Data logs of all topics
pub struct TopicStore {
    root: PathBuf,
    config: LogConfig,
    syncer: Arc<Fsyncer>,
    topics: Mutex<HashMap<String, Arc<TopicLog>>>,
}

impl TopicStore {
    /// Open the store under `root`, picking up every topic directory found
    pub fn open(root: impl Into<PathBuf>, config: LogConfig, syncer: Arc<Fsyncer>) -> Result<Self> {
        config.validate()?;
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut topics = HashMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %entry.path().display(), "skipping topic directory with non utf-8 name");
                continue;
            };
            let log = TopicLog::open(&name, entry.path(), &config)?;
            topics.insert(name, Arc::new(log));
        }
        info!(root = %root.display(), topics = topics.len(), "topic store opened");

        Ok(Self {
            root,
            config,
            syncer,
            topics: Mutex::new(topics),
        })
    }

    /// Directory holding the segments of `topic`
    pub fn topic_path(&self, topic: &str) -> PathBuf {
        self.root.join(topic)
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create an empty topic
    pub fn create_topic(&self, topic: &str) -> Result<()> {
        check_topic_name(topic)?;
        let mut topics = self.topics.lock();
        if topics.contains_key(topic) {
            return Err(Error::TopicExists(topic.to_string()));
        }
        let dir = self.topic_path(topic);
        fs::create_dir_all(&dir)?;
        let log = TopicLog::open(topic, dir, &self.config)?;
        topics.insert(topic.to_string(), Arc::new(log));
        info!(topic, "topic created");
        Ok(())
    }

    /// Whether `topic` exists
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.lock().contains_key(topic)
    }

    /// Names of all topics
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn get(&self, topic: &str) -> Result<Arc<TopicLog>> {
        self.topics
            .lock()
            .get(topic)
            .cloned()
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))
    }

    /// Append `messages` to `topic`, returning the bytes written
    pub fn save(&self, topic: &str, messages: Vec<TopicMessage>) -> Result<u64> {
        let log = self.get(topic)?;
        let mut writer = log.writer.lock();
        // a delete may have raced with the lookup
        if log.control.is_invalid() {
            return Err(Error::TopicNotFound(topic.to_string()));
        }
        let writer = writer.get_or_insert_with(|| {
            SegmentWriter::new(
                log.dir.clone(),
                log.control.clone(),
                self.config.max_segment_size,
                self.syncer.clone(),
                topic_encoder(),
            )
        });
        writer.write(&TopicBatch::now(messages))
    }

    /// Published position of `topic`
    pub fn position(&self, topic: &str) -> Result<Position> {
        Ok(self.get(topic)?.control.get())
    }

    /// Attach subscriber `whoami` to `topic`, starting at `start` or at the
    /// current end of the log when `start` is `None`
    pub fn reader(
        &self,
        topic: &str,
        whoami: &str,
        start: Option<Position>,
        batch: usize,
    ) -> Result<SegmentBlockReader<TopicParser>> {
        let log = self.get(topic)?;
        let options = ReaderOptions::from_config(whoami, &self.config).with_batch(batch);
        SegmentBlockReader::open(log.control.clone(), log.dir.clone(), options, TopicParser, |published| {
            Ok(start.unwrap_or(published))
        })
    }

    /// Delete `topic`: attached readers end with `LogInvalidated`, its
    /// writer is dropped without syncing and its files are removed
    pub fn delete_topic(&self, topic: &str) -> Result<()> {
        let log = self
            .topics
            .lock()
            .remove(topic)
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?;
        log.control.invalidate();
        // waits for an in-flight save
        if let Some(mut writer) = log.writer.lock().take() {
            writer.abandon();
        }
        match fs::remove_dir_all(&log.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(topic, readers = log.control.reader_count(), "topic deleted");
        Ok(())
    }

    /// Sync and release every topic writer
    pub fn close(&self) -> Result<()> {
        let logs: Vec<Arc<TopicLog>> = self.topics.lock().values().cloned().collect();
        for log in logs {
            if let Some(mut writer) = log.writer.lock().take() {
                writer.close()?;
                debug!(topic = log.control.subject(), "topic writer closed");
            }
        }
        self.syncer.flush_all()?;
        Ok(())
    }
}

fn check_topic_name(topic: &str) -> Result<()> {
    check_text_field(topic)?;
    if topic == "." || topic == ".." || topic.contains(['/', '\\']) {
        return Err(Error::CommandLine(format!("invalid topic name {:?}", topic)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncPolicy;
    use crate::notify::CancelSignal;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config() -> LogConfig {
        LogConfig {
            max_segment_size: 4096,
            wait_timeout_ms: 2000,
            sync_policy: SyncPolicy::None,
            ..LogConfig::default()
        }
    }

    fn store(root: &Path) -> TopicStore {
        let syncer = Fsyncer::new(SyncPolicy::None).unwrap();
        TopicStore::open(root, config(), syncer).unwrap()
    }

    fn message(event_id: i64, content: &str) -> TopicMessage {
        TopicMessage {
            event_id,
            content: content.as_bytes().to_vec(),
            src: Position::new(0, event_id * 10),
        }
    }

    #[test]
    fn test_create_save_read() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create_topic("orders").unwrap();
        assert!(matches!(store.create_topic("orders"), Err(Error::TopicExists(_))));
        assert!(store.topic_exists("orders"));

        let mut reader = store.reader("orders", "sub", Some(Position::default()), 10).unwrap();
        store.save("orders", vec![message(1, "a"), message(1, "b")]).unwrap();

        let records = reader.read(&CancelSignal::new()).unwrap();
        let contents: Vec<&[u8]> = records.iter().map(|r| r.content.as_slice()).collect();
        assert_eq!(contents, vec![&b"a"[..], &b"b"[..]]);
        assert_eq!(records[1].index_of_batch, 1);
        assert_eq!(records[1].src, Position::new(0, 10));
    }

    #[test]
    fn test_rejects_unknown_and_bad_names() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(matches!(store.save("nope", vec![message(1, "x")]), Err(Error::TopicNotFound(_))));
        assert!(store.reader("nope", "sub", None, 1).is_err());
        for name in ["", "..", "a/b", "a\tb"] {
            assert!(store.create_topic(name).is_err(), "{:?}", name);
        }
    }

    #[test]
    fn test_delete_ends_subscribers() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create_topic("gone").unwrap();
        store.save("gone", vec![message(1, "x")]).unwrap();

        let mut reader = store.reader("gone", "sub", None, 1).unwrap();
        let handle = thread::spawn(move || reader.read(&CancelSignal::new()));
        thread::sleep(Duration::from_millis(50));
        store.delete_topic("gone").unwrap();

        assert!(matches!(handle.join().unwrap(), Err(Error::LogInvalidated)));
        assert!(!store.topic_exists("gone"));
        assert!(!store.topic_path("gone").exists());
        assert!(matches!(store.save("gone", vec![message(2, "y")]), Err(Error::TopicNotFound(_))));
    }

    #[test]
    fn test_reopen_finds_topics() {
        let dir = tempdir().unwrap();
        {
            let store = store(dir.path());
            store.create_topic("a").unwrap();
            store.create_topic("b").unwrap();
            store.save("a", vec![message(1, "kept")]).unwrap();
            store.close().unwrap();
        }
        let store = store(dir.path());
        assert_eq!(store.topics(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.position("a").unwrap(), Position::new(1, 0));

        let mut reader = store.reader("a", "replay", Some(Position::default()), 5).unwrap();
        let records = reader.read(&CancelSignal::new()).unwrap();
        assert_eq!(records[0].content, b"kept");
        assert_eq!(records[0].next, Position::new(1, 0));
    }
}
