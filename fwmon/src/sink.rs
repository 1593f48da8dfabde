use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fwmon_common::{parse_events, Event};

use crate::error::SinkError;
use crate::queue::EventQueueManager;
use crate::stats::{bump, PipelineStats, WindowCounter};

/// Events buffered for each live subscriber before it starts lagging.
const LIVE_CAPACITY: usize = 1024;

/// Item travelling from producers to the sink thread.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkMessage {
    Record(Event),
    /// Ends the sink loop; anything still queued behind it is discarded.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Retry interval while the queue is empty.
    pub poll_interval: Duration,
    /// `fsync` after every event instead of only flushing to the OS.
    pub fsync: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            fsync: false,
        }
    }
}

/// Cheap, cloneable handle for producers (typically packet callbacks).
#[derive(Clone)]
pub struct EventEmitter {
    queue: Arc<EventQueueManager<SinkMessage>>,
    stats: Arc<PipelineStats>,
    emitted: Arc<WindowCounter>,
}

impl EventEmitter {
    /// Queue an event for persistence. Never blocks and never waits for the write.
    pub fn emit(&self, event: Event) {
        bump(&self.stats.events_emitted);
        if let Some(count) = self.emitted.tick() {
            debug!(count, "events emitted in the last hour");
        }
        self.queue.put(SinkMessage::Record(event));
    }
}

/// Single writer appending events to the log, one JSON line and one flush per event.
pub struct EventSink {
    emitter: EventEmitter,
    live: broadcast::Sender<Event>,
    thread: Option<JoinHandle<Result<(), SinkError>>>,
}

impl EventSink {
    /// Open `path` in append mode and start the writer thread draining `queue`.
    pub fn spawn(
        path: impl AsRef<Path>,
        queue: Arc<EventQueueManager<SinkMessage>>,
        options: SinkOptions,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "event log opened");

        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        let writer = SinkWriter {
            path,
            file: BufWriter::new(file),
            queue: Arc::clone(&queue),
            options,
            stats: Arc::clone(&stats),
            live: live.clone(),
        };
        let thread = thread::Builder::new()
            .name("event-sink".into())
            .spawn(move || writer.run())?;

        Ok(Self {
            emitter: EventEmitter {
                queue,
                stats,
                emitted: Arc::new(WindowCounter::hourly()),
            },
            live,
            thread: Some(thread),
        })
    }

    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    pub fn emit(&self, event: Event) {
        self.emitter.emit(event);
    }

    /// Live feed of events, published after each one has been appended to the log.
    pub fn live(&self) -> broadcast::Sender<Event> {
        self.live.clone()
    }

    /// Whether the writer thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Send the shutdown sentinel and wait for the writer thread to finish.
    ///
    /// Returns the write error that ended the thread early, if any.
    pub fn shutdown(mut self) -> Result<(), SinkError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.emitter.queue.put(SinkMessage::Shutdown);
        thread.join().map_err(|_| SinkError::Panicked)?
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!(error = %e, "event sink ended with an error");
        }
    }
}

struct SinkWriter {
    path: PathBuf,
    file: BufWriter<File>,
    queue: Arc<EventQueueManager<SinkMessage>>,
    options: SinkOptions,
    stats: Arc<PipelineStats>,
    live: broadcast::Sender<Event>,
}

impl SinkWriter {
    fn run(mut self) -> Result<(), SinkError> {
        let consumed = WindowCounter::hourly();

        loop {
            let event = match self.queue.get(Some(self.options.poll_interval)) {
                SinkMessage::Record(event) => event,
                SinkMessage::Shutdown => break,
            };

            if let Err(e) = self.append(&event) {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to append event, stopping sink"
                );
                return Err(e);
            }
            bump(&self.stats.events_written);
            if let Some(count) = consumed.tick() {
                debug!(count, "events written in the last hour");
            }
            // No live subscriber is not an error.
            let _ = self.live.send(event);

            if self.queue.shard_count() > 1 {
                self.queue.cleanup();
            }
        }

        let discarded = self.queue.clear_all();
        if discarded > 0 {
            warn!(discarded, "event sink stopped, queued events were discarded");
        }
        info!(path = %self.path.display(), "event log closed");
        Ok(())
    }

    fn append(&mut self, event: &Event) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.file, event)?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        if self.options.fsync {
            self.file.get_ref().sync_data()?;
        }
        Ok(())
    }
}

/// Read every event of an event log or blocked-entity file.
///
/// A missing file reads as empty.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<Event>, SinkError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    parse_events(&content).map_err(|(line, source)| SinkError::InvalidLine { line, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwmon_common::SynapseMetadata;
    use std::time::Instant;

    fn spawn_sink(path: &Path) -> (EventSink, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        let queue = Arc::new(EventQueueManager::new(8));
        let sink =
            EventSink::spawn(path, queue, SinkOptions::default(), Arc::clone(&stats)).unwrap();
        (sink, stats)
    }

    #[test]
    fn test_emitted_event_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firewall-events.json");
        let (sink, stats) = spawn_sink(&path);

        let event = Event::new("10.0.0.1", 8091, "Deny ip")
            .with_synapse(SynapseMetadata::new("5DkVM4"));
        sink.emit(event.clone());
        sink.shutdown().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert_eq!(read_events(&path).unwrap(), vec![event]);
        assert_eq!(stats.snapshot().events_written, 1);
    }

    #[test]
    fn test_events_keep_emit_order_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        fs::write(&path, "{\"ip\":\"1.1.1.1\",\"port\":1,\"reason\":\"old\"}\n").unwrap();

        let (sink, _) = spawn_sink(&path);
        let emitter = sink.emitter();
        for n in 0..20u16 {
            emitter.emit(Event::new("10.0.0.2", n, "Detect DoS"));
        }
        sink.shutdown().unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 21);
        assert_eq!(events[0].reason, "old");
        let ports: Vec<u16> = events[1..].iter().map(|e| e.port).collect();
        assert_eq!(ports, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_emit_from_many_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        let (sink, stats) = spawn_sink(&path);

        let producers: Vec<_> = (0..4u16)
            .map(|p| {
                let emitter = sink.emitter();
                thread::spawn(move || {
                    for n in 0..50u16 {
                        emitter.emit(Event::new(format!("10.0.{p}.1"), n, "Deny ip"));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        sink.shutdown().unwrap();

        assert_eq!(read_events(&path).unwrap().len(), 200);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.events_emitted, 200);
        assert_eq!(snapshot.events_written, 200);
    }

    #[test]
    fn test_live_feed_follows_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        let (sink, _) = spawn_sink(&path);
        let mut live = sink.live().subscribe();

        sink.emit(Event::new("10.0.0.1", 1, "Deny ip"));
        sink.emit(Event::new("10.0.0.1", 2, "Deny ip"));
        sink.shutdown().unwrap();

        assert_eq!(live.try_recv().unwrap().port, 1);
        assert_eq!(live.try_recv().unwrap().port, 2);
        assert!(live.try_recv().is_err());
    }

    #[test]
    fn test_shutdown_discards_events_behind_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        let queue = Arc::new(EventQueueManager::new(8));
        queue.put(SinkMessage::Record(Event::new("10.0.0.1", 1, "Deny ip")));
        queue.put(SinkMessage::Shutdown);
        queue.put(SinkMessage::Record(Event::new("10.0.0.1", 2, "Deny ip")));
        queue.put(SinkMessage::Record(Event::new("10.0.0.1", 3, "Deny ip")));

        let sink = EventSink::spawn(
            &path,
            Arc::clone(&queue),
            SinkOptions::default(),
            Arc::default(),
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.is_running() {
            assert!(Instant::now() < deadline, "sink did not stop");
            thread::sleep(Duration::from_millis(2));
        }

        assert!(queue.is_empty());
        sink.shutdown().unwrap();
        let ports: Vec<u16> = read_events(&path).unwrap().iter().map(|e| e.port).collect();
        assert_eq!(ports, vec![1]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_failure_stops_sink_and_is_returned() {
        let (sink, stats) = spawn_sink(Path::new("/dev/full"));
        sink.emit(Event::new("10.0.0.1", 8091, "Deny ip"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.is_running() {
            assert!(Instant::now() < deadline, "sink kept running after a failed write");
            thread::sleep(Duration::from_millis(2));
        }

        assert!(matches!(sink.shutdown(), Err(SinkError::Io(_))));
        assert_eq!(stats.snapshot().events_written, 0);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("events.json");
        let queue = Arc::new(EventQueueManager::new(8));
        let result = EventSink::spawn(&path, queue, SinkOptions::default(), Arc::default());
        assert!(matches!(result, Err(SinkError::Io(_))));
    }

    #[test]
    fn test_read_events_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(dir.path().join("none.json")).unwrap().is_empty());
    }

    #[test]
    fn test_read_events_reports_invalid_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.json");
        fs::write(&path, "{\"ip\":\"1.1.1.1\",\"port\":1,\"reason\":\"a\"}\n{oops\n").unwrap();
        assert!(matches!(
            read_events(&path),
            Err(SinkError::InvalidLine { line: 2, .. })
        ));
    }
}
