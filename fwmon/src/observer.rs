use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

use crate::error::{ConfigurationError, FirewallError};
use crate::packet::{PacketRecord, Verdict};
use crate::source::{CaptureHandler, PacketSource, SourceFactory};
use crate::stats::{bump, PipelineStats};

/// Policy hook invoked synchronously on the capture thread for every packet of its queue.
///
/// It must return quickly: it gates the throughput of its queue. Errors and panics are
/// counted and discarded; the packet then gets the default verdict.
pub type PacketCallback = Arc<dyn Fn(&PacketRecord) -> anyhow::Result<()> + Send + Sync>;

/// A named request to receive the packets of one kernel queue.
#[derive(Clone)]
pub struct Subscription {
    name: String,
    queue_num: Option<u16>,
    callback: Option<PacketCallback>,
}

impl Subscription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_num: None,
            callback: None,
        }
    }

    pub fn queue_num(mut self, queue_num: u16) -> Self {
        self.queue_num = Some(queue_num);
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PacketRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Created,
    Configured,
    Running,
    Stopped,
}

struct Capture {
    name: String,
    queue_num: u16,
    source: Arc<dyn PacketSource>,
    thread: Option<JoinHandle<Result<(), FirewallError>>>,
}

/// Binds kernel queues and dispatches their packets to the subscribed callbacks.
///
/// Each subscribed queue gets exactly one capture thread, so packets of a queue are handled
/// one at a time and in kernel order. Queues are independent of each other.
pub struct QueueObserver {
    factory: SourceFactory,
    stats: Arc<PipelineStats>,
    subscriptions: Vec<(String, u16)>,
    callbacks: HashMap<u16, PacketCallback>,
    captures: Vec<Capture>,
    state: ObserverState,
}

impl QueueObserver {
    pub fn new(factory: SourceFactory, stats: Arc<PipelineStats>) -> Self {
        Self {
            factory,
            stats,
            subscriptions: Vec::new(),
            callbacks: HashMap::new(),
            captures: Vec::new(),
            state: ObserverState::Created,
        }
    }

    pub fn state(&self) -> ObserverState {
        self.state
    }

    /// Register a subscription. Only allowed before [`start`](Self::start).
    pub fn subscribe(&mut self, subscription: Subscription) -> Result<(), ConfigurationError> {
        if matches!(self.state, ObserverState::Running | ObserverState::Stopped) {
            return Err(ConfigurationError::AlreadyStarted);
        }

        let Subscription {
            name,
            queue_num,
            callback,
        } = subscription;
        let Some(queue_num) = queue_num else {
            return Err(ConfigurationError::MissingQueueNum(name));
        };
        let Some(callback) = callback else {
            return Err(ConfigurationError::MissingCallback(name));
        };
        if self.callbacks.contains_key(&queue_num) {
            return Err(ConfigurationError::DuplicateQueue(queue_num));
        }

        debug!(name = %name, queue_num, "subscription registered");
        self.callbacks.insert(queue_num, callback);
        self.subscriptions.push((name, queue_num));
        self.state = ObserverState::Configured;
        Ok(())
    }

    /// Bind every subscribed queue and launch one capture thread per queue.
    ///
    /// If any queue fails to bind, the queues already started are stopped again.
    pub fn start(&mut self) -> Result<(), FirewallError> {
        if matches!(self.state, ObserverState::Running | ObserverState::Stopped) {
            return Err(ConfigurationError::AlreadyStarted.into());
        }
        if self.subscriptions.is_empty() {
            warn!("starting queue observer without subscriptions");
        }
        self.state = ObserverState::Running;

        let callbacks = Arc::new(std::mem::take(&mut self.callbacks));
        for (name, queue_num) in self.subscriptions.clone() {
            if let Err(e) = self.launch(&name, queue_num, Arc::clone(&callbacks)) {
                error!(name = %name, queue_num, error = %e, "failed to start capture");
                self.stop();
                return Err(e);
            }
        }
        Ok(())
    }

    fn launch(
        &mut self,
        name: &str,
        queue_num: u16,
        callbacks: Arc<HashMap<u16, PacketCallback>>,
    ) -> Result<(), FirewallError> {
        let source: Arc<dyn PacketSource> = Arc::from((self.factory)(queue_num)?);
        source.bind(queue_num, dispatcher(queue_num, callbacks, Arc::clone(&self.stats)))?;

        let runner = Arc::clone(&source);
        let thread_name = name.to_string();
        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                info!(name = %thread_name, queue_num, "capture thread started");
                let result = runner.run();
                match &result {
                    Ok(()) => info!(name = %thread_name, queue_num, "capture thread exited"),
                    Err(e) => {
                        error!(name = %thread_name, queue_num, error = %e, "capture thread failed")
                    }
                }
                result
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(source_err) => {
                release(name, queue_num, source.as_ref());
                return Err(FirewallError::Spawn {
                    name: name.to_string(),
                    source: source_err,
                });
            }
        };

        self.captures.push(Capture {
            name: name.to_string(),
            queue_num,
            source,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Unbind every queue, then wait for all capture threads to exit.
    ///
    /// Safe to call any number of times. Returns once every capture thread has been joined.
    pub fn stop(&mut self) {
        for capture in &self.captures {
            release(&capture.name, capture.queue_num, capture.source.as_ref());
        }

        for capture in &mut self.captures {
            let Some(thread) = capture.thread.take() else {
                continue;
            };
            if thread.join().is_err() {
                error!(
                    name = %capture.name,
                    queue_num = capture.queue_num,
                    "capture thread panicked"
                );
            }
        }

        if self.state == ObserverState::Running {
            info!(queues = self.captures.len(), "queue observer stopped");
        }
        self.state = ObserverState::Stopped;
    }
}

impl Drop for QueueObserver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn release(name: &str, queue_num: u16, source: &dyn PacketSource) {
    if let Err(e) = source.unbind() {
        warn!(name = %name, queue_num, error = %e, "unbind failed");
    }
}

/// Build the per-queue handler run by the source on the capture thread.
fn dispatcher(
    queue_num: u16,
    callbacks: Arc<HashMap<u16, PacketCallback>>,
    stats: Arc<PipelineStats>,
) -> CaptureHandler {
    let mut last_stamp: Option<DateTime<Utc>> = None;

    Box::new(move |raw: &[u8]| {
        // Wall clock can step backwards; arrival times of a queue never do.
        let now = Utc::now();
        let received_at = last_stamp.map_or(now, |last| last.max(now));
        last_stamp = Some(received_at);

        dispatch(raw, queue_num, received_at, &callbacks, &stats)
    })
}

fn dispatch(
    raw: &[u8],
    queue_num: u16,
    received_at: DateTime<Utc>,
    callbacks: &HashMap<u16, PacketCallback>,
    stats: &PipelineStats,
) -> Option<Verdict> {
    bump(&stats.packets_received);

    let record = match PacketRecord::from_capture(raw, queue_num, received_at) {
        Ok(record) => record,
        Err(e) => {
            bump(&stats.packets_malformed);
            trace!(queue_num, error = %e, "skipping capture");
            return None;
        }
    };

    let callback = callbacks.get(&queue_num)?;
    match panic::catch_unwind(AssertUnwindSafe(|| callback(&record))) {
        Ok(Ok(())) => record.verdict(),
        Ok(Err(e)) => {
            bump(&stats.callback_failures);
            debug!(queue_num, packet = %record.id(), error = %e, "callback failed");
            None
        }
        Err(_) => {
            bump(&stats.callback_failures);
            warn!(queue_num, packet = %record.id(), "callback panicked");
            None
        }
    }
}

/// Observer backed by the platform's kernel packet queue.
#[cfg(target_os = "linux")]
pub fn create_observer(stats: Arc<PipelineStats>) -> Result<QueueObserver, FirewallError> {
    use crate::source::NfqueueSource;

    let factory: SourceFactory =
        Box::new(|_: u16| -> Result<Box<dyn PacketSource>, FirewallError> {
            Ok(Box::new(NfqueueSource::open()?))
        });
    Ok(QueueObserver::new(factory, stats))
}

/// Observer backed by the platform's kernel packet queue.
#[cfg(not(target_os = "linux"))]
pub fn create_observer(_stats: Arc<PipelineStats>) -> Result<QueueObserver, FirewallError> {
    Err(FirewallError::UnsupportedPlatform(std::env::consts::OS))
}
