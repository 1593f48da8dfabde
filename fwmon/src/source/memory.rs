use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{CaptureHandler, PacketSource};
use crate::error::{ConfigurationError, FirewallError};
use crate::packet::Verdict;

/// How often a blocked `run` re-checks for `unbind`.
const UNBIND_CHECK: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    queue_num: Mutex<Option<u16>>,
    handler: Mutex<Option<CaptureHandler>>,
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
    unbound: AtomicBool,
    verdicts: Mutex<Vec<Verdict>>,
}

/// Packet source fed from memory instead of the kernel.
///
/// Captures pushed through an [`Injector`] are delivered in order to the bound handler, and
/// the verdict applied to each one is recorded. Clones share the same queue.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

/// Sending half of a [`MemorySource`].
#[derive(Clone)]
pub struct Injector {
    tx: Sender<Vec<u8>>,
}

impl Injector {
    /// Queue a raw capture (starting at the IP header).
    pub fn inject(&self, raw: impl Into<Vec<u8>>) {
        // The source owns a sender too, so the receiver outlives every injector.
        let _ = self.tx.send(raw.into());
    }
}

impl MemorySource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            inner: Arc::new(Inner {
                queue_num: Mutex::new(None),
                handler: Mutex::new(None),
                tx,
                rx: Mutex::new(rx),
                unbound: AtomicBool::new(false),
                verdicts: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn injector(&self) -> Injector {
        Injector {
            tx: self.inner.tx.clone(),
        }
    }

    pub fn queue_num(&self) -> Option<u16> {
        *lock(&self.inner.queue_num)
    }

    /// Verdicts applied so far, in delivery order.
    pub fn verdicts(&self) -> Vec<Verdict> {
        lock(&self.inner.verdicts).clone()
    }

    pub fn is_unbound(&self) -> bool {
        self.inner.unbound.load(Ordering::Acquire)
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSource for MemorySource {
    fn bind(&self, queue_num: u16, handler: CaptureHandler) -> Result<(), FirewallError> {
        let mut bound = lock(&self.inner.queue_num);
        if let Some(existing) = *bound {
            return Err(ConfigurationError::AlreadyBound(existing).into());
        }
        *bound = Some(queue_num);
        *lock(&self.inner.handler) = Some(handler);
        Ok(())
    }

    fn run(&self) -> Result<(), FirewallError> {
        let Some(mut handler) = lock(&self.inner.handler).take() else {
            if self.is_unbound() {
                return Ok(());
            }
            return Err(ConfigurationError::NotBound.into());
        };
        let rx = lock(&self.inner.rx);

        while !self.is_unbound() {
            match rx.recv_timeout(UNBIND_CHECK) {
                Ok(raw) => {
                    let verdict = handler(&raw).unwrap_or(Verdict::Accept);
                    lock(&self.inner.verdicts).push(verdict);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Ok(())
    }

    fn unbind(&self) -> Result<(), FirewallError> {
        self.inner.unbound.store(true, Ordering::Release);
        Ok(())
    }
}
