use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use nfq::Queue;
use tracing::{debug, warn};

use super::{CaptureHandler, PacketSource};
use crate::error::{ConfigurationError, FirewallError};
use crate::packet::Verdict;

/// Pause between receive attempts while the socket is drained; bounds how long `run` takes to
/// notice `unbind`.
const IDLE_SLEEP: Duration = Duration::from_millis(20);

struct State {
    queue: Queue,
    queue_num: Option<u16>,
    handler: Option<CaptureHandler>,
}

/// Linux NFQUEUE binding backed by a netlink socket.
///
/// Packets are sent to user space by an iptables/nftables `NFQUEUE --queue-num N` rule. Every
/// packet gets a verdict: the handler's decision, or accept.
pub struct NfqueueSource {
    state: Mutex<State>,
    unbound: AtomicBool,
}

impl NfqueueSource {
    pub fn open() -> Result<Self, FirewallError> {
        let queue = Queue::open().map_err(FirewallError::Open)?;
        Ok(Self {
            state: Mutex::new(State {
                queue,
                queue_num: None,
                handler: None,
            }),
            unbound: AtomicBool::new(false),
        })
    }

    fn receive_loop(
        &self,
        state: &mut State,
        queue_num: u16,
        handler: &mut CaptureHandler,
    ) -> Result<(), FirewallError> {
        while !self.unbound.load(Ordering::Acquire) {
            let mut msg = match state.queue.recv() {
                Ok(msg) => msg,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(IDLE_SLEEP);
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    warn!(queue_num, "kernel queue overrun, packets were dropped");
                    continue;
                }
                Err(e) => return Err(FirewallError::queue(queue_num, e)),
            };

            let verdict = match handler(msg.get_payload()).unwrap_or(Verdict::Accept) {
                Verdict::Accept => nfq::Verdict::Accept,
                Verdict::Drop => nfq::Verdict::Drop,
            };
            msg.set_verdict(verdict);
            if let Err(e) = state.queue.verdict(msg) {
                warn!(queue_num, error = %e, "failed to send verdict");
            }
        }

        Ok(())
    }
}

impl PacketSource for NfqueueSource {
    fn bind(&self, queue_num: u16, handler: CaptureHandler) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = state.queue_num {
            return Err(ConfigurationError::AlreadyBound(existing).into());
        }

        state
            .queue
            .bind(queue_num)
            .map_err(|e| FirewallError::queue(queue_num, e))?;
        state.queue.set_nonblocking(true);
        state.queue_num = Some(queue_num);
        state.handler = Some(handler);
        debug!(queue_num, "bound kernel queue");
        Ok(())
    }

    fn run(&self) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(queue_num), Some(mut handler)) = (state.queue_num, state.handler.take()) else {
            if self.unbound.load(Ordering::Acquire) {
                return Ok(());
            }
            return Err(ConfigurationError::NotBound.into());
        };

        let result = self.receive_loop(&mut state, queue_num, &mut handler);

        state.queue_num = None;
        if let Err(e) = release(&mut state.queue, queue_num) {
            warn!(queue_num, error = %e, "failed to unbind kernel queue");
        }
        result
    }

    fn unbind(&self) -> Result<(), FirewallError> {
        self.unbound.store(true, Ordering::Release);

        // A running receive loop holds the state and unbinds on its way out.
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(queue_num) = state.queue_num.take() {
                release(&mut state.queue, queue_num)
                    .map_err(|e| FirewallError::queue(queue_num, e))?;
            }
        }
        Ok(())
    }
}

/// Unbind `queue_num` from the socket.
///
/// In nonblocking mode the kernel acknowledgement may not be readable yet, which is not a
/// failure: the unbind request itself has been sent.
fn release(queue: &mut Queue, queue_num: u16) -> io::Result<()> {
    match queue.unbind(queue_num) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        result => result,
    }
}
