//! Kernel packet queue bindings.
//!
//! The observer never captures packets itself. It binds a [`PacketSource`] per subscribed
//! queue and runs that source's receive loop on a dedicated thread. On Linux the source is an
//! NFQUEUE socket; [`MemorySource`] feeds captures from memory for tests and replays.

mod memory;
#[cfg(target_os = "linux")]
mod nfqueue;

pub use memory::{Injector, MemorySource};
#[cfg(target_os = "linux")]
pub use nfqueue::NfqueueSource;

use crate::error::FirewallError;
use crate::packet::Verdict;

/// Called by the source for every raw capture (starting at the IP header).
///
/// Returns the verdict to apply, or `None` to leave the source's default (accept).
pub type CaptureHandler = Box<dyn FnMut(&[u8]) -> Option<Verdict> + Send>;

/// Binding to one kernel packet queue.
///
/// `run` blocks the calling thread until `unbind` is called from another thread. Both
/// `unbind` and calling `run` after `unbind` are no-ops that return `Ok(())`.
pub trait PacketSource: Send + Sync {
    fn bind(&self, queue_num: u16, handler: CaptureHandler) -> Result<(), FirewallError>;

    fn run(&self) -> Result<(), FirewallError>;

    fn unbind(&self) -> Result<(), FirewallError>;
}

/// Opens a fresh source for the given queue number.
pub type SourceFactory =
    Box<dyn Fn(u16) -> Result<Box<dyn PacketSource>, FirewallError> + Send + Sync>;
