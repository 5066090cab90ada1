//! # Shutdown Contract
//!
//! Long-lived components stop in two phases: a [`Stoppable::shutdown`]
//! request followed by a [`Stoppable::wait`]. `Asap` stops accepting new
//! work and tries to abort what is in flight; `Drain` lets queued work
//! complete first. `wait` blocks until the component has wound down or the
//! timeout passes.

use std::time::Duration;

/// How urgently a component should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// Stop accepting work and abort in-flight tasks where possible.
    Asap,
    /// Stop accepting work but let queued tasks complete.
    Drain,
}

pub trait Stoppable {
    fn shutdown(&self, request: ShutdownRequest);

    /// Blocks until shutdown completes; returns `false` on timeout.
    fn wait(&mut self, timeout: Duration) -> bool;
}
