//! Bridge tracing infrastructure.
//!
//! Every runtime carries one [`BridgeTracer`]; the bridge calls its hooks at
//! the points that matter when debugging a cross-runtime problem: interpreter
//! lifecycle, code loading, calls, guest errors, registry anchors and the
//! stack restoration performed at the end of each guarded operation.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Does nothing (production default) |
//! | [`StderrTracer`] | Human-readable event log on stderr |
//! | [`RecordingTracer`] | Keeps every event for later inspection (tests) |
//!
//! Hooks take `&self` because a runtime is shared behind an `Arc`; tracers
//! that keep state use interior mutability.

use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

/// How a chunk of source is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunMode {
    /// Run as a statement sequence.
    Execute,
    /// Run as a single expression whose value is returned.
    #[strum(serialize = "eval")]
    Evaluate,
}

/// Trace event recorded by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An interpreter was created.
    Open {
        /// Memory budget in bytes, if any.
        memory_limit: Option<usize>,
    },
    /// An interpreter was torn down.
    Close,
    /// A chunk of source is about to be loaded.
    Run {
        /// Execute or evaluate.
        mode: RunMode,
        /// Length of the source in bytes (before any `return ` prefix).
        len: usize,
    },
    /// A guest callable is about to be invoked.
    Call {
        /// Number of converted arguments.
        nargs: usize,
    },
    /// A guest call returned successfully.
    Return {
        /// Number of values it produced.
        nresults: usize,
    },
    /// A protected guest operation failed.
    GuestError {
        /// The error text captured from Lua.
        message: String,
    },
    /// A registry anchor was taken.
    Anchor {
        /// Registry key.
        key: i32,
    },
    /// A registry anchor was released.
    Release {
        /// Registry key.
        key: i32,
    },
    /// A guarded operation ended and put the stack back.
    StackRestore {
        /// Stack depth observed when the operation finished.
        observed: usize,
        /// Depth the stack was restored to (the entry depth).
        restored: usize,
    },
}

/// Hooks invoked by the bridge. Every method defaults to a no-op.
pub trait BridgeTracer: fmt::Debug + Send + Sync {
    /// Called once an interpreter is fully bootstrapped.
    fn on_open(&self, _memory_limit: Option<usize>) {}

    /// Called when an interpreter is torn down.
    fn on_close(&self) {}

    /// Called before a chunk is loaded.
    fn on_run(&self, _mode: RunMode, _len: usize) {}

    /// Called right before a guest callable is invoked.
    fn on_call(&self, _nargs: usize) {}

    /// Called after a guest callable returned successfully.
    fn on_return(&self, _nresults: usize) {}

    /// Called whenever a protected operation reports a guest error.
    fn on_guest_error(&self, _message: &str) {}

    /// Called when a registry anchor is taken.
    fn on_anchor(&self, _key: i32) {}

    /// Called when a registry anchor is released.
    fn on_release(&self, _key: i32) {}

    /// Called when a stack guard ends.
    fn on_stack_restore(&self, _observed: usize, _restored: usize) {}
}

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl BridgeTracer for NoopTracer {}

/// Tracer that prints one line per event to stderr.
///
/// Output format:
/// ```text
/// [pylua] open memory_limit=none
/// [pylua] run eval len=3
/// [pylua] >>> call nargs=2
/// [pylua] <<< return nresults=1
/// [pylua] anchor ref=3
/// ```
///
/// Stack restorations are only printed when the stack was actually unbalanced,
/// to keep the log readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer;

impl BridgeTracer for StderrTracer {
    fn on_open(&self, memory_limit: Option<usize>) {
        match memory_limit {
            Some(limit) => eprintln!("[pylua] open memory_limit={limit}"),
            None => eprintln!("[pylua] open memory_limit=none"),
        }
    }

    fn on_close(&self) {
        eprintln!("[pylua] close");
    }

    fn on_run(&self, mode: RunMode, len: usize) {
        eprintln!("[pylua] run {mode} len={len}");
    }

    fn on_call(&self, nargs: usize) {
        eprintln!("[pylua] >>> call nargs={nargs}");
    }

    fn on_return(&self, nresults: usize) {
        eprintln!("[pylua] <<< return nresults={nresults}");
    }

    fn on_guest_error(&self, message: &str) {
        eprintln!("[pylua] !!! guest error: {message}");
    }

    fn on_anchor(&self, key: i32) {
        eprintln!("[pylua] anchor ref={key}");
    }

    fn on_release(&self, key: i32) {
        eprintln!("[pylua] release ref={key}");
    }

    fn on_stack_restore(&self, observed: usize, restored: usize) {
        if observed != restored {
            eprintln!("[pylua] stack restored {observed} -> {restored}");
        }
    }
}

/// Tracer that records every event in order.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTracer {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Removes and returns the events recorded so far.
    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn record(&self, event: TraceEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

impl BridgeTracer for RecordingTracer {
    fn on_open(&self, memory_limit: Option<usize>) {
        self.record(TraceEvent::Open { memory_limit });
    }

    fn on_close(&self) {
        self.record(TraceEvent::Close);
    }

    fn on_run(&self, mode: RunMode, len: usize) {
        self.record(TraceEvent::Run { mode, len });
    }

    fn on_call(&self, nargs: usize) {
        self.record(TraceEvent::Call { nargs });
    }

    fn on_return(&self, nresults: usize) {
        self.record(TraceEvent::Return { nresults });
    }

    fn on_guest_error(&self, message: &str) {
        self.record(TraceEvent::GuestError {
            message: message.to_owned(),
        });
    }

    fn on_anchor(&self, key: i32) {
        self.record(TraceEvent::Anchor { key });
    }

    fn on_release(&self, key: i32) {
        self.record(TraceEvent::Release { key });
    }

    fn on_stack_restore(&self, observed: usize, restored: usize) {
        self.record(TraceEvent::StackRestore { observed, restored });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_tracer_keeps_order() {
        let tracer = RecordingTracer::new();
        tracer.on_run(RunMode::Evaluate, 3);
        tracer.on_call(2);
        tracer.on_return(1);
        assert_eq!(
            tracer.events(),
            vec![
                TraceEvent::Run {
                    mode: RunMode::Evaluate,
                    len: 3
                },
                TraceEvent::Call { nargs: 2 },
                TraceEvent::Return { nresults: 1 },
            ]
        );
    }

    #[test]
    fn take_drains_events() {
        let tracer = RecordingTracer::new();
        tracer.on_anchor(4);
        assert_eq!(tracer.take(), vec![TraceEvent::Anchor { key: 4 }]);
        assert!(tracer.events().is_empty());
    }

    #[test]
    fn run_mode_display() {
        assert_eq!(RunMode::Execute.to_string(), "execute");
        assert_eq!(RunMode::Evaluate.to_string(), "eval");
    }
}
