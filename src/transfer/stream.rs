//! Device streams and completion signals.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

static NEXT_SIGNAL: AtomicU64 = AtomicU64::new(1);

struct SignalInner {
    seq: u64,
    done: AtomicBool,
}

/// Marks a point in a stream. Cheap to clone; all clones observe completion.
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

impl CompletionSignal {
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                seq: NEXT_SIGNAL.fetch_add(1, Ordering::Relaxed),
                done: AtomicBool::new(false),
            }),
        }
    }

    /// A signal that is already done, for synchronous paths.
    pub fn completed() -> Self {
        let signal = Self::pending();
        signal.complete();
        signal
    }

    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    pub fn complete(&self) {
        self.inner.done.store(true, Ordering::Release);
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("seq", &self.inner.seq)
            .field("done", &self.is_done())
            .finish()
    }
}

/// An ordered queue of device work.
pub trait DeviceStream: Send {
    fn name(&self) -> &str;

    /// Record a signal that completes once everything queued so far has run.
    fn record_signal(&mut self) -> CompletionSignal;

    /// Make subsequent work on this stream wait for `signal`.
    fn wait_signal(&mut self, signal: &CompletionSignal);

    /// Block until all queued work has run.
    fn synchronize(&mut self);
}

/// Host-side stand-in for a device stream.
///
/// With `auto_complete` every signal is done as soon as it is recorded.
/// Otherwise signals stay pending until `retire` or `synchronize`. Clones
/// share the same queue, so a test can keep one to drive progress.
#[derive(Clone)]
pub struct SimulatedStream {
    name: String,
    auto_complete: bool,
    outstanding: Arc<Mutex<Vec<CompletionSignal>>>,
}

impl SimulatedStream {
    pub fn new(name: impl Into<String>, auto_complete: bool) -> Self {
        Self {
            name: name.into(),
            auto_complete,
            outstanding: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Complete the `count` oldest pending signals.
    pub fn retire(&self, count: usize) {
        let mut outstanding = self.outstanding.lock();
        let count = count.min(outstanding.len());
        for signal in outstanding.drain(..count) {
            signal.complete();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }
}

impl DeviceStream for SimulatedStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn record_signal(&mut self) -> CompletionSignal {
        let signal = CompletionSignal::pending();
        if self.auto_complete {
            signal.complete();
        } else {
            self.outstanding.lock().push(signal.clone());
        }
        signal
    }

    fn wait_signal(&mut self, signal: &CompletionSignal) {
        if !signal.is_done() && !self.auto_complete {
            self.outstanding.lock().push(signal.clone());
        }
    }

    fn synchronize(&mut self) {
        for signal in self.outstanding.lock().drain(..) {
            signal.complete();
        }
    }
}

/// The copy stream and the compute stream.
pub struct StreamPair {
    pub mover: Box<dyn DeviceStream>,
    pub main: Box<dyn DeviceStream>,
}

impl StreamPair {
    pub fn new(mover: Box<dyn DeviceStream>, main: Box<dyn DeviceStream>) -> Self {
        Self { mover, main }
    }

    pub fn simulated(auto_complete: bool) -> Self {
        Self::new(
            Box::new(SimulatedStream::new("mover", auto_complete)),
            Box::new(SimulatedStream::new("main", auto_complete)),
        )
    }

    pub fn synchronize(&mut self) {
        self.main.synchronize();
        self.mover.synchronize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_completion() {
        let s = CompletionSignal::pending();
        let c = s.clone();
        assert!(!c.is_done());
        s.complete();
        assert!(c.is_done());
        assert!(CompletionSignal::completed().is_done());
    }

    #[test]
    fn manual_stream_holds_signals_until_retired() {
        let mut stream = SimulatedStream::new("mover", false);
        let observer = stream.clone();
        let a = stream.record_signal();
        let b = stream.record_signal();
        observer.retire(1);
        assert!(a.is_done());
        assert!(!b.is_done());
        stream.synchronize();
        assert!(b.is_done());
        assert_eq!(stream.outstanding(), 0);
    }

    #[test]
    fn auto_stream_completes_immediately() {
        let mut stream = SimulatedStream::new("main", true);
        assert!(stream.record_signal().is_done());
    }
}
