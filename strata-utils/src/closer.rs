use core::sync::atomic::{AtomicBool, Ordering};

use crate::ref_counter::RefCounter;
use arc_swap::ArcSwapOption;
use crossbeam_channel::{unbounded, Receiver, Sender};
use wg::WaitGroup;

/// Closer holds the two things needed to shut a set of workers down and wait
/// for them to finish: a channel that closes when shutdown is signaled, and a
/// wait group with which to wait for the workers to drain.
///
/// The signal channel never carries a message; dropping its sender closes it,
/// so every blocked `recv` on [`Closer::has_been_closed`] returns at once.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct Closer {
    inner: RefCounter<Inner>,
}

#[derive(Debug)]
struct Inner {
    wg: WaitGroup,
    tx: ArcSwapOption<Sender<()>>,
    rx: Receiver<()>,
    closed: AtomicBool,
}

impl Default for Closer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Closer {
    /// Constructs a new `Closer` with an initial count on the wait group.
    #[inline]
    pub fn new(initial: usize) -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: RefCounter::new(Inner {
                wg: WaitGroup::new().add(initial),
                tx: ArcSwapOption::from_pointee(tx),
                rx,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Adds `running` workers to the wait group.
    #[inline]
    pub fn add_running(&self, running: usize) {
        self.inner.wg.add(running);
    }

    /// Marks one worker as finished.
    #[inline]
    pub fn done(&self) {
        self.inner.wg.done();
    }

    /// Signals shutdown. Idempotent.
    #[inline]
    pub fn signal(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.tx.swap(None);
        }
    }

    /// A receiver that fails (and thus unblocks) once [`Closer::signal`] has
    /// been called.
    #[inline]
    pub fn has_been_closed(&self) -> &Receiver<()> {
        &self.inner.rx
    }

    /// Waits for every added worker to call [`Closer::done`].
    #[inline]
    pub fn wait(&self) {
        self.inner.wg.wait();
    }

    /// Signals shutdown, then waits for the workers to drain.
    #[inline]
    pub fn signal_and_wait(&self) {
        self.signal();
        self.wait();
    }
}
