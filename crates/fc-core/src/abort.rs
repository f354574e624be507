use tokio::sync::watch;

// ---------------------------------------------------------------------------
// AbortHandle / AbortSignal
// ---------------------------------------------------------------------------

/// The firing side of a cancellation pair.
///
/// Every top-level operation owns a handle; the matching [`AbortSignal`] is
/// cloned into descendants (tool invocations, model calls, child agents).
/// Firing is idempotent and sticky: once aborted, every present and future
/// signal observes it.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

/// The observing side of a cancellation pair. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortHandle {
    /// Create a fresh handle/signal pair.
    pub fn new() -> (AbortHandle, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (AbortHandle { tx }, AbortSignal { rx })
    }

    /// Fire the abort. Safe to call more than once.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether the abort has already fired.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// A signal observing this handle.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortSignal {
    /// A signal that never fires, for contexts without cancellation.
    pub fn never() -> AbortSignal {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open forever.
        std::mem::forget(tx);
        AbortSignal { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the abort fires. If the handle is dropped without firing,
    /// this treats the drop as an abort so orphaned work does not hang.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
