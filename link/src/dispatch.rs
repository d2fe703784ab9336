//! Serial execution contexts.
//!
//! A [`DispatchQueue`] runs closures one at a time, in the order they were
//! dispatched. Every connection owns two of them:
//!
//! - a **work** queue, used for JSON parsing and cache transforms;
//! - a **callback** queue, on which every externally observable callback runs
//!   (phase changes, request completions, subscription events, cache values).
//!
//! Two flavours exist. [`DispatchQueue::serial`] is backed by a tokio task and is
//! what production connections use. [`DispatchQueue::inline`] runs jobs on the
//! dispatching thread, trampolining nested dispatches so FIFO order still holds;
//! it makes tests deterministic and suits hosts that pump their own loop.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

/// A unit of work scheduled on a queue.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    label: String,
    kind: QueueKind,
}

enum QueueKind {
    Serial(mpsc::UnboundedSender<Job>),
    Inline(Mutex<InlineState>),
}

#[derive(Default)]
struct InlineState {
    jobs: VecDeque<Job>,
    draining: bool,
}

impl DispatchQueue {
    /// Spawn a serial queue backed by a tokio task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn serial(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let task_label = label.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(&task_label, job);
            }
            log::debug!("[hass-link] Dispatch queue '{}' closed", task_label);
        });

        Self {
            inner: Arc::new(QueueInner {
                label,
                kind: QueueKind::Serial(tx),
            }),
        }
    }

    /// A queue that runs jobs on the dispatching thread.
    pub fn inline(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                label: label.into(),
                kind: QueueKind::Inline(Mutex::new(InlineState::default())),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Schedule `job` after every job dispatched before it.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        match &self.inner.kind {
            QueueKind::Serial(tx) => {
                if tx.send(Box::new(job)).is_err() {
                    log::warn!(
                        "[hass-link] Dropping job: dispatch queue '{}' is no longer running",
                        self.inner.label
                    );
                }
            },
            QueueKind::Inline(state) => self.run_inline(state, Box::new(job)),
        }
    }

    /// Wait until every job dispatched so far has run.
    pub async fn flush(&self) {
        match &self.inner.kind {
            QueueKind::Serial(_) => {
                let (tx, rx) = oneshot::channel();
                self.dispatch(move || {
                    let _ = tx.send(());
                });
                let _ = rx.await;
            },
            QueueKind::Inline(_) => {},
        }
    }

    fn run_inline(&self, state: &Mutex<InlineState>, job: Job) {
        {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            guard.jobs.push_back(job);
            if guard.draining {
                // The thread already draining picks this job up after its current one.
                return;
            }
            guard.draining = true;
        }

        loop {
            let next = {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                match guard.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        guard.draining = false;
                        return;
                    },
                }
            };
            run_job(&self.inner.label, next);
        }
    }
}

fn run_job(label: &str, job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        log::error!("[hass-link] A job panicked on dispatch queue '{}'", label);
    }
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner.kind {
            QueueKind::Serial(_) => "serial",
            QueueKind::Inline(_) => "inline",
        };
        f.debug_struct("DispatchQueue")
            .field("label", &self.inner.label)
            .field("kind", &kind)
            .finish()
    }
}
