//! Tracking of in-flight asynchronous requests and their completion tokens.
use std::collections::HashMap;
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blkio::Error;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Caller-side completion handle of an asynchronous request.
///
/// A token is signaled at most once per submission, with the request status and, on success,
/// the request buffer handed back. Clones share the same state.
#[derive(Clone, Default)]
pub struct Token(Arc<TokenInner>);

#[derive(Default)]
struct TokenInner {
    state: Mutex<TokenState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct TokenState {
    status: Option<Result<(), Error>>,
    buf: Option<BytesMut>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Token {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.0.state.lock().status.is_some()
    }

    /// The final status, if signaled.
    #[must_use]
    pub fn status(&self) -> Option<Result<(), Error>> {
        self.0.state.lock().status
    }

    /// Take the outcome if signaled. The buffer is only handed out once, later calls get an empty
    /// one.
    #[must_use]
    pub fn try_take(&self) -> Option<Result<BytesMut, Error>> {
        let mut st = self.0.state.lock();
        let status = st.status?;
        Some(status.map(|()| st.buf.take().unwrap_or_default()))
    }

    /// Wait until signaled and take the outcome.
    pub async fn wait(&self) -> Result<BytesMut, Error> {
        loop {
            let mut notified = pin!(self.0.notify.notified());
            notified.as_mut().enable();
            if let Some(ret) = self.try_take() {
                return ret;
            }
            notified.await;
        }
    }

    /// Reset for a new submission.
    pub(crate) fn arm(&self) {
        *self.0.state.lock() = TokenState::default();
    }

    pub(crate) fn signal(&self, outcome: Result<BytesMut, Error>) {
        {
            let mut st = self.0.state.lock();
            debug_assert!(st.status.is_none(), "token signaled twice");
            match outcome {
                Ok(buf) => {
                    st.status = Some(Ok(()));
                    st.buf = Some(buf);
                }
                Err(err) => st.status = Some(Err(err)),
            }
        }
        self.0.notify.notify_waiters();
    }
}

pub(crate) type TaskId = u64;

#[derive(Debug)]
enum Slot {
    /// Issued or about to be issued.
    Live,
    /// Finished successfully, holding its part of the request buffer.
    Done(BytesMut),
    /// Finished, failed, or never issued. Nothing to hand back.
    Released,
}

#[derive(Debug)]
struct Task {
    /// Present until the task is signaled. A task without a token is dead and its remaining
    /// completions are discarded.
    token: Option<Token>,
    slots: Vec<Slot>,
    live: usize,
}

impl Task {
    /// Reassemble the request buffer from the finished parts, in byte order.
    fn take_buffer(&mut self) -> BytesMut {
        let mut out = None::<BytesMut>;
        for slot in &mut self.slots {
            if let Slot::Done(part) = std::mem::replace(slot, Slot::Released) {
                match &mut out {
                    None => out = Some(part),
                    Some(buf) => buf.unsplit(part),
                }
            }
        }
        out.unwrap_or_default()
    }

    fn release_parts(&mut self) {
        for slot in &mut self.slots {
            if matches!(slot, Slot::Done(_)) {
                *slot = Slot::Released;
            }
        }
    }
}

/// All asynchronous requests of one device which have outstanding subtasks.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    tasks: Mutex<HashMap<TaskId, Task>>,
    next_id: AtomicU64,
    idle: Notify,
}

impl Registry {
    /// Track a new request of `subtasks` subtasks, all initially live.
    pub fn register(&self, token: &Token, subtasks: usize) -> TaskId {
        assert_ne!(subtasks, 0);
        token.arm();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            token: Some(token.clone()),
            slots: (0..subtasks).map(|_| Slot::Live).collect(),
            live: subtasks,
        };
        self.tasks.lock().insert(id, task);
        tracing::trace!(task = id, subtasks, "registered task");
        id
    }

    /// Whether the task still waits to be signaled.
    pub fn is_live(&self, id: TaskId) -> bool {
        self.tasks
            .lock()
            .get(&id)
            .is_some_and(|task| task.token.is_some())
    }

    /// Record the completion of subtask `idx` of task `id`, signaling the token on the first
    /// failure or the last completion.
    ///
    /// Completions of unknown tasks or of already finished subtasks are ignored.
    pub fn complete(&self, id: TaskId, idx: usize, status: Result<(), Error>, part: BytesMut) {
        let (signal, drained) = {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(&id) else {
                tracing::trace!(task = id, subtask = idx, "completion of a swept task");
                return;
            };
            let Some(slot) = task
                .slots
                .get_mut(idx)
                .filter(|slot| matches!(slot, Slot::Live))
            else {
                tracing::trace!(task = id, subtask = idx, "stray completion");
                return;
            };

            scopeguard::defer_on_unwind! {
                tracing::error!("task registry left inconsistent on panic");
                std::process::abort();
            }
            *slot = match status {
                Ok(()) if task.token.is_some() => Slot::Done(part),
                _ => Slot::Released,
            };
            task.live -= 1;

            let signal = if status.is_err() || task.live == 0 {
                task.token.take().map(|token| match status {
                    Ok(()) => (token, Ok(task.take_buffer())),
                    Err(err) => {
                        task.release_parts();
                        (token, Err(err))
                    }
                })
            } else {
                None
            };
            (signal, task.live == 0)
        };

        if let Some((token, outcome)) = signal {
            tracing::debug!(task = id, ?status, "task finished");
            token.signal(outcome);
        }
        if drained {
            self.idle.notify_waiters();
        }
    }

    /// Give up the subtasks from `idx` on, which were never issued because issuing subtask `idx`
    /// failed with `err`.
    ///
    /// If the task was still live, it is killed without signaling its token and `err` is
    /// returned. If it was already signaled, the caller observes the outcome through the token.
    pub fn fail_issue(&self, id: TaskId, idx: usize, err: Error) -> Result<(), Error> {
        let (was_live, drained) = {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(&id) else {
                return Ok(());
            };
            for slot in task.slots.iter_mut().skip(idx) {
                if matches!(slot, Slot::Live) {
                    *slot = Slot::Released;
                    task.live -= 1;
                }
            }
            task.release_parts();
            (task.token.take().is_some(), task.live == 0)
        };
        if drained {
            self.idle.notify_waiters();
        }
        if was_live {
            Err(err)
        } else {
            Ok(())
        }
    }

    /// Signal every live token with [`Error::Aborted`].
    ///
    /// Subtasks already in the device still complete later, and are discarded.
    pub fn cancel_all(&self) -> usize {
        let tokens = self
            .tasks
            .lock()
            .values_mut()
            .filter_map(|task| {
                let token = task.token.take()?;
                task.release_parts();
                Some(token)
            })
            .collect::<Vec<_>>();
        for token in &tokens {
            token.signal(Err(Error::Aborted));
        }
        tokens.len()
    }

    /// Drop finished tasks.
    pub fn sweep(&self) {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, task| task.live != 0);
        if tasks.len() != before {
            tracing::trace!(swept = before - tasks.len(), "swept finished tasks");
        }
    }

    /// Number of tasks with subtasks still in the device.
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|task| task.live != 0)
            .count()
    }

    /// Wait until no subtask is outstanding, then drop every task.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();
            self.sweep();
            if self.tasks.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}
