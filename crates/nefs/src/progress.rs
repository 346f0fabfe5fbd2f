//! Nested weighted progress reporting and cooperative cancellation.
//!
//! Work is split into tasks, each taking a fraction (its weight) of the task it is nested in.
//! A task is begun with [`NefsProgress::begin_task`] and ends when the returned
//! [`NefsProgressTask`] is dropped. Ending a task folds whatever part of it was not already
//! accounted for by its own sub-tasks into the overall percentage:
//!
//! ```text
//! parent.remaining -= child.weight
//! percent          += child.weight * child.remaining * product(ancestor weights)
//! ```
//!
//! ```
//! use nefs::progress::NefsProgress;
//!
//! # fn main() -> nefs::error::Result<()> {
//! let progress = NefsProgress::new();
//! {
//!     let _save = progress.begin_task(1.0, "Saving")?;
//!     let _header = progress.begin_task(0.25, "Writing header")?;
//! }
//! assert_eq!(progress.percent(), 1.0);
//! # Ok(())
//! # }
//! ```

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

use tracing::debug;

use crate::error::{Error, Result};

/// Shared flag that asks a running operation to stop
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; every clone of this token observes it
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with [`Error::Cancelled`] once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Snapshot handed to the progress callback
#[derive(Debug, Clone, PartialEq)]
pub struct NefsProgressInfo {
    /// Overall completion between 0 and 1
    pub percent: f32,
    /// Message of the outermost running task
    pub message: String,
    /// Message of the innermost running task, empty at the top level
    pub sub_message: String,
}

type ProgressCallback = Box<dyn Fn(&NefsProgressInfo) + Send + Sync>;

#[derive(Debug)]
struct TaskFrame {
    weight: f32,
    remaining: f32,
}

#[derive(Debug, Default)]
struct ProgressState {
    stack: Vec<TaskFrame>,
    percent: f32,
    message: String,
    sub_message: String,
}

/// Progress sink and cancellation token threaded through long running operations
pub struct NefsProgress {
    token: CancellationToken,
    state: Mutex<ProgressState>,
    callback: Option<ProgressCallback>,
}

impl Default for NefsProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NefsProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NefsProgress")
            .field("token", &self.token)
            .field("percent", &self.percent())
            .finish()
    }
}

impl NefsProgress {
    /// Progress without a callback and with a fresh token
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Progress observing an existing token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            state: Mutex::new(ProgressState::default()),
            callback: None,
        }
    }

    /// Sets the single callback notified whenever progress changes
    pub fn on_progress(
        mut self,
        callback: impl Fn(&NefsProgressInfo) + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fails with [`Error::Cancelled`] once cancellation was requested
    pub fn check_cancelled(&self) -> Result<()> {
        self.token.check()
    }

    /// Overall completion between 0 and 1
    pub fn percent(&self) -> f32 {
        self.lock().percent
    }

    /// Begins a task taking `weight` of the currently running task
    ///
    /// An outermost task sets the primary message, nested tasks only set the sub-message.
    /// Fails with [`Error::Cancelled`] without starting the task once cancellation was
    /// requested.
    pub fn begin_task(&self, weight: f32, message: impl Into<String>) -> Result<NefsProgressTask<'_>> {
        self.check_cancelled()?;

        let message = message.into();
        let info = {
            let mut state = self.lock();
            if state.stack.is_empty() {
                state.message = message;
                state.sub_message.clear();
            } else {
                state.sub_message = message;
            }
            state.stack.push(TaskFrame {
                weight: weight.clamp(0.0, 1.0),
                remaining: 1.0,
            });
            Self::snapshot(&state)
        };
        self.notify(&info);

        Ok(NefsProgressTask { progress: self })
    }

    fn end_task(&self) {
        let info = {
            let mut state = self.lock();
            let Some(child) = state.stack.pop() else {
                return;
            };

            let scale: f32 = state.stack.iter().map(|frame| frame.weight).product();
            if let Some(parent) = state.stack.last_mut() {
                parent.remaining -= child.weight;
            }
            state.percent = (state.percent + child.weight * child.remaining * scale).min(1.0);

            if state.stack.is_empty() {
                debug!(percent = state.percent, message = %state.message, "task finished");
            }
            Self::snapshot(&state)
        };
        self.notify(&info);
    }

    fn snapshot(state: &ProgressState) -> NefsProgressInfo {
        NefsProgressInfo {
            percent: state.percent,
            message: state.message.clone(),
            sub_message: state.sub_message.clone(),
        }
    }

    fn notify(&self, info: &NefsProgressInfo) {
        if let Some(callback) = &self.callback {
            callback(info);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // state is consistent between updates, poisoning carries no meaning here
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A running task, ended when dropped
#[must_use = "the task ends as soon as this handle is dropped"]
pub struct NefsProgressTask<'a> {
    progress: &'a NefsProgress,
}

impl Drop for NefsProgressTask<'_> {
    fn drop(&mut self) {
        self.progress.end_task();
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use crate::error::{Error, Result};
    use crate::progress::{CancellationToken, NefsProgress, NefsProgressInfo};

    fn assert_close(actual: f32, expected: f32) {
        assert!((actual - expected).abs() < 1e-6, "{actual} != {expected}");
    }

    #[test]
    fn leaf_task_counts_its_whole_weight() -> Result<()> {
        let progress = NefsProgress::new();
        let _root = progress.begin_task(1.0, "Saving")?;
        drop(progress.begin_task(0.5, "Header")?);

        assert_close(progress.percent(), 0.5);
        Ok(())
    }

    #[test]
    fn nested_tasks_scale_by_ancestor_weights() -> Result<()> {
        let progress = NefsProgress::new();
        {
            let _root = progress.begin_task(1.0, "Saving")?;
            drop(progress.begin_task(0.5, "Header")?);
            {
                let _items = progress.begin_task(0.5, "Items")?;
                drop(progress.begin_task(0.5, "first")?);
                assert_close(progress.percent(), 0.75);
            }
            // the unfinished half of "Items" is folded in when it ends
            assert_close(progress.percent(), 1.0);
        }
        assert_close(progress.percent(), 1.0);
        Ok(())
    }

    #[test]
    fn sub_tasks_only_set_the_sub_message() -> Result<()> {
        let seen: Arc<Mutex<Vec<NefsProgressInfo>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let progress =
            NefsProgress::new().on_progress(move |info| sink.lock().unwrap().push(info.clone()));

        {
            let _root = progress.begin_task(1.0, "Opening archive")?;
            let _child = progress.begin_task(1.0, "Reading header")?;
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[1].message, "Opening archive");
        assert_eq!(seen[1].sub_message, "Reading header");
        assert_close(seen[3].percent, 1.0);
        Ok(())
    }

    #[test]
    fn cancelled_token_stops_new_tasks() -> Result<()> {
        let token = CancellationToken::new();
        let progress = NefsProgress::with_token(token.clone());
        let _root = progress.begin_task(1.0, "Saving")?;

        token.cancel();
        assert!(matches!(progress.begin_task(0.5, "next"), Err(Error::Cancelled)));
        assert!(matches!(progress.check_cancelled(), Err(Error::Cancelled)));
        Ok(())
    }
}
