//! Named OS threads, detached or joinable.
//!
//! ```ignore
//! let handle = spawn_joinable("nmx-worker-0", move || worker.run())?;
//! // ...
//! handle.join()?;
//! ```
//!
//! A joinable handle must be consumed by `join` or `detach`. Dropping it
//! unconsumed logs a warning and detaches the thread.

use std::fmt;
use std::thread::{Builder, JoinHandle};

use netmux_core::{NetError, NetResult, ThreadFailure};
use tracing::warn;

/// Start `f` on a new thread nobody will join.
pub fn spawn_detached<F>(name: &str, f: F) -> NetResult<()>
where
    F: FnOnce() + Send + 'static,
{
    spawn(name, f).map(drop)
}

/// Start `f` on a new thread and return a handle for joining it.
pub fn spawn_joinable<F, T>(name: &str, f: F) -> NetResult<ThreadHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let inner = spawn(name, f)?;
    Ok(ThreadHandle {
        inner: Some(inner),
        name: name.to_string(),
    })
}

fn spawn<F, T>(name: &str, f: F) -> NetResult<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().name(name.to_string()).spawn(f).map_err(|e| {
        warn!(thread = name, error = %e, "thread spawn failed");
        NetError::Thread(ThreadFailure::Spawn)
    })
}

pub struct ThreadHandle<T = ()> {
    inner: Option<JoinHandle<T>>,
    name: String,
}

impl<T> ThreadHandle<T> {
    /// Wait for the thread to finish and take its result.
    ///
    /// A panic inside the thread is reported as
    /// `NetError::Thread(ThreadFailure::Panicked)`.
    pub fn join(mut self) -> NetResult<T> {
        let Some(inner) = self.inner.take() else {
            return Err(NetError::StaleHandle);
        };
        inner.join().map_err(|_| {
            warn!(thread = %self.name, "joined thread panicked");
            NetError::Thread(ThreadFailure::Panicked)
        })
    }

    /// Let the thread run to completion on its own.
    pub fn detach(mut self) {
        self.inner.take();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.inner.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl<T> Drop for ThreadHandle<T> {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            warn!(thread = %self.name, "thread handle dropped without join or detach");
        }
    }
}

impl<T> fmt::Debug for ThreadHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.name)
            .field("consumed", &self.inner.is_none())
            .finish()
    }
}
