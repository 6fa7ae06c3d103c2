use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::{fmt, io, thread};

use tracing::{error, warn};

/// OS thread that is joined when dropped
pub struct AutoJoinHandle {
    name: &'static str,
    join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    /// Spawn a named thread running `f`; an `Err` returned by `f` is logged
    pub fn spawn_res<F, E>(name: &'static str, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        F: Send + 'static,
        E: Send + fmt::Display + 'static,
    {
        let join_handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                if let Err(e) = f() {
                    error!(thread = name, error = %e, "Thread failed");
                }
            })?;

        Ok(Self {
            name,
            join_handle: Some(join_handle),
        })
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                error!(thread = self.name, "Thread panicked");
            }
        }
    }
}

/// Stops the whole node if dropped without calling [`PanicGuard::done`]
pub struct PanicGuard {
    name: &'static str,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, flag: Arc<AtomicBool>) -> Self {
        Self {
            name,
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done && thread::panicking() {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Spawn a long running task on the current runtime, guarded by a [`PanicGuard`]
pub fn spawn_guarded<F>(
    name: &'static str,
    flag: Arc<AtomicBool>,
    fut: F,
) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let guard = PanicGuard::new(name, flag);
        fut.await;
        guard.done();
    })
}
