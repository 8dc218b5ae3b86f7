//! Background execution context hosting the connection supervisor.

use std::future::Future;
use std::sync::mpsc as std_mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::runtime::{Builder, Handle};
use tokio::sync::watch;

use super::config::Scheduler;
use super::connection::panic_message;
use crate::Result;
use crate::error::{Error, Kind};

/// A running supervisor together with the scheduler it runs on.
///
/// Created once per [`Client::start`](crate::ws::Client::start) and kept across reconnects.
#[derive(Debug)]
pub(crate) struct ExecutionContext {
    /// Dedicated thread, present until joined
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Option<ThreadId>,
    /// Flips to `true` once the supervisor future has returned
    finished: watch::Receiver<bool>,
}

impl ExecutionContext {
    /// Schedule `run(state)` according to `scheduler`.
    ///
    /// `state` is only moved into the task once scheduling can no longer fail, so a failed
    /// launch returns it to the caller untouched.
    pub(crate) fn launch<T, R, F>(
        scheduler: &Scheduler,
        thread_name: &str,
        state: T,
        run: R,
    ) -> std::result::Result<Self, (Error, T)>
    where
        T: Send + 'static,
        R: FnOnce(T) -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let (finished_tx, finished) = watch::channel(false);
        let task = move |state| async move {
            run(state).await;
            _ = finished_tx.send(true);
        };

        match scheduler {
            Scheduler::Dedicated => {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => return Err((e.into(), state)),
                };

                let (handoff_tx, handoff_rx) = std_mpsc::sync_channel::<T>(1);
                let spawned = thread::Builder::new()
                    .name(thread_name.to_owned())
                    .spawn(move || {
                        // Nothing arrives when the launch is abandoned
                        if let Ok(state) = handoff_rx.recv() {
                            runtime.block_on(task(state));
                        }
                    });
                let thread = match spawned {
                    Ok(thread) => thread,
                    Err(e) => return Err((e.into(), state)),
                };
                if let Err(std_mpsc::SendError(state)) = handoff_tx.send(state) {
                    let error = std::io::Error::other("WebSocket thread exited before start");
                    return Err((Error::with_source(Kind::Internal, error), state));
                }

                #[cfg(feature = "tracing")]
                tracing::debug!(thread = thread_name, "Started dedicated WebSocket thread");

                Ok(Self {
                    thread_id: Some(thread.thread().id()),
                    thread: Mutex::new(Some(thread)),
                    finished,
                })
            }
            Scheduler::Handle(handle) => {
                drop(handle.spawn(task(state)));

                Ok(Self {
                    thread: Mutex::new(None),
                    thread_id: None,
                    finished,
                })
            }
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Block the calling thread until the supervisor has exited.
    pub(crate) fn join(&self) -> Result<()> {
        if self.thread_id == Some(thread::current().id()) {
            return Err(Error::validation(
                "join called from the client's own thread would deadlock",
            ));
        }
        if Handle::try_current().is_ok() {
            return Err(Error::validation(
                "join blocks the thread; use `stopped().await` inside an async runtime",
            ));
        }

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match thread {
            Some(thread) => thread.join().map_err(|payload| {
                Error::with_source(
                    Kind::Internal,
                    std::io::Error::other(format!(
                        "WebSocket thread panicked: {}",
                        panic_message(payload.as_ref())
                    )),
                )
            }),
            None => {
                futures::executor::block_on(self.stopped());
                Ok(())
            }
        }
    }

    /// Resolve once the supervisor has exited.
    pub(crate) async fn stopped(&self) {
        let mut finished = self.finished.clone();
        // An error means the sender is gone, so the task is gone too.
        _ = finished.wait_for(|done| *done).await;
    }
}
