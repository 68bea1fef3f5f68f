//! Background work: repeating jobs and a single-shot countdown
//!
//! Each periodic task (ledger refresh, confirmation polling, approval expiry
//! sweep) runs on its own named thread owned by a [`RepeatingJob`]. A job is
//! stopped explicitly with [`RepeatingJob::stop`] or implicitly on drop, and
//! stopping joins the thread, so no work survives shutdown.
//!
//! The vault's auto-lock uses a [`Countdown`]: one thread waiting for a
//! deadline that can be re-armed or cancelled at any time.

use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use serde_json::json;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::logging::{log_core, LogLevel};

/// A task executed on a fixed or adaptive interval until stopped
pub struct RepeatingJob {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RepeatingJob {
    /// Run `task` every `interval`
    pub fn start<F>(name: &str, interval: Duration, mut task: F) -> WalletResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        Self::start_adaptive(name, interval, move || {
            task();
            interval
        })
    }

    /// Run `task` repeatedly; each run returns the delay before the next one
    pub fn start_adaptive<F>(name: &str, initial: Duration, mut task: F) -> WalletResult<Self>
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_name = format!("job-{}", name);

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut delay = initial;
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        default(delay) => {
                            delay = task();
                        }
                    }
                }
            })
            .map_err(|e| WalletError::io(format!("spawning job {}", name), e))?;

        log_core(LogLevel::Debug, "background job started", Some(json!({"job": name})));

        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Signal the job and wait for its current run to finish
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            // Dropping the sender also wakes the select
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log_core(
                    LogLevel::Error,
                    "background job panicked",
                    Some(json!({"job": self.name})),
                );
            }
            log_core(LogLevel::Debug, "background job stopped", Some(json!({"job": self.name})));
        }
    }
}

impl Drop for RepeatingJob {
    fn drop(&mut self) {
        self.stop();
    }
}

enum CountdownCommand {
    Arm(Duration),
    Cancel,
    Shutdown,
}

/// Single-shot timer that calls `on_expire` once the armed deadline passes
///
/// Re-arming replaces the deadline; cancelling clears it. The callback runs
/// on the countdown thread.
pub struct Countdown {
    tx: Sender<CountdownCommand>,
    handle: Option<JoinHandle<()>>,
}

impl Countdown {
    pub fn spawn<F>(name: &str, on_expire: F) -> WalletResult<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = unbounded::<CountdownCommand>();
        let handle = thread::Builder::new()
            .name(format!("countdown-{}", name))
            .spawn(move || run_countdown(rx, on_expire))
            .map_err(|e| WalletError::io(format!("spawning countdown {}", name), e))?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Start or restart the countdown
    pub fn arm(&self, after: Duration) {
        let _ = self.tx.send(CountdownCommand::Arm(after));
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(CountdownCommand::Cancel);
    }
}

fn run_countdown<F: Fn()>(rx: Receiver<CountdownCommand>, on_expire: F) {
    let mut deadline: Option<Instant> = None;
    loop {
        let received = match deadline {
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    deadline = None;
                    on_expire();
                    continue;
                }
                rx.recv_timeout(at - now)
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(CountdownCommand::Arm(after)) => deadline = Some(Instant::now() + after),
            Ok(CountdownCommand::Cancel) => deadline = None,
            Ok(CountdownCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                deadline = None;
                on_expire();
            }
        }
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        let _ = self.tx.send(CountdownCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
