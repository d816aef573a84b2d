//! External interrupt (SIGINT/SIGTERM) as a shared flag.
//!
//! The loop is synchronous, so signals are received on a dedicated thread
//! running a single-threaded tokio runtime. The watchdog and the controller
//! poll the flag; nothing is torn down from the signal context itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::exit_codes::INTERRUPTED;

#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    raised: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in `step` increments. Returns `true` if the flag
    /// was raised before the time elapsed.
    pub fn sleep(&self, duration: Duration, step: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_raised() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
}

/// Raise `flag` on SIGINT or SIGTERM. A second signal exits the process
/// at once with [`INTERRUPTED`]. The listener thread lives for the rest of
/// the process.
pub fn install(flag: &InterruptFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("build signal runtime")?;
    let flag = flag.clone();
    thread::Builder::new()
        .name("looper-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let mut signals = match Signals::new() {
                    Ok(signals) => signals,
                    Err(err) => {
                        warn!(err = %err, "signal listener failed");
                        return;
                    }
                };
                relay(&mut signals, &flag, || {
                    std::process::exit(INTERRUPTED);
                })
                .await;
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}

trait SignalSource {
    /// Name of the next delivered signal, or `None` once the source closes.
    async fn recv(&mut self) -> Option<&'static str>;
}

async fn relay(source: &mut impl SignalSource, flag: &InterruptFlag, force_exit: impl FnOnce()) {
    let Some(name) = source.recv().await else {
        return;
    };
    info!(signal = name, "interrupt received, stopping after the current step");
    flag.raise();
    if let Some(name) = source.recv().await {
        warn!(signal = name, "second interrupt, exiting immediately");
        force_exit();
    }
}

#[cfg(unix)]
struct Signals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }
}

#[cfg(unix)]
impl SignalSource for Signals {
    async fn recv(&mut self) -> Option<&'static str> {
        tokio::select! {
            got = self.term.recv() => got.map(|()| "SIGTERM"),
            got = self.int.recv() => got.map(|()| "SIGINT"),
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }
}

#[cfg(not(unix))]
impl SignalSource for Signals {
    async fn recv(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|()| "ctrl-c")
    }
}
