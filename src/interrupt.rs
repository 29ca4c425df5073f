//! Cooperative interruption.
//!
//! An interrupt is a polled "should I stop" flag. The retry policy checks it
//! before every retry and callers check it between leases; nothing here ever
//! cancels an in-flight store call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

/// Anything that can answer whether shutdown was requested.
pub trait Interrupt: Send + Sync {
    fn is_interrupted(&self) -> bool;
}

/// A cloneable, programmatically controlled interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Interrupt for InterruptFlag {
    fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Flips an [`InterruptFlag`] when the process receives SIGINT, SIGTERM or SIGHUP.
///
/// Signals are awaited on a dedicated thread with its own single-threaded
/// tokio runtime, so the handler works for blocking and async programs alike.
#[derive(Debug, Clone)]
pub struct GracefulInterruptHandler {
    flag: InterruptFlag,
}

impl GracefulInterruptHandler {
    /// Install the signal listeners and return the handler.
    pub fn install() -> crate::Result<Self> {
        let flag = InterruptFlag::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| crate::Error::Other(format!("failed to build signal runtime: {e}")))?;

        let listener = flag.clone();
        std::thread::Builder::new()
            .name("rmq-signals".to_string())
            .spawn(move || runtime.block_on(wait_for_signals(listener)))
            .map_err(|e| crate::Error::Other(format!("failed to spawn signal thread: {e}")))?;

        Ok(Self { flag })
    }

    /// The underlying flag, e.g. to share with a retry policy.
    pub fn flag(&self) -> InterruptFlag {
        self.flag.clone()
    }
}

impl Interrupt for GracefulInterruptHandler {
    fn is_interrupted(&self) -> bool {
        self.flag.is_interrupted()
    }
}

#[cfg(unix)]
async fn wait_for_signals(flag: InterruptFlag) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(term), Ok(hup)) => (term, hup),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "failed to register signal handlers");
            return;
        }
    };

    // Keep listening: repeated signals are harmless and the flag stays set.
    loop {
        let name = tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => "SIGINT",
                Err(e) => {
                    warn!(error = %e, "ctrl-c listener failed");
                    return;
                }
            },
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
        };
        info!(signal = name, "received signal, interrupting");
        flag.trigger();
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(flag: InterruptFlag) {
    loop {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!(signal = "ctrl-c", "received signal, interrupting");
                flag.trigger();
            }
            Err(e) => {
                warn!(error = %e, "ctrl-c listener failed");
                return;
            }
        }
    }
}
