use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Builder as TokioRuntimeBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wasmtime::Engine;

/// Interval between engine epoch increments. A running guest notices a
/// shutdown request within roughly one tick.
pub const EPOCH_TICK: Duration = Duration::from_millis(100);

/// Process-wide stop signal shared by the guest store, the epoch ticker and
/// whatever can end a run (Ctrl-C, stdin, the watchdog).
///
/// Blocking threads park on the condvar, async code awaits the token.
pub struct Shutdown {
    requested: AtomicBool,
    wait_mutex: Mutex<()>,
    wait_cvar: Condvar,
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            wait_mutex: Mutex::new(()),
            wait_cvar: Condvar::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            debug!("shutdown requested");
            self.token.cancel();
            let _guard = self.wait_mutex.lock();
            self.wait_cvar.notify_all();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Parks for up to `duration`; returns whether shutdown has been requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        if let Ok(guard) = self.wait_mutex.lock() {
            // Re-check under the lock so a request between the two checks is not missed.
            if !self.is_requested() {
                let _ = self.wait_cvar.wait_timeout(guard, duration);
            }
        }
        self.is_requested()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

async fn with_shutdown<T>(
    shutdown: &Shutdown,
    fut: impl std::future::Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        _ = shutdown.token.cancelled() => None,
        result = fut => Some(result),
    }
}

/// Advances the engine epoch every [`EPOCH_TICK`] until shutdown, so stores
/// with an epoch deadline get a chance to observe the request.
pub fn spawn_epoch_ticker(engine: Engine, shutdown: Arc<Shutdown>) -> JoinHandle<()> {
    thread::spawn(move || {
        while !shutdown.wait_timeout(EPOCH_TICK) {
            engine.increment_epoch();
        }
        // Nudge one final time so any blocked call observes shutdown promptly.
        engine.increment_epoch();
    })
}

/// Requests shutdown once `timeout` elapses, unless shutdown happens first.
pub fn spawn_watchdog(shutdown: Arc<Shutdown>, timeout: Duration) -> JoinHandle<()> {
    thread::spawn(move || {
        let runtime = match TokioRuntimeBuilder::new_current_thread().enable_time().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(error = %err, "watchdog runtime unavailable, falling back to a blocking wait");
                if !shutdown.wait_timeout(timeout) {
                    shutdown.request();
                }
                return;
            }
        };

        // The sleep registers with the timer driver, so it has to be created
        // inside the runtime rather than as an argument to `block_on`.
        let expired = runtime.block_on(async {
            with_shutdown(&shutdown, tokio::time::sleep(timeout))
                .await
                .is_some()
        });
        if expired {
            info!(timeout_ms = timeout.as_millis() as u64, "timeout reached, stopping guest");
            shutdown.request();
        }
    })
}

/// First Ctrl-C requests shutdown, the second one exits the process.
pub fn install_ctrlc(shutdown: Arc<Shutdown>) -> Result<()> {
    let sigints = Arc::new(AtomicU64::new(0));
    ctrlc::set_handler(move || {
        let count = sigints.fetch_add(1, Ordering::Relaxed) + 1;
        shutdown.request();
        if count >= 2 {
            eprintln!("forcing exit on second Ctrl-C");
            std::process::exit(130);
        }
    })
    .context("installing ctrl-c handler")
}

/// Requests shutdown when `q` (or a raw Ctrl-C byte) arrives on stdin.
///
/// EOF or a read error only disables the key; the run keeps going.
pub fn spawn_stdin_listener(shutdown: Arc<Shutdown>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buf = [0u8; 1];
        while !shutdown.is_requested() {
            match stdin.read(&mut buf) {
                Ok(0) => {
                    debug!("stdin closed, stop key disabled");
                    return;
                }
                Ok(_) if is_stop_key(buf[0]) => {
                    info!("stop requested from stdin");
                    shutdown.request();
                    return;
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(error = %err, "reading stdin failed, stop key disabled");
                    return;
                }
            }
        }
    })
}

fn is_stop_key(byte: u8) -> bool {
    matches!(byte, 3 | b'q' | b'Q')
}
