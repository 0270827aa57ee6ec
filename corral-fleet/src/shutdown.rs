//! Signal driven shutdown hooks
//!
//! Each signal owns a LIFO registry of hooks. On delivery the hooks are
//! popped most recent first and run until one returns `false`. A signal that
//! arrives while hooks are still running, or when nothing is registered,
//! terminates the process immediately: the operator asked twice, so nothing
//! more is attempted.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

use crate::error::{FleetError, Result};

/// Future returned by a hook; `true` lets dispatch continue
pub type HookFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

type HookFn = Arc<dyn Fn() -> HookFuture + Send + Sync>;

/// Exit status used when a second signal forces termination
pub const FORCED_EXIT_CODE: i32 = 1;

/// A named shutdown action
#[derive(Clone)]
pub struct Hook {
    id: String,
    run: HookFn,
}

impl Hook {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            id: id.into(),
            run: Arc::new(move || Box::pin(f()) as HookFuture),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook").field("id", &self.id).finish()
    }
}

/// What happened to one delivered signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Hooks ran; the count says how many
    Dispatched(usize),
    /// Hooks from an earlier delivery were still running
    Reentered,
    /// Nothing was registered
    Unhandled,
}

impl Delivery {
    pub fn must_exit(&self) -> bool {
        !matches!(self, Delivery::Dispatched(_))
    }
}

/// LIFO hook registry for one signal
#[derive(Debug)]
pub struct SignalRegistry {
    name: &'static str,
    hooks: Mutex<Vec<Hook>>,
    dispatching: AtomicBool,
}

impl SignalRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            hooks: Mutex::new(Vec::new()),
            dispatching: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, hook: Hook) {
        debug!("Adding {} hook {}", self.name, hook.id);
        self.lock().push(hook);
    }

    /// Removes every hook with this id, returning how many were removed
    pub fn remove(&self, id: &str) -> usize {
        let mut hooks = self.lock();
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        before - hooks.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Pops and runs hooks, most recent first, until one returns `false`
    ///
    /// The lock is only held while popping, so hooks may add or remove
    /// other hooks.
    pub async fn dispatch(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(hook) = self.lock().pop() else {
                break;
            };
            debug!("Running {} hook {}", self.name, hook.id);
            ran += 1;
            if !(hook.run)().await {
                break;
            }
        }
        ran
    }

    /// Handles one received signal
    pub async fn deliver(&self) -> Delivery {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            return Delivery::Reentered;
        }
        let delivery = if self.is_empty() {
            Delivery::Unhandled
        } else {
            Delivery::Dispatched(self.dispatch().await)
        };
        self.dispatching.store(false, Ordering::SeqCst);
        delivery
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Hook>> {
        self.hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hook registries for SIGINT and SIGTERM
///
/// Created once by the binary and shared with the controller.
#[derive(Debug, Clone)]
pub struct ShutdownHooks {
    interrupt: Arc<SignalRegistry>,
    terminate: Arc<SignalRegistry>,
}

impl Default for ShutdownHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self {
            interrupt: Arc::new(SignalRegistry::new("SIGINT")),
            terminate: Arc::new(SignalRegistry::new("SIGTERM")),
        }
    }

    pub fn interrupt(&self) -> &Arc<SignalRegistry> {
        &self.interrupt
    }

    pub fn terminate(&self) -> &Arc<SignalRegistry> {
        &self.terminate
    }

    /// Adds the hook to both registries
    pub fn add(&self, hook: Hook) {
        self.interrupt.add(hook.clone());
        self.terminate.add(hook);
    }

    pub fn remove(&self, id: &str) {
        self.interrupt.remove(id);
        self.terminate.remove(id);
    }

    /// Starts listening for SIGINT and SIGTERM
    ///
    /// Must be called from within a tokio runtime. Each received signal is
    /// handled on its own task so a second signal can be noticed while the
    /// first one's hooks are still running.
    #[cfg(unix)]
    pub fn listen(&self) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        for (kind, registry) in [
            (SignalKind::interrupt(), self.interrupt.clone()),
            (SignalKind::terminate(), self.terminate.clone()),
        ] {
            let mut stream = signal(kind).map_err(|e| {
                FleetError::Startup(format!(
                    "Failed to install {} handler: {}",
                    registry.name(),
                    e
                ))
            })?;
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    tokio::spawn(handle(registry.clone()));
                }
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn listen(&self) -> Result<()> {
        let registry = self.interrupt.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                tokio::spawn(handle(registry.clone()));
            }
        });
        Ok(())
    }
}

async fn handle(registry: Arc<SignalRegistry>) {
    warn!("Received {}", registry.name());
    let delivery = registry.deliver().await;
    if delivery.must_exit() {
        error!("Exiting forcefully, containers and data may not have been cleaned up");
        std::process::exit(FORCED_EXIT_CODE);
    }
}
