use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use {
    burrow_common::{Error, Result},
    futures::future::BoxFuture,
    serde::Serialize,
    tracing::info,
};

/// Which access mode currently owns a container's assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerMode {
    /// PTY-driven terminal access.
    #[default]
    Interactive,
    /// Stream-json programmatic access.
    Headless,
}

/// Closes all PTY sessions for a container, returning how many.
pub type InteractiveCloser = Arc<dyn Fn(String) -> BoxFuture<'static, usize> + Send + Sync>;
/// Closes the headless session for a container, if any.
pub type HeadlessCloser = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// Per-container mutual exclusion between interactive and headless use.
/// Switching one way tears the other mode's sessions down through hooks
/// installed at startup.
pub struct ModeArbiter {
    modes: Mutex<HashMap<String, ContainerMode>>,
    interactive_closer: OnceLock<InteractiveCloser>,
    headless_closer: OnceLock<HeadlessCloser>,
}

impl Default for ModeArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeArbiter {
    pub fn new() -> Self {
        Self {
            modes: Mutex::new(HashMap::new()),
            interactive_closer: OnceLock::new(),
            headless_closer: OnceLock::new(),
        }
    }

    pub fn set_interactive_closer(&self, closer: InteractiveCloser) {
        let _ = self.interactive_closer.set(closer);
    }

    pub fn set_headless_closer(&self, closer: HeadlessCloser) {
        let _ = self.headless_closer.set(closer);
    }

    pub fn mode(&self, container_id: &str) -> ContainerMode {
        lock(&self.modes)
            .get(container_id)
            .copied()
            .unwrap_or_default()
    }

    /// Claim the container for headless use, closing every PTY session.
    /// Returns the number of sessions closed.
    pub async fn switch_to_headless(&self, container_id: &str) -> usize {
        let closed = match self.interactive_closer.get() {
            Some(closer) => closer(container_id.to_string()).await,
            None => 0,
        };
        lock(&self.modes).insert(container_id.to_string(), ContainerMode::Headless);
        info!(container_id, closed, "switched to headless mode");
        closed
    }

    /// Claim the container for interactive use, closing the headless
    /// session if one is live.
    pub async fn switch_to_interactive(&self, container_id: &str) -> bool {
        let closed = match self.headless_closer.get() {
            Some(closer) => closer(container_id.to_string()).await,
            None => false,
        };
        lock(&self.modes).insert(container_id.to_string(), ContainerMode::Interactive);
        info!(container_id, closed, "switched to interactive mode");
        closed
    }

    /// Guard an operation that requires the given mode.
    pub fn ensure(&self, container_id: &str, required: ContainerMode) -> Result<()> {
        let current = self.mode(container_id);
        if current == required {
            Ok(())
        } else {
            Err(Error::mode_conflict(format!(
                "container is in {current:?} mode, operation requires {required:?}"
            )))
        }
    }

    pub fn forget(&self, container_id: &str) {
        lock(&self.modes).remove(container_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    fn arbiter_with_counters() -> (ModeArbiter, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let arbiter = ModeArbiter::new();
        let pty_closed = Arc::new(AtomicUsize::new(0));
        let headless_closed = Arc::new(AtomicUsize::new(0));

        let ptys = pty_closed.clone();
        arbiter.set_interactive_closer(Arc::new(move |_id| {
            let ptys = ptys.clone();
            Box::pin(async move {
                ptys.fetch_add(1, Ordering::SeqCst);
                3
            })
        }));
        let headless = headless_closed.clone();
        arbiter.set_headless_closer(Arc::new(move |_id| {
            let headless = headless.clone();
            Box::pin(async move {
                headless.fetch_add(1, Ordering::SeqCst);
                true
            })
        }));
        (arbiter, pty_closed, headless_closed)
    }

    #[tokio::test]
    async fn default_mode_is_interactive() {
        let (arbiter, _, _) = arbiter_with_counters();
        assert_eq!(arbiter.mode("c1"), ContainerMode::Interactive);
        assert!(arbiter.ensure("c1", ContainerMode::Interactive).is_ok());
        assert!(matches!(
            arbiter.ensure("c1", ContainerMode::Headless).unwrap_err(),
            Error::ModeConflict(_)
        ));
    }

    #[tokio::test]
    async fn switching_closes_the_other_side() {
        let (arbiter, pty_closed, headless_closed) = arbiter_with_counters();

        let closed = arbiter.switch_to_headless("c1").await;
        assert_eq!(closed, 3);
        assert_eq!(pty_closed.load(Ordering::SeqCst), 1);
        assert_eq!(arbiter.mode("c1"), ContainerMode::Headless);
        assert!(arbiter.ensure("c1", ContainerMode::Headless).is_ok());

        arbiter.switch_to_interactive("c1").await;
        assert_eq!(headless_closed.load(Ordering::SeqCst), 1);
        assert_eq!(arbiter.mode("c1"), ContainerMode::Interactive);
    }

    #[tokio::test]
    async fn modes_are_per_container() {
        let (arbiter, _, _) = arbiter_with_counters();
        arbiter.switch_to_headless("c1").await;
        assert_eq!(arbiter.mode("c1"), ContainerMode::Headless);
        assert_eq!(arbiter.mode("c2"), ContainerMode::Interactive);
    }
}
