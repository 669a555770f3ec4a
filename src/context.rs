//! Device context lifecycle and the user-activation gate.
//!
//! A [`DeviceContext`] is the shared binding to a hardware audio device and
//! its render clock. Contexts are keyed by [`ContextId`] so multiple pipeline
//! instances (a capture encoder and a playback scheduler, say) can share one
//! context without double-initializing anything. The table of live contexts
//! is owned by [`DeviceContextManager`] and passed around by reference -
//! there is no global registry.
//!
//! Platforms that gate audio device creation behind a user gesture are
//! modeled by [`ActivationGate`]: context acquisition that requires
//! activation parks on the gate and retries once when the first
//! pointer/key interaction is signaled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::AudioPipelineError;

/// Unique identifier for a device context.
///
/// Lightweight and cloneable (`Arc<str>` internally), used to key the
/// context table and the processing-unit registry.
///
/// # Example
///
/// ```
/// use duplex_audio::ContextId;
///
/// let capture = ContextId::new("capture");
/// assert_eq!(capture, ContextId::new("capture"));
/// assert_ne!(capture, ContextId::new("playback"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(Arc<str>);

impl ContextId {
    /// Creates a new context id from a string.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ContextId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Options for acquiring a device context.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Sample rate the context's sessions will run at.
    pub sample_rate: u32,
    /// Whether creation must wait for a user-interaction signal.
    pub require_activation: bool,
}

impl ContextOptions {
    /// Creates options for the given sample rate, no activation required.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            require_activation: false,
        }
    }

    /// Requires a user-interaction signal before the context can be created.
    #[must_use]
    pub fn require_activation(mut self) -> Self {
        self.require_activation = true;
        self
    }
}

/// One-shot gate tracking whether a user interaction has been observed.
///
/// UI or platform code calls [`activate()`](ActivationGate::activate) on the
/// first pointer or key interaction; acquisitions that require activation
/// wait on the gate and retry once it opens. The gate never closes again.
pub struct ActivationGate {
    activated: AtomicBool,
    notify: Notify,
}

impl ActivationGate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        Self {
            activated: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Returns `true` once an interaction has been signaled.
    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    /// Signals that a user interaction happened. Idempotent.
    pub fn activate(&self) {
        self.activated.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Waits until the gate is activated. Returns immediately if it already is.
    pub async fn wait(&self) {
        while !self.is_activated() {
            let notified = self.notify.notified();
            if self.is_activated() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ActivationGate {
    fn default() -> Self {
        Self::new()
    }
}

/// A live binding to a hardware audio device and its render clock.
///
/// Shared by reference (`Arc`), never copied. Lifecycle runs from first
/// successful acquisition until [`close()`](DeviceContext::close).
pub struct DeviceContext {
    id: ContextId,
    sample_rate: u32,
    suspended: AtomicBool,
    closed: AtomicBool,
}

impl DeviceContext {
    fn new(id: ContextId, sample_rate: u32) -> Self {
        Self {
            id,
            sample_rate,
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// The id this context is registered under.
    pub fn id(&self) -> &ContextId {
        &self.id
    }

    /// Sample rate the context runs at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns `true` if the context is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Suspends rendering on this context.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    /// Resumes a suspended context.
    ///
    /// # Errors
    ///
    /// Returns [`AudioPipelineError::DeviceContext`] if the context has been
    /// closed.
    pub fn resume(&self) -> Result<(), AudioPipelineError> {
        if self.is_closed() {
            return Err(AudioPipelineError::device_context(
                self.id.as_str(),
                "cannot resume a closed context",
            ));
        }
        self.suspended.store(false, Ordering::Release);
        Ok(())
    }

    /// Returns `true` if the context has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the context. Subsequent acquires for its id create a new one.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("sample_rate", &self.sample_rate)
            .field("suspended", &self.is_suspended())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owns the table of live device contexts and the activation gate.
///
/// A context id maps to at most one live context; re-acquiring an id returns
/// the existing handle as long as it hasn't been closed.
pub struct DeviceContextManager {
    contexts: Mutex<HashMap<ContextId, Arc<DeviceContext>>>,
    activation: ActivationGate,
}

impl DeviceContextManager {
    /// Creates an empty manager with a closed activation gate.
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            activation: ActivationGate::new(),
        }
    }

    /// The activation gate. Platform code signals user interaction here.
    pub fn activation(&self) -> &ActivationGate {
        &self.activation
    }

    /// Acquires the context for `id`, creating it if necessary.
    ///
    /// Returns the existing live handle when one is registered. Otherwise
    /// attempts creation directly; if creation is blocked on missing user
    /// activation, waits for the next interaction signal and retries once.
    ///
    /// # Errors
    ///
    /// Returns [`AudioPipelineError::DeviceContext`] if creation fails after
    /// the retry, or if the options are invalid.
    pub async fn acquire(
        &self,
        id: impl Into<ContextId>,
        options: ContextOptions,
    ) -> Result<Arc<DeviceContext>, AudioPipelineError> {
        let id = id.into();

        if let Some(existing) = self.lookup_live(&id) {
            return Ok(existing);
        }

        match self.try_create(&id, &options) {
            Ok(ctx) => Ok(ctx),
            Err(_) if options.require_activation && !self.activation.is_activated() => {
                tracing::debug!(context_id = %id, "context creation deferred until user interaction");
                self.activation.wait().await;
                self.try_create(&id, &options)
            }
            Err(e) => Err(e),
        }
    }

    /// Closes and removes the context for `id`, if present.
    pub fn close(&self, id: &ContextId) {
        let mut table = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ctx) = table.remove(id) {
            ctx.close();
            tracing::info!(context_id = %id, "device context closed");
        }
    }

    /// Number of live contexts currently registered.
    pub fn live_contexts(&self) -> usize {
        let table = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        table.values().filter(|c| !c.is_closed()).count()
    }

    fn lookup_live(&self, id: &ContextId) -> Option<Arc<DeviceContext>> {
        let mut table = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        match table.get(id) {
            Some(ctx) if !ctx.is_closed() => Some(Arc::clone(ctx)),
            Some(_) => {
                // Prune the closed handle so the id can be re-created
                table.remove(id);
                None
            }
            None => None,
        }
    }

    fn try_create(
        &self,
        id: &ContextId,
        options: &ContextOptions,
    ) -> Result<Arc<DeviceContext>, AudioPipelineError> {
        if options.sample_rate == 0 {
            return Err(AudioPipelineError::device_context(
                id.as_str(),
                "sample rate must be non-zero",
            ));
        }
        if options.require_activation && !self.activation.is_activated() {
            return Err(AudioPipelineError::device_context(
                id.as_str(),
                "user activation required",
            ));
        }

        let mut table = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        // Another acquirer may have created it while we were waiting
        if let Some(ctx) = table.get(id) {
            if !ctx.is_closed() {
                return Ok(Arc::clone(ctx));
            }
        }

        let ctx = Arc::new(DeviceContext::new(id.clone(), options.sample_rate));
        table.insert(id.clone(), Arc::clone(&ctx));
        tracing::info!(context_id = %id, sample_rate = options.sample_rate, "device context created");
        Ok(ctx)
    }
}

impl Default for DeviceContextManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_reuses_live_context() {
        let manager = DeviceContextManager::new();
        let a = manager
            .acquire("shared", ContextOptions::new(24000))
            .await
            .unwrap();
        let b = manager
            .acquire("shared", ContextOptions::new(24000))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.live_contexts(), 1);
    }

    #[tokio::test]
    async fn test_acquire_recreates_after_close() {
        let manager = DeviceContextManager::new();
        let a = manager
            .acquire("ctx", ContextOptions::new(16000))
            .await
            .unwrap();
        a.close();
        let b = manager
            .acquire("ctx", ContextOptions::new(16000))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_acquire_rejects_zero_sample_rate() {
        let manager = DeviceContextManager::new();
        let result = manager.acquire("bad", ContextOptions::new(0)).await;
        assert!(matches!(
            result,
            Err(AudioPipelineError::DeviceContext { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_activation() {
        let manager = Arc::new(DeviceContextManager::new());

        let mgr = Arc::clone(&manager);
        let acquirer = tokio::spawn(async move {
            mgr.acquire("gated", ContextOptions::new(24000).require_activation())
                .await
        });

        // Give the acquirer time to park on the gate
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!acquirer.is_finished());

        manager.activation().activate();
        let ctx = acquirer.await.unwrap().unwrap();
        assert_eq!(ctx.sample_rate(), 24000);
    }

    #[tokio::test]
    async fn test_acquire_immediate_when_already_activated() {
        let manager = DeviceContextManager::new();
        manager.activation().activate();
        let ctx = manager
            .acquire("gated", ContextOptions::new(24000).require_activation())
            .await
            .unwrap();
        assert!(!ctx.is_suspended());
    }

    #[test]
    fn test_suspend_resume() {
        let ctx = DeviceContext::new(ContextId::new("x"), 24000);
        ctx.suspend();
        assert!(ctx.is_suspended());
        ctx.resume().unwrap();
        assert!(!ctx.is_suspended());
    }

    #[test]
    fn test_resume_closed_context_fails() {
        let ctx = DeviceContext::new(ContextId::new("x"), 24000);
        ctx.close();
        assert!(ctx.resume().is_err());
    }

    #[test]
    fn test_context_id_display() {
        let id = ContextId::new("playback");
        assert_eq!(format!("{id}"), "playback");
        let from_str: ContextId = "playback".into();
        assert_eq!(id, from_str);
    }
}
