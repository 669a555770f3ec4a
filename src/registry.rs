//! Per-context registry of real-time sample-processing units.
//!
//! A [`ProcessingUnit`] is a statically compiled callback routine bound into
//! the audio path (the dynamic-loading scheme this replaces compiled unit
//! source at runtime; the de-duplication contract is preserved). The registry
//! guarantees that a named unit is loaded at most once per device context,
//! ever, while any number of independent handlers may subscribe to its
//! output.
//!
//! Output dispatch crosses from the audio path to the control domain over
//! the unit's single message channel, which is wired to a fan-out dispatcher
//! exactly once no matter how many upstream sources attach over time. The
//! dispatcher invokes handlers in registration order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::context::{ContextId, DeviceContext};
use crate::{AudioPipelineError, PcmFrame};

/// A message posted by a processing unit to its subscribers.
#[derive(Debug, Clone)]
pub enum UnitMessage {
    /// A loudness-envelope sample from a volume meter unit.
    Volume(f32),
    /// A completed PCM frame from an encoding unit.
    ///
    /// `Arc`-wrapped so fan-out to multiple handlers shares the storage the
    /// unit transferred out, rather than copying it.
    Frame(Arc<PcmFrame>),
}

/// A real-time sample-processing routine.
///
/// `process` runs on the audio path for each sample block and must not
/// block; it communicates outward only by emitting messages, which the
/// registry forwards to the control domain.
pub trait ProcessingUnit: Send {
    /// Processes one block of normalized samples, emitting zero or more
    /// messages.
    fn process(&mut self, block: &[f32], emit: &mut dyn FnMut(UnitMessage));

    /// Clears per-session state.
    ///
    /// Units stay loaded across sessions; a new session resets the units it
    /// is about to feed so no samples or envelope carry over from the
    /// previous one. The default does nothing.
    fn reset(&mut self) {}
}

/// Callback invoked with each message a unit emits.
pub type UnitHandler = Arc<dyn Fn(&UnitMessage) + Send + Sync>;

/// Creates a [`UnitHandler`] from a closure.
pub fn unit_handler<F>(f: F) -> UnitHandler
where
    F: Fn(&UnitMessage) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A named, fallible factory producing a processing unit for a context.
///
/// The factory receives the context's sample rate. A factory error surfaces
/// as [`AudioPipelineError::ProcessingUnitLoad`] and leaves no partial
/// registry entry behind.
pub struct UnitDefinition {
    factory: Box<dyn Fn(u32) -> Result<Box<dyn ProcessingUnit>, AudioPipelineError> + Send + Sync>,
}

impl UnitDefinition {
    /// Creates a definition from a factory closure.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(u32) -> Result<Box<dyn ProcessingUnit>, AudioPipelineError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }

    /// Runs the factory for a context running at `sample_rate`.
    pub fn build(&self, sample_rate: u32) -> Result<Box<dyn ProcessingUnit>, AudioPipelineError> {
        (self.factory)(sample_rate)
    }
}

/// Handle to one registered handler; passes to
/// [`ProcessingUnitRegistry::unregister`] for deterministic removal.
#[derive(Debug, Clone)]
pub struct RegistrationHandle {
    context_id: ContextId,
    name: String,
    handler_id: u64,
}

impl RegistrationHandle {
    /// The unit name this handler is attached to.
    pub fn unit_name(&self) -> &str {
        &self.name
    }
}

/// One loaded unit plus its subscriber list.
struct Registration {
    name: String,
    node: Mutex<Box<dyn ProcessingUnit>>,
    handlers: Mutex<Vec<(u64, UnitHandler)>>,
    /// Guards the one-time wiring of the dispatcher, however many sources
    /// attach.
    wired: AtomicBool,
    dispatch_tx: mpsc::UnboundedSender<UnitMessage>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<UnitMessage>>>,
}

impl Registration {
    fn new(name: String, node: Box<dyn ProcessingUnit>, handler_id: u64, handler: UnitHandler) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name,
            node: Mutex::new(node),
            handlers: Mutex::new(vec![(handler_id, handler)]),
            wired: AtomicBool::new(false),
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
        })
    }

    /// Wires the message channel to the fan-out dispatcher, exactly once.
    fn ensure_wired(self: &Arc<Self>) {
        if self
            .wired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let mut rx = self
            .dispatch_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("dispatcher receiver taken twice despite wiring guard");

        let reg = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let handlers: Vec<UnitHandler> = {
                    let list = reg.handlers.lock().unwrap_or_else(|e| e.into_inner());
                    list.iter().map(|(_, h)| Arc::clone(h)).collect()
                };
                for handler in handlers {
                    handler(&message);
                }
            }
            tracing::debug!(unit = %reg.name, "unit dispatcher finished");
        });
    }

    /// Runs the unit against one block, posting emitted messages.
    fn feed(self: &Arc<Self>, block: &[f32]) {
        self.ensure_wired();
        let mut node = self.node.lock().unwrap_or_else(|e| e.into_inner());
        node.process(block, &mut |message| {
            // Receiver lives as long as the registration; send only fails
            // after the registration is cleared, when dropping is correct.
            let _ = self.dispatch_tx.send(message);
        });
    }

    fn add_handler(&self, handler_id: u64, handler: UnitHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((handler_id, handler));
    }

    fn remove_handler(&self, handler_id: u64) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != handler_id);
    }
}

/// Table of loaded processing units, keyed by `(context, unit name)`.
///
/// Shared by reference between the capture and playback halves of the
/// pipeline; each context's units are independent.
pub struct ProcessingUnitRegistry {
    table: Mutex<HashMap<(ContextId, String), Arc<Registration>>>,
    next_handler_id: AtomicU64,
}

impl ProcessingUnitRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    /// Registers `handler` against the named unit on `context`, loading the
    /// unit first if this is the first registration for `(context, name)`.
    ///
    /// When the unit is already loaded the definition is ignored: the
    /// handler is appended and no reload or re-wiring happens.
    ///
    /// # Errors
    ///
    /// Returns [`AudioPipelineError::ProcessingUnitLoad`] if the definition's
    /// factory fails; no registry entry is left behind.
    pub fn register(
        &self,
        context: &DeviceContext,
        name: &str,
        definition: &UnitDefinition,
        handler: UnitHandler,
    ) -> Result<RegistrationHandle, AudioPipelineError> {
        let key = (context.id().clone(), name.to_string());
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);

        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = table.get(&key) {
            tracing::debug!(unit = name, context_id = %context.id(), "unit already loaded, appending handler");
            existing.add_handler(handler_id, handler);
        } else {
            let node = definition.build(context.sample_rate()).map_err(|e| match e {
                load @ AudioPipelineError::ProcessingUnitLoad { .. } => load,
                other => AudioPipelineError::unit_load(name, other.to_string()),
            })?;
            table.insert(
                key,
                Registration::new(name.to_string(), node, handler_id, handler),
            );
            tracing::info!(unit = name, context_id = %context.id(), "processing unit loaded");
        }

        Ok(RegistrationHandle {
            context_id: context.id().clone(),
            name: name.to_string(),
            handler_id,
        })
    }

    /// Removes the handler identified by `handle`.
    ///
    /// The unit itself stays loaded: re-registering the same name later
    /// appends a handler without reloading.
    pub fn unregister(&self, handle: &RegistrationHandle) {
        let key = (handle.context_id.clone(), handle.name.clone());
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reg) = table.get(&key) {
            reg.remove_handler(handle.handler_id);
        }
    }

    /// Feeds one block through the named unit, if loaded.
    pub fn feed(&self, context_id: &ContextId, name: &str, block: &[f32]) {
        let reg = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.get(&(context_id.clone(), name.to_string())).cloned()
        };
        if let Some(reg) = reg {
            reg.feed(block);
        }
    }

    /// Feeds one block through every unit loaded on `context_id`.
    ///
    /// Used by the playback path to meter scheduled chunks through whatever
    /// units the collaborator registered on the playback context.
    pub fn feed_all(&self, context_id: &ContextId, block: &[f32]) {
        let regs: Vec<Arc<Registration>> = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table
                .iter()
                .filter(|((ctx, _), _)| ctx == context_id)
                .map(|(_, reg)| Arc::clone(reg))
                .collect()
        };
        for reg in regs {
            reg.feed(block);
        }
    }

    /// Resets the named unit's per-session state, if loaded.
    ///
    /// Sessions call this on the units they feed before feeding them, so a
    /// restarted session never inherits a partially-filled buffer or a
    /// decayed envelope from its predecessor.
    pub fn reset_unit(&self, context_id: &ContextId, name: &str) {
        let reg = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.get(&(context_id.clone(), name.to_string())).cloned()
        };
        if let Some(reg) = reg {
            reg.node.lock().unwrap_or_else(|e| e.into_inner()).reset();
        }
    }

    /// Returns `true` if `(context_id, name)` has a loaded unit.
    pub fn is_loaded(&self, context_id: &ContextId, name: &str) -> bool {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.contains_key(&(context_id.clone(), name.to_string()))
    }

    /// Drops every registration for `context_id`.
    ///
    /// Used when a context is closed for good; dispatcher tasks finish once
    /// their channels drain.
    pub fn clear_context(&self, context_id: &ContextId) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.retain(|(ctx, _), _| ctx != context_id);
    }
}

impl Default for ProcessingUnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}
