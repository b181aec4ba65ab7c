//! Phase registry: named update stages and the callbacks pumped on each.
//!
//! A phase is a recurring invocation point the host drives once per tick.
//! Each registered phase owns exactly one [`CallbackCollection`] for the
//! lifetime of the registry. Schedulers add a pump callback when they start
//! and remove it when they stop.
//!
//! # Dispatch policy
//!
//! [`PhaseRegistry::dispatch`] snapshots the collection when it begins.
//! A callback added during a dispatch first runs on the next dispatch of
//! that phase. A callback removed during a dispatch is skipped if its turn
//! has not come yet. Structural mutation from inside a callback is always
//! legal: no registry borrow is held while a callback runs.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::clock::FrameClock;

/// Errors raised by registry configuration calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    /// The phase was registered twice.
    #[error("phase {phase} is already registered")]
    DuplicateRegistration {
        /// The duplicated phase.
        phase: PhaseId,
    },

    /// The phase was never registered.
    #[error("phase {phase} is not registered")]
    UnknownPhase {
        /// The missing phase.
        phase: PhaseId,
    },

    /// A phase-less call was made before a default phase was set.
    #[error("no default phase is set")]
    NoDefaultPhase,
}

/// Errors raised while dispatching a phase.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The phase could not be resolved.
    #[error("dispatch failed: {source}")]
    Phase {
        /// The underlying registry error.
        #[from]
        source: PhaseError,
    },

    /// A callback returned an error. Later callbacks did not run.
    #[error("callback on phase {phase} failed: {source}")]
    Callback {
        /// The phase being dispatched.
        phase: PhaseId,
        /// The error returned by the callback.
        source: anyhow::Error,
    },
}

/// Identifier of an update phase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseId(Cow<'static, str>);

impl PhaseId {
    /// Create a phase id from a static name without allocating.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Create a phase id from any string.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    /// Derive a phase id from a marker type.
    ///
    /// The id is the type's name without its module path or generic
    /// arguments, so `game::loops::Physics` becomes `Physics`.
    pub fn of<T: ?Sized>() -> Self {
        let full = std::any::type_name::<T>();
        let base = full.split('<').next().unwrap_or(full);
        let short = base.rsplit("::").next().unwrap_or(base);
        Self(Cow::Borrowed(short))
    }

    /// Return the phase name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for PhaseId {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<StandardPhase> for PhaseId {
    fn from(phase: StandardPhase) -> Self {
        phase.id()
    }
}

/// The standard phase set of a frame-based host, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardPhase {
    /// Before input and time are updated.
    EarlyUpdate,
    /// Fixed-step simulation.
    FixedUpdate,
    /// Before the main update.
    PreUpdate,
    /// Main per-frame update. The default phase.
    Update,
    /// Before late update.
    PreLateUpdate,
    /// After everything else in the frame.
    PostLateUpdate,
    /// Never dispatched by the driver; dispatched by hand.
    Manual,
}

impl StandardPhase {
    /// Every standard phase, in dispatch order.
    pub const ALL: [Self; 7] = [
        Self::EarlyUpdate,
        Self::FixedUpdate,
        Self::PreUpdate,
        Self::Update,
        Self::PreLateUpdate,
        Self::PostLateUpdate,
        Self::Manual,
    ];

    /// Return the phase name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::EarlyUpdate => "EarlyUpdate",
            Self::FixedUpdate => "FixedUpdate",
            Self::PreUpdate => "PreUpdate",
            Self::Update => "Update",
            Self::PreLateUpdate => "PreLateUpdate",
            Self::PostLateUpdate => "PostLateUpdate",
            Self::Manual => "Manual",
        }
    }

    /// Return the phase id.
    pub const fn id(self) -> PhaseId {
        PhaseId::from_static(self.name())
    }

    /// Whether a host drives this phase automatically every tick.
    pub const fn is_driven(self) -> bool {
        !matches!(self, Self::Manual)
    }
}

/// A zero-argument callback invoked on every dispatch of its phase.
pub type Callback = Rc<dyn Fn() -> anyhow::Result<()>>;

/// Handle returned by [`PhaseRegistry::add`], used to remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// Ordered callbacks of one phase.
#[derive(Clone, Default)]
pub struct CallbackCollection {
    entries: Vec<(CallbackId, Callback)>,
}

impl fmt::Debug for CallbackCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(id, _)| id))
            .finish()
    }
}

impl CallbackCollection {
    /// Create an empty collection.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a callback. It runs after every callback already present.
    pub fn add(&mut self, id: CallbackId, callback: Callback) {
        self.entries.push((id, callback));
    }

    /// Remove a callback. Returns `false` if it was not present.
    pub fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.len() != before
    }

    /// Whether the callback is present.
    pub fn contains(&self, id: CallbackId) -> bool {
        self.entries.iter().any(|(existing, _)| *existing == id)
    }

    /// Number of callbacks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the current entries, in invocation order.
    pub fn snapshot(&self) -> Vec<(CallbackId, Callback)> {
        self.entries.clone()
    }
}

/// The scheduler context: phases, their callbacks, and the host frame clock.
///
/// Construct one per host (or per test) and hand an `Rc` of it to every
/// periodic task and task queue. There is no process-wide instance.
#[derive(Debug, Default)]
pub struct PhaseRegistry {
    phases: RefCell<BTreeMap<PhaseId, CallbackCollection>>,
    default_phase: RefCell<Option<PhaseId>>,
    next_callback: Cell<u64>,
    frame_clock: FrameClock,
}

impl PhaseRegistry {
    /// Create an empty registry with no phases and no default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every [`StandardPhase`] registered and
    /// [`StandardPhase::Update`] as the default.
    pub fn with_standard_phases() -> Self {
        let registry = Self::new();
        for phase in StandardPhase::ALL {
            registry.insert_phase(phase.id());
        }
        registry.set_default(Some(StandardPhase::Update.id()));
        registry
    }

    /// Register an empty callback collection for `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::DuplicateRegistration`] if `phase` exists.
    pub fn register(&self, phase: impl Into<PhaseId>) -> Result<(), PhaseError> {
        let phase = phase.into();
        if self.is_registered(&phase) {
            return Err(PhaseError::DuplicateRegistration { phase });
        }
        self.insert_phase(phase);
        Ok(())
    }

    fn insert_phase(&self, phase: PhaseId) {
        debug!(phase = %phase, "phase registered");
        self.phases.borrow_mut().entry(phase).or_default();
    }

    /// Whether `phase` is registered.
    pub fn is_registered(&self, phase: &PhaseId) -> bool {
        self.phases.borrow().contains_key(phase)
    }

    /// Return every registered phase, ordered by name.
    pub fn phases(&self) -> Vec<PhaseId> {
        self.phases.borrow().keys().cloned().collect()
    }

    /// Set the phase used by phase-less calls. `None` clears it.
    ///
    /// The phase is not validated here; calls that use it fail with
    /// [`PhaseError::UnknownPhase`] if it is not registered.
    pub fn set_default(&self, phase: Option<PhaseId>) {
        debug!(phase = ?phase.as_ref().map(PhaseId::as_str), "default phase set");
        *self.default_phase.borrow_mut() = phase;
    }

    /// Return the default phase, if set.
    pub fn default_phase(&self) -> Option<PhaseId> {
        self.default_phase.borrow().clone()
    }

    /// Resolve an optional phase against the default.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::NoDefaultPhase`] if `phase` is `None` and no
    /// default is set.
    pub fn resolve(&self, phase: Option<&PhaseId>) -> Result<PhaseId, PhaseError> {
        match phase {
            Some(phase) => Ok(phase.clone()),
            None => self.default_phase().ok_or(PhaseError::NoDefaultPhase),
        }
    }

    /// Add a callback to `phase`. Returns the handle used to remove it.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::UnknownPhase`] if `phase` is not registered.
    pub fn add(&self, phase: &PhaseId, callback: Callback) -> Result<CallbackId, PhaseError> {
        let mut phases = self.phases.borrow_mut();
        let collection = phases
            .get_mut(phase)
            .ok_or_else(|| PhaseError::UnknownPhase {
                phase: phase.clone(),
            })?;
        let id = CallbackId(self.next_callback.get());
        self.next_callback.set(self.next_callback.get().wrapping_add(1));
        collection.add(id, callback);
        trace!(phase = %phase, callback = %id, "callback added");
        Ok(id)
    }

    /// Add a callback to the default phase.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::NoDefaultPhase`] or [`PhaseError::UnknownPhase`].
    pub fn add_default(&self, callback: Callback) -> Result<CallbackId, PhaseError> {
        let phase = self.resolve(None)?;
        self.add(&phase, callback)
    }

    /// Remove a callback from `phase`. Returns `false` if it was not there.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::UnknownPhase`] if `phase` is not registered.
    pub fn remove(&self, phase: &PhaseId, id: CallbackId) -> Result<bool, PhaseError> {
        let mut phases = self.phases.borrow_mut();
        let collection = phases
            .get_mut(phase)
            .ok_or_else(|| PhaseError::UnknownPhase {
                phase: phase.clone(),
            })?;
        let removed = collection.remove(id);
        trace!(phase = %phase, callback = %id, removed, "callback removed");
        Ok(removed)
    }

    /// Remove a callback from the default phase.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::NoDefaultPhase`] or [`PhaseError::UnknownPhase`].
    pub fn remove_default(&self, id: CallbackId) -> Result<bool, PhaseError> {
        let phase = self.resolve(None)?;
        self.remove(&phase, id)
    }

    /// Number of callbacks currently registered under `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::UnknownPhase`] if `phase` is not registered.
    pub fn callback_count(&self, phase: &PhaseId) -> Result<usize, PhaseError> {
        self.phases
            .borrow()
            .get(phase)
            .map(CallbackCollection::len)
            .ok_or_else(|| PhaseError::UnknownPhase {
                phase: phase.clone(),
            })
    }

    /// Invoke every callback of `phase` in registration order.
    ///
    /// Returns the number of callbacks invoked. See the module docs for
    /// how mutation during dispatch is handled.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Phase`] if `phase` is not registered, or
    /// [`DispatchError::Callback`] with the first callback error.
    pub fn dispatch(&self, phase: &PhaseId) -> Result<usize, DispatchError> {
        let snapshot = self
            .phases
            .borrow()
            .get(phase)
            .map(CallbackCollection::snapshot)
            .ok_or_else(|| PhaseError::UnknownPhase {
                phase: phase.clone(),
            })?;
        trace!(phase = %phase, callbacks = snapshot.len(), "dispatch");

        let mut invoked: usize = 0;
        for (id, callback) in snapshot {
            if !self.is_live(phase, id) {
                continue;
            }
            callback().map_err(|source| DispatchError::Callback {
                phase: phase.clone(),
                source,
            })?;
            invoked = invoked.saturating_add(1);
        }
        Ok(invoked)
    }

    /// Dispatch the default phase.
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch), plus
    /// [`PhaseError::NoDefaultPhase`].
    pub fn dispatch_default(&self) -> Result<usize, DispatchError> {
        let phase = self.resolve(None)?;
        self.dispatch(&phase)
    }

    /// The host frame clock.
    pub const fn frame_clock(&self) -> &FrameClock {
        &self.frame_clock
    }

    fn is_live(&self, phase: &PhaseId, id: CallbackId) -> bool {
        self.phases
            .borrow()
            .get(phase)
            .is_some_and(|collection| collection.contains(id))
    }
}
