//! Publish/subscribe notification primitive.
//!
//! A [`Signal`] is an event source with no stored value. Hooks subscribe with
//! [`Signal::connect`] and receive every [`SignalData`] raised afterwards,
//! synchronously, on the raising thread, in connection order.
//!
//! ## Dispatch rules
//!
//! - The connection list is snapshotted when `raise` starts. A hook connected
//!   while a raise is in progress is not called for that raise.
//! - A hook disconnected while a raise is in progress is skipped if it has not
//!   been called yet. No hook is called twice for one raise.
//! - Hooks may raise further signals, including the one being dispatched.
//! - A panicking hook is caught at the signal boundary and logged; the
//!   remaining hooks are still called.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::VarData;

/// Filter tag given at connection time and passed back on each call.
pub type HookTag = i32;

/// One raised event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignalData {
    /// Signal-specific event identifier.
    pub sigid: u16,
    /// Sub-index (bit number, vector index, address...).
    pub index: i64,
    pub data: VarData,
}

/// Subscriber callback.
pub trait SignalHook: Send + Sync {
    fn raised(&self, data: &SignalData, tag: HookTag);
}

impl<F> SignalHook for F
where
    F: Fn(&SignalData, HookTag) + Send + Sync,
{
    fn raised(&self, data: &SignalData, tag: HookTag) {
        self(data, tag)
    }
}

#[derive(Clone)]
struct Connection {
    hook: Arc<dyn SignalHook>,
    tag: HookTag,
}

impl Connection {
    #[inline(always)]
    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.hook) as *const ()
    }
}

#[derive(Default)]
struct SignalInner {
    connections: Mutex<Vec<Connection>>,
}

/// Cheaply clonable signal handle. Clones refer to the same signal.
#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("hooks", &self.hook_count())
            .finish()
    }
}

fn hook_addr<H: ?Sized>(hook: &Arc<H>) -> *const () {
    Arc::as_ptr(hook) as *const ()
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    fn connections(&self) -> MutexGuard<'_, Vec<Connection>> {
        // Hooks never run under this lock, so poisoning can only come from
        // an allocation failure; the list itself is still consistent.
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// True if both handles refer to the same signal.
    pub fn same_as(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe `hook`. Connecting an already connected hook updates its tag.
    pub fn connect(&self, hook: Arc<dyn SignalHook>, tag: HookTag) {
        let addr = hook_addr(&hook);
        let mut conns = self.connections();
        if let Some(c) = conns.iter_mut().find(|c| c.addr() == addr) {
            c.tag = tag;
        } else {
            conns.push(Connection { hook, tag });
        }
    }

    /// Unsubscribe `hook`. Returns false if it was not connected.
    pub fn disconnect<H: ?Sized>(&self, hook: &Arc<H>) -> bool {
        let addr = hook_addr(hook);
        let mut conns = self.connections();
        let before = conns.len();
        conns.retain(|c| c.addr() != addr);
        conns.len() != before
    }

    pub fn is_connected<H: ?Sized>(&self, hook: &Arc<H>) -> bool {
        let addr = hook_addr(hook);
        self.connections().iter().any(|c| c.addr() == addr)
    }

    pub fn hook_count(&self) -> usize {
        self.connections().len()
    }

    /// Raise an event built from its parts.
    pub fn raise(&self, sigid: u16, index: i64, data: impl Into<VarData>) {
        self.raise_data(&SignalData { sigid, index, data: data.into() });
    }

    /// Raise an event with no payload.
    pub fn raise_empty(&self, sigid: u16, index: i64) {
        self.raise_data(&SignalData { sigid, index, data: VarData::None });
    }

    pub fn raise_data(&self, data: &SignalData) {
        let snapshot: Vec<Connection> = self.connections().clone();
        for conn in snapshot {
            let addr = conn.addr();
            let still_connected = self.connections().iter().any(|c| c.addr() == addr);
            if !still_connected {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| conn.hook.raised(data, conn.tag)));
            if let Err(payload) = result {
                tracing::error!(
                    sigid = data.sigid,
                    index = data.index,
                    "signal hook panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Hook that keeps every event it receives. Handy for tracing and tests.
#[derive(Default)]
pub struct SignalRecorder {
    records: Mutex<Vec<(SignalData, HookTag)>>,
}

impl SignalRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn records(&self) -> MutexGuard<'_, Vec<(SignalData, HookTag)>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<(SignalData, HookTag)> {
        std::mem::take(&mut *self.records())
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Number of recorded events with the given `sigid`.
    pub fn count(&self, sigid: u16) -> usize {
        self.records().iter().filter(|(d, _)| d.sigid == sigid).count()
    }

    pub fn last(&self) -> Option<SignalData> {
        self.records().last().map(|(d, _)| d.clone())
    }
}

impl SignalHook for SignalRecorder {
    fn raised(&self, data: &SignalData, tag: HookTag) {
        self.records().push((data.clone(), tag));
    }
}
