//! Channel table entries and the shared value store.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bus::{BusVarId, Meta, Type, Value};

use crate::queue::Ring;
use crate::table::{ChanDef, VarId};

pub(crate) fn lock_queue(queue: &Mutex<Ring<QEntry>>) -> MutexGuard<'_, Ring<QEntry>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Static identity of one program variable.
pub(crate) struct Chan {
    /// Variable name, including subscripts, for diagnostics.
    pub var_name: String,
    /// Process variable name assigned at startup; empty = anonymous.
    pub pv_name: String,
    /// Element type.
    pub ty: Type,
    /// Declared element count.
    pub count: usize,
    /// Event number tested against state event masks.
    pub event_num: u32,
    /// Ring of incoming values, present iff the channel is queued.
    pub queue: Option<Mutex<Ring<QEntry>>>,
}

impl Chan {
    pub(crate) fn new(def: &ChanDef, event_num: u32) -> Self {
        Self {
            var_name: def.var_name.clone(),
            pv_name: def.pv_name.clone(),
            ty: def.ty,
            count: def.count.max(1),
            event_num,
            queue: (def.queue_size > 0).then(|| Mutex::new(Ring::new(def.queue_size))),
        }
    }
}

/// Dynamic record present while a channel is assigned to a named PV.
pub(crate) struct DbChan {
    /// Transport handle.
    pub id: BusVarId,
    /// Resolved process variable name.
    pub name: String,
    /// Element count reported by the transport, clamped to the declared
    /// count once connected.
    pub count: usize,
    /// Whether the transport reports the variable reachable.
    pub connected: bool,
}

/// One queued delivery: the value and the meta it arrived with.
#[derive(Clone)]
pub(crate) struct QEntry {
    pub value: Value,
    pub meta: Meta,
}

/// One shared-buffer or shadow slot: the last value and its meta.
#[derive(Clone)]
pub(crate) struct VarSlot {
    pub value: Value,
    pub meta: Meta,
}

impl VarSlot {
    pub(crate) fn zeroed(ty: Type, count: usize) -> Self {
        Self {
            value: Value::zeroed(ty, count),
            meta: Meta::ok(),
        }
    }
}

/// Mutable view over the initial variable values, handed to a program's
/// init routine before any state set runs.
pub struct VarInit<'a> {
    chans: &'a [Chan],
    slots: &'a mut [VarSlot],
}

impl<'a> VarInit<'a> {
    pub(crate) fn new(chans: &'a [Chan], slots: &'a mut [VarSlot]) -> Self {
        Self { chans, slots }
    }

    /// Seed the initial value of a variable.
    ///
    /// # Panics
    ///
    /// Panics if the value's element type differs from the channel's
    /// declared type. The value is resized to the declared count.
    pub fn set(&mut self, v: VarId, mut value: Value) {
        let chan = &self.chans[v.index()];

        assert_eq!(
            value.ty(),
            chan.ty,
            "initial value for {} has the wrong element type",
            chan.var_name
        );

        value.resize(chan.count);
        self.slots[v.index()].value = value;
    }
}
