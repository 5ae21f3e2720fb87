//! In-memory bus used by the test suite and anonymous-only programs.
//!
//! Variables are plain named cells. Connection state and monitor
//! deliveries are driven explicitly by the caller, and pending get/put
//! completions can be held back to exercise timeout paths. All handler
//! invocations happen on the calling thread, after the internal lock has
//! been released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slab::Slab;
use tracing::debug;

use crate::error::ErrorKind;
use crate::{Bus, BusEvents, BusVarId, Error, Meta, Status, Type, Value};

#[derive(Default)]
pub struct MemBus {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    vars: Slab<MemVar>,
    hold: bool,
    pending: VecDeque<Pending>,
}

struct MemVar {
    name: String,
    tag: u32,
    events: Arc<dyn BusEvents>,
    connected: bool,
    monitored: bool,
    value: Option<Value>,
}

enum Pending {
    Get {
        var: usize,
        ty: Type,
        count: usize,
        token: u64,
    },
    Put {
        var: usize,
        count: usize,
        value: Value,
        token: u64,
    },
}

impl MemBus {
    /// Construct a new empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed the stored value of `name` without delivering anything.
    ///
    /// The length of the seeded value becomes the element count reported
    /// on connect.
    pub fn seed(&self, name: &str, value: Value) {
        let mut inner = self.inner();

        for (_, var) in inner.vars.iter_mut() {
            if var.name == name {
                var.value = Some(value.clone());
            }
        }
    }

    /// The value last stored for `name`, if any variable carries it.
    pub fn stored(&self, name: &str) -> Option<Value> {
        let inner = self.inner();
        inner
            .vars
            .iter()
            .find(|(_, var)| var.name == name)
            .and_then(|(_, var)| var.value.clone())
    }

    /// Number of live variables.
    pub fn var_count(&self) -> usize {
        self.inner().vars.len()
    }

    /// Number of completions currently held back.
    pub fn pending_completions(&self) -> usize {
        self.inner().pending.len()
    }

    /// Hold get/put completions instead of delivering them immediately.
    pub fn hold_completions(&self, hold: bool) {
        self.inner().hold = hold;
    }

    /// Mark every variable connected, delivering connection events.
    pub fn connect_all(&self) {
        self.set_connected(None, true);
    }

    /// Mark variables named `name` connected.
    pub fn connect(&self, name: &str) {
        self.set_connected(Some(name), true);
    }

    /// Mark variables named `name` disconnected.
    pub fn disconnect(&self, name: &str) {
        self.set_connected(Some(name), false);
    }

    /// Store a new value for `name` and deliver it to every connected
    /// monitor of that name.
    pub fn post(&self, name: &str, value: Value) {
        let deliveries = {
            let mut inner = self.inner();
            let mut deliveries = Vec::new();

            for (_, var) in inner.vars.iter_mut() {
                if var.name != name {
                    continue;
                }

                var.value = Some(value.clone());

                if var.connected && var.monitored {
                    deliveries.push((var.events.clone(), var.tag, value.clone()));
                }
            }

            deliveries
        };

        for (events, tag, value) in deliveries {
            debug!(tag, "delivering monitor event");
            events.event(tag, value, Meta::ok());
        }
    }

    /// Deliver every held completion in the order it was posted.
    pub fn release_completions(&self) {
        loop {
            let mut inner = self.inner();

            let Some(pending) = inner.pending.pop_front() else {
                return;
            };

            match pending {
                Pending::Get {
                    var,
                    ty,
                    count,
                    token,
                } => {
                    let Some(var) = inner.vars.get(var) else {
                        continue;
                    };

                    let value = read_value(var, ty, count);
                    let events = var.events.clone();
                    drop(inner);
                    events.get_complete(token, Status::Ok, Some(value), Meta::ok());
                }
                Pending::Put {
                    var,
                    count,
                    value,
                    token,
                } => {
                    let Some((events, deliveries)) = apply_put(&mut inner, var, count, value)
                    else {
                        continue;
                    };

                    drop(inner);

                    for (events, tag, value) in deliveries {
                        events.event(tag, value, Meta::ok());
                    }

                    events.put_complete(token, Status::Ok);
                }
            }
        }
    }

    fn set_connected(&self, name: Option<&str>, connected: bool) {
        let deliveries = {
            let mut inner = self.inner();
            let mut deliveries = Vec::new();

            for (_, var) in inner.vars.iter_mut() {
                if name.is_some_and(|name| var.name != name) {
                    continue;
                }

                if var.connected != connected {
                    var.connected = connected;
                    let count = var.value.as_ref().map(Value::len).unwrap_or(1);
                    deliveries.push((var.events.clone(), var.tag, count));
                }
            }

            deliveries
        };

        for (events, tag, count) in deliveries {
            events.connection(tag, connected, count);
        }
    }
}

fn read_value(var: &MemVar, ty: Type, count: usize) -> Value {
    let mut value = var
        .value
        .clone()
        .unwrap_or_else(|| Value::zeroed(ty, count));
    value.resize(count);
    value
}

type Delivery = (Arc<dyn BusEvents>, u32, Value);

fn apply_put(
    inner: &mut Inner,
    var: usize,
    count: usize,
    mut value: Value,
) -> Option<(Arc<dyn BusEvents>, Vec<Delivery>)> {
    value.resize(count);

    let name = inner.vars.get(var)?.name.clone();
    let events = inner.vars.get(var)?.events.clone();

    let mut deliveries = Vec::new();

    for (_, v) in inner.vars.iter_mut() {
        if v.name != name {
            continue;
        }

        v.value = Some(value.clone());

        if v.connected && v.monitored {
            deliveries.push((v.events.clone(), v.tag, value.clone()));
        }
    }

    Some((events, deliveries))
}

impl Bus for MemBus {
    fn var_create(
        &self,
        name: &str,
        events: Arc<dyn BusEvents>,
        tag: u32,
    ) -> Result<BusVarId, Error> {
        if name.is_empty() {
            return Err(ErrorKind::EmptyName.into());
        }

        let mut inner = self.inner();

        let key = inner.vars.insert(MemVar {
            name: name.to_owned(),
            tag,
            events,
            connected: false,
            monitored: false,
            value: None,
        });

        debug!(name, key, "created variable");
        Ok(BusVarId::new(key as u32))
    }

    fn var_destroy(&self, id: BusVarId) {
        let mut inner = self.inner();

        if inner.vars.contains(id.index()) {
            inner.vars.remove(id.index());
        }
    }

    fn monitor(&self, id: BusVarId, on: bool) -> Status {
        let mut inner = self.inner();

        match inner.vars.get_mut(id.index()) {
            Some(var) => {
                var.monitored = on;
                Status::Ok
            }
            None => Status::Error,
        }
    }

    fn get_callback(&self, id: BusVarId, ty: Type, count: usize, token: u64) -> Status {
        let mut inner = self.inner();

        let Some(var) = inner.vars.get(id.index()) else {
            return Status::Error;
        };

        if !var.connected {
            return Status::Disconn;
        }

        if inner.hold {
            inner.pending.push_back(Pending::Get {
                var: id.index(),
                ty,
                count,
                token,
            });
            return Status::Ok;
        }

        let value = read_value(var, ty, count);
        let events = var.events.clone();
        drop(inner);
        events.get_complete(token, Status::Ok, Some(value), Meta::ok());
        Status::Ok
    }

    fn put_no_block(&self, id: BusVarId, _ty: Type, count: usize, value: &Value) -> Status {
        let mut inner = self.inner();

        if !inner.vars.contains(id.index()) {
            return Status::Error;
        }

        let Some((_, deliveries)) = apply_put(&mut inner, id.index(), count, value.clone()) else {
            return Status::Error;
        };

        drop(inner);

        for (events, tag, value) in deliveries {
            events.event(tag, value, Meta::ok());
        }

        Status::Ok
    }

    fn put_callback(
        &self,
        id: BusVarId,
        _ty: Type,
        count: usize,
        value: &Value,
        token: u64,
    ) -> Status {
        let mut inner = self.inner();

        if !inner.vars.contains(id.index()) {
            return Status::Error;
        }

        if inner.hold {
            inner.pending.push_back(Pending::Put {
                var: id.index(),
                count,
                value: value.clone(),
                token,
            });
            return Status::Ok;
        }

        let Some((events, deliveries)) = apply_put(&mut inner, id.index(), count, value.clone())
        else {
            return Status::Error;
        };

        drop(inner);

        for (events, tag, value) in deliveries {
            events.event(tag, value, Meta::ok());
        }

        events.put_complete(token, Status::Ok);
        Status::Ok
    }

    fn flush(&self) {}
}
