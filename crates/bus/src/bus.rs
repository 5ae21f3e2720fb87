use core::fmt;
use std::sync::Arc;

use crate::{Error, Meta, Status, Type, Value};

/// Transport-side handle for one created variable.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BusVarId(u32);

impl BusVarId {
    /// Create a new `BusVarId` from a `u32`.
    #[inline]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the index form of the id.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BusVarId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for BusVarId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sink for transport callbacks.
///
/// `tag` is the value supplied to [`Bus::var_create`]; `token` is the
/// value supplied to the get/put call that is completing. Implementations
/// receive calls from the transport's own context and must do their own
/// locking.
pub trait BusEvents: Send + Sync {
    /// Connection state of a variable changed. `count` is the element
    /// count the transport reports for the variable.
    fn connection(&self, tag: u32, connected: bool, count: usize);

    /// A monitor delivery for a variable.
    fn event(&self, tag: u32, value: Value, meta: Meta);

    /// A previously posted get completed.
    fn get_complete(&self, token: u64, status: Status, value: Option<Value>, meta: Meta);

    /// A previously posted put completed.
    fn put_complete(&self, token: u64, status: Status);
}

/// The process-variable transport.
///
/// Contract for implementations:
///
/// - handlers are never invoked from within [`var_create`] or
///   [`var_destroy`]; connection and event delivery happen from a later
///   call or another context,
/// - no internal transport lock is held across a handler invocation,
/// - every call into a handler uses the `tag` supplied at creation or the
///   `token` supplied at request time.
///
/// [`var_create`]: Bus::var_create
/// [`var_destroy`]: Bus::var_destroy
pub trait Bus: Send + Sync {
    /// Create a variable attached to the named process variable.
    fn var_create(
        &self,
        name: &str,
        events: Arc<dyn BusEvents>,
        tag: u32,
    ) -> Result<BusVarId, Error>;

    /// Destroy a variable, dropping any subscription it holds.
    fn var_destroy(&self, id: BusVarId);

    /// Subscribe (`on`) or unsubscribe (`!on`) push updates.
    fn monitor(&self, id: BusVarId, on: bool) -> Status;

    /// Post a get; completion arrives through
    /// [`BusEvents::get_complete`] with `token`.
    fn get_callback(&self, id: BusVarId, ty: Type, count: usize, token: u64) -> Status;

    /// Write a value with no completion tracking.
    fn put_no_block(&self, id: BusVarId, ty: Type, count: usize, value: &Value) -> Status;

    /// Write a value; completion arrives through
    /// [`BusEvents::put_complete`] with `token`.
    fn put_callback(&self, id: BusVarId, ty: Type, count: usize, value: &Value, token: u64)
    -> Status;

    /// Push any buffered requests out to the bus.
    fn flush(&self);
}
