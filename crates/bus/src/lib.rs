//! Callback-shaped interface to the process-variable transport.
//!
//! The run-time engine talks to the control bus exclusively through the
//! [`Bus`] trait: variables are created with a connection/event sink, gets
//! and puts are posted with a completion token, and the transport calls
//! back into the sink from its own context. [`mem::MemBus`] is an
//! in-memory implementation used by the test suite and by programs whose
//! variables are all anonymous.

pub(crate) mod error;
pub use self::error::Error;

mod types;
pub use self::types::{Meta, Severity, Status, Type, Value};

mod bus;
pub use self::bus::{Bus, BusEvents, BusVarId};

pub mod mem;
