//! Run-time engine for generated state-notation sequencer programs.
//!
//! A program is a set of concurrently executing state sets coordinating
//! through event flags, delays and process variables on a control bus.
//! A code generator emits the static tables and routines describing each
//! state set's automaton ([`table`]); this crate drives those automata:
//! it schedules transitions, brokers PV i/o through the [`bus`] crate,
//! enforces the safe-mode consistency model and terminates cleanly.
//!
//! Construct a [`Program`] from a [`ProgramDef`] and a [`bus::Bus`]
//! implementation, then call [`Program::run`].

pub(crate) mod macros;

pub mod table;
pub use self::table::{
    ChanDef, CompType, DEFAULT_QUEUE_SIZE, EvId, MAGIC, ProgOptions, ProgramDef, StateDef,
    StateOptions, StateSetDef, Transition, VarId,
};

mod channel;
pub use self::channel::VarInit;

pub mod events;
pub use self::events::Mask;

mod program;
pub use self::program::Program;

mod state_set;
pub use self::state_set::StateSet;

mod callbacks;
mod pv;

pub mod queue;
pub use self::queue::Ring;

pub mod registry;
pub mod sync;

pub use bus;
