//! Static program tables emitted by the code generator.
//!
//! A generated program hands the engine one [`ProgramDef`] describing its
//! channels, state sets and routines. The shapes here mirror the tables a
//! generator produces: everything the engine needs to drive the program
//! is data, and the generated routines are opaque callouts.

use core::fmt;

use bus::Type;

use crate::channel::VarInit;
use crate::macros::flags;
use crate::state_set::StateSet;

/// Magic number stamped into generated program tables.
pub const MAGIC: u32 = u32::from_be_bytes(*b"SEQ1");

/// Queue capacity used when a channel is declared queued without an
/// explicit size.
pub const DEFAULT_QUEUE_SIZE: usize = 100;

macro_rules! id {
    (
        $(
            $(#[$($meta:meta)*])*
            $vis:vis struct $name:ident;
        )*
    ) => {
        $(
            $(#[$($meta)*])*
            #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            #[repr(transparent)]
            pub struct $name(u32);

            impl $name {
                #[doc = concat!(" Create a new `", stringify!($name), "` from a `u32`.")]
                #[inline]
                pub const fn new(id: u32) -> Self {
                    Self(id)
                }

                #[doc = concat!(" The raw value of the `", stringify!($name), "`.")]
                #[inline]
                pub const fn get(self) -> u32 {
                    self.0
                }

                #[doc = concat!(" The index form of the `", stringify!($name), "`.")]
                #[inline]
                pub const fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl fmt::Display for $name {
                #[inline]
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }

            impl fmt::Debug for $name {
                #[inline]
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }
        )*
    }
}

id! {
    /// Identifier of a program variable: an index into the channel table.
    pub struct VarId;

    /// Identifier of an event flag. Zero means "no flag".
    pub struct EvId;
}

impl VarId {
    /// The variable `n` places after this one, for array operations.
    #[inline]
    pub const fn offset(self, n: usize) -> Self {
        Self(self.0 + n as u32)
    }
}

impl EvId {
    /// The "no flag" id, used to remove a sync binding.
    pub const NONE: Self = Self(0);

    /// Whether this is the "no flag" id.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

flags! {
    /// Program-wide option mask.
    pub struct ProgOptions(u32) {
        /// Turn on run-time debug traces.
        const DEBUG = 1 << 0;
        /// Unqualified gets resolve to asynchronous completion.
        const ASYNC = 1 << 1;
        /// Wait for all assigned channels to connect before running.
        const CONN = 1 << 2;
        /// Reentrant variable area; a code-generator concern.
        const REENT = 1 << 3;
        /// New event-flag mode; a code-generator concern.
        const NEWEF = 1 << 4;
        /// A main program was generated; a code-generator concern.
        const MAIN = 1 << 5;
        /// Safe mode: every state set observes a private shadow of
        /// variable values, updated only at explicit observation points.
        const SAFE = 1 << 6;
    }

    /// Per-state option mask.
    pub struct StateOptions(u32) {
        /// Do not reset timers on entry to the state from itself.
        const NORESETTIMERS = 1 << 0;
        /// Run the entry block even when entering from the same state.
        const DOENTRYFROMSELF = 1 << 1;
        /// Run the exit block even when exiting to the same state.
        const DOEXITTOSELF = 1 << 2;
    }
}

/// Completion mode for get and put requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompType {
    /// Resolve per program options: gets become [`Async`] when the ASYNC
    /// option is set and [`Sync`] otherwise; puts become non-blocking
    /// with no completion tracking.
    ///
    /// [`Async`]: CompType::Async
    /// [`Sync`]: CompType::Sync
    #[default]
    Default,
    /// Post the request and return; completion is observed separately.
    Async,
    /// Post the request and wait for completion.
    Sync,
}

/// Transition selected by a state's event routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Index of the destination state within the state set.
    pub next_state: usize,
    /// Number of the transition clause that fired.
    pub trans_num: usize,
}

pub type ActionFn = Box<dyn Fn(&mut StateSet, usize, &mut usize) + Send + Sync>;
pub type EventFn = Box<dyn Fn(&mut StateSet) -> Option<Transition> + Send + Sync>;
pub type DelayFn = Box<dyn Fn(&mut StateSet) + Send + Sync>;
pub type EntryFn = Box<dyn Fn(&mut StateSet) + Send + Sync>;
pub type ExitFn = Box<dyn Fn(&mut StateSet) + Send + Sync>;
pub type InitFn = Box<dyn Fn(&mut VarInit<'_>) + Send + Sync>;

/// Static description of one channel.
pub struct ChanDef {
    /// Process variable name to assign at startup; empty starts the
    /// channel unassigned.
    pub pv_name: String,
    /// Variable name, including subscripts, for diagnostics.
    pub var_name: String,
    /// Element type.
    pub ty: Type,
    /// Declared element count (1 = scalar).
    pub count: usize,
    /// Event number tested against state event masks on wake-up. Zero
    /// lets the engine assign the conventional number at construction.
    pub event_num: u32,
    /// Event flag the channel starts synced to.
    pub ef_id: EvId,
    /// Whether the channel starts monitored.
    pub monitored: bool,
    /// Queue capacity (0 = not queued).
    pub queue_size: usize,
}

impl ChanDef {
    /// A scalar, unassigned, unmonitored channel.
    pub fn new(var_name: impl Into<String>, ty: Type) -> Self {
        Self {
            pv_name: String::new(),
            var_name: var_name.into(),
            ty,
            count: 1,
            event_num: 0,
            ef_id: EvId::NONE,
            monitored: false,
            queue_size: 0,
        }
    }

    /// Assign the channel to `pv_name` at startup.
    pub fn named(mut self, pv_name: impl Into<String>) -> Self {
        self.pv_name = pv_name.into();
        self
    }

    /// Declare `count` elements.
    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Start the channel monitored.
    pub fn monitored(mut self) -> Self {
        self.monitored = true;
        self
    }

    /// Sync the channel to an event flag.
    pub fn synced(mut self, ef_id: EvId) -> Self {
        self.ef_id = ef_id;
        self
    }

    /// Queue incoming values with the default capacity.
    pub fn queued(self) -> Self {
        self.queued_with(DEFAULT_QUEUE_SIZE)
    }

    /// Queue incoming values with the given capacity.
    pub fn queued_with(mut self, capacity: usize) -> Self {
        self.queue_size = capacity;
        self
    }
}

/// Static description of one state.
pub struct StateDef {
    /// State name.
    pub name: String,
    /// Action routine, run after a transition is selected.
    pub action: ActionFn,
    /// Event routine, evaluates transition guards.
    pub event: EventFn,
    /// Delay routine, registers delay checkpoints.
    pub delay: DelayFn,
    /// Statements performed on entry to the state.
    pub entry: Option<EntryFn>,
    /// Statements performed on exit from the state.
    pub exit: Option<ExitFn>,
    /// Event numbers and flag ids that wake the state.
    pub event_mask: Vec<u32>,
    /// State option mask.
    pub options: StateOptions,
}

impl StateDef {
    /// A state with no transitions and no wake-up interests.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: Box::new(|_, _, _| {}),
            event: Box::new(|_| None),
            delay: Box::new(|_| {}),
            entry: None,
            exit: None,
            event_mask: Vec::new(),
            options: StateOptions::NONE,
        }
    }

    /// Set the event routine.
    pub fn event(mut self, event: impl Fn(&mut StateSet) -> Option<Transition> + Send + Sync + 'static) -> Self {
        self.event = Box::new(event);
        self
    }

    /// Set the action routine.
    pub fn action(mut self, action: impl Fn(&mut StateSet, usize, &mut usize) + Send + Sync + 'static) -> Self {
        self.action = Box::new(action);
        self
    }

    /// Set the delay routine.
    pub fn delay(mut self, delay: impl Fn(&mut StateSet) + Send + Sync + 'static) -> Self {
        self.delay = Box::new(delay);
        self
    }

    /// Set the entry block.
    pub fn entry(mut self, entry: impl Fn(&mut StateSet) + Send + Sync + 'static) -> Self {
        self.entry = Some(Box::new(entry));
        self
    }

    /// Set the exit block.
    pub fn exit(mut self, exit: impl Fn(&mut StateSet) + Send + Sync + 'static) -> Self {
        self.exit = Some(Box::new(exit));
        self
    }

    /// Set the wake-up interest mask.
    pub fn mask(mut self, bits: impl IntoIterator<Item = u32>) -> Self {
        self.event_mask = bits.into_iter().collect();
        self
    }

    /// Set the state options.
    pub fn options(mut self, options: StateOptions) -> Self {
        self.options = options;
        self
    }
}

/// Static description of one state set.
pub struct StateSetDef {
    /// State set name.
    pub name: String,
    /// States, entered at index zero.
    pub states: Vec<StateDef>,
    /// Number of distinct delays the state set uses.
    pub num_delays: usize,
}

impl StateSetDef {
    /// An empty state set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            num_delays: 0,
        }
    }

    /// Append a state.
    pub fn state(mut self, state: StateDef) -> Self {
        self.states.push(state);
        self
    }

    /// Record the number of distinct delays.
    pub fn delays(mut self, num_delays: usize) -> Self {
        self.num_delays = num_delays;
        self
    }
}

/// Static description of one program.
pub struct ProgramDef {
    /// Magic number; must equal [`MAGIC`].
    pub magic: u32,
    /// Program name.
    pub name: String,
    /// Channel table.
    pub chans: Vec<ChanDef>,
    /// State set table.
    pub state_sets: Vec<StateSetDef>,
    /// Default program parameters, `"name=value,name=value"`.
    pub params: String,
    /// Number of event flags.
    pub num_ev_flags: u32,
    /// Program option mask.
    pub options: ProgOptions,
    /// Variable initialization routine.
    pub init: Option<InitFn>,
    /// Global entry block, run on the first state set before any state
    /// set starts.
    pub entry: Option<EntryFn>,
    /// Global exit block, run on the first state set after every state
    /// set has terminated.
    pub exit: Option<ExitFn>,
    /// Number of queued channels.
    pub num_queues: usize,
}

impl ProgramDef {
    /// An empty program definition carrying the current magic number.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            magic: MAGIC,
            name: name.into(),
            chans: Vec::new(),
            state_sets: Vec::new(),
            params: String::new(),
            num_ev_flags: 0,
            options: ProgOptions::NONE,
            init: None,
            entry: None,
            exit: None,
            num_queues: 0,
        }
    }

    /// Append a channel, keeping the queue count in step.
    pub fn chan(mut self, chan: ChanDef) -> Self {
        if chan.queue_size > 0 {
            self.num_queues += 1;
        }

        self.chans.push(chan);
        self
    }

    /// Append a state set.
    pub fn state_set(mut self, ss: StateSetDef) -> Self {
        self.state_sets.push(ss);
        self
    }

    /// Set the number of event flags.
    pub fn ev_flags(mut self, num_ev_flags: u32) -> Self {
        self.num_ev_flags = num_ev_flags;
        self
    }

    /// Set the default parameter string.
    pub fn params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    /// Set the program options.
    pub fn options(mut self, options: ProgOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the variable initialization routine.
    pub fn init(mut self, init: impl Fn(&mut VarInit<'_>) + Send + Sync + 'static) -> Self {
        self.init = Some(Box::new(init));
        self
    }

    /// Set the global entry block.
    pub fn entry(mut self, entry: impl Fn(&mut StateSet) + Send + Sync + 'static) -> Self {
        self.entry = Some(Box::new(entry));
        self
    }

    /// Set the global exit block.
    pub fn exit(mut self, exit: impl Fn(&mut StateSet) + Send + Sync + 'static) -> Self {
        self.exit = Some(Box::new(exit));
        self
    }
}
