//! Program construction, lifecycle and the lock-guarded shared core.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use anyhow::{Context, Result, ensure};
use bus::{Bus, BusEvents, Meta, Status, Value};
use slab::Slab;
use tracing::{debug, error, warn};

use crate::channel::{Chan, DbChan, VarInit, VarSlot};
use crate::events::Mask;
use crate::registry;
use crate::state_set::StateSet;
use crate::sync::{BinSem, Latch};
use crate::table::{
    ActionFn, DelayFn, EntryFn, EvId, EventFn, ExitFn, InitFn, MAGIC, ProgOptions, ProgramDef,
    StateOptions,
};

/// One running (or runnable) state program.
///
/// Construct with [`Program::new`], then either drive it with
/// [`Program::run`] or hand out detached state-set contexts with
/// [`Program::state_set`].
pub struct Program {
    name: String,
    options: ProgOptions,
    params: Vec<(String, String)>,
    num_ev_flags: u32,
    pub(crate) chans: Vec<Chan>,
    pub(crate) defs: Vec<SsDef>,
    pub(crate) ss: Vec<SsShared>,
    locked: Mutex<Locked>,
    die: AtomicBool,
    pub(crate) ready: Latch,
    bus: Arc<dyn Bus>,
    init: Mutex<Option<InitFn>>,
    entry: Option<EntryFn>,
    exit_fn: Option<ExitFn>,
}

/// Run-time form of one state-set definition.
pub(crate) struct SsDef {
    pub name: String,
    pub states: Vec<StateRt>,
    pub num_delays: usize,
}

/// Run-time form of one state definition.
pub(crate) struct StateRt {
    pub name: String,
    pub action: ActionFn,
    pub event: EventFn,
    pub delay: DelayFn,
    pub entry: Option<EntryFn>,
    pub exit: Option<ExitFn>,
    pub mask: Mask,
    pub options: StateOptions,
}

/// Per-state-set state shared with other threads.
pub(crate) struct SsShared {
    /// Wake semaphore; posted by flag changes, bus callbacks and exit.
    pub wake: BinSem,
    /// Index of the currently active state, read by wake-up fan-out.
    pub current_state: AtomicUsize,
    /// Per-variable get serialization; given = no get outstanding.
    pub get_sem: Vec<BinSem>,
    /// Per-variable put serialization; given = no put outstanding.
    pub put_sem: Vec<BinSem>,
}

/// Which direction a pending request moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReqOp {
    Get,
    Put,
}

/// Envelope for one outstanding get or put.
pub(crate) struct PvReq {
    pub ss: usize,
    pub var: usize,
    pub op: ReqOp,
    generation: u32,
}

/// Everything guarded by the program-wide lock.
pub(crate) struct Locked {
    /// The event flag bits.
    pub ev_flags: Mask,
    /// Flag each channel is synced to (`EvId::NONE` = none).
    pub synced_to: Vec<EvId>,
    /// Channels synced to each flag; index 0 is unused.
    pub synced: Vec<Vec<usize>>,
    /// Whether each channel is monitored.
    pub monitored: Vec<bool>,
    /// Dynamic assignment record per channel.
    pub dbch: Vec<Option<DbChan>>,
    /// Shared value buffer: the last bus-delivered value per channel.
    pub shared: Vec<VarSlot>,
    /// Per state set, which shared slots are newer than its shadow.
    pub dirty: Vec<Mask>,
    /// Outstanding get token per (state set, variable).
    pub get_req: Vec<Vec<Option<u64>>>,
    /// Outstanding put token per (state set, variable).
    pub put_req: Vec<Vec<Option<u64>>>,
    reqs: Slab<PvReq>,
    req_gen: u32,
    pub assign_count: usize,
    pub connect_count: usize,
}

impl Locked {
    /// Allocate a request envelope, returning its generation-tagged token.
    pub(crate) fn alloc_req(&mut self, ss: usize, var: usize, op: ReqOp) -> u64 {
        self.req_gen = self.req_gen.wrapping_add(1);
        let generation = self.req_gen;
        let key = self.reqs.insert(PvReq { ss, var, op, generation });
        (u64::from(generation) << 32) | key as u64
    }

    /// Remove and return the envelope for `token`, if it is still live.
    ///
    /// Stale tokens (cancelled and since recycled slots) return `None`.
    pub(crate) fn take_req(&mut self, token: u64) -> Option<PvReq> {
        let key = (token & u64::from(u32::MAX)) as usize;
        let generation = (token >> 32) as u32;

        match self.reqs.get(key) {
            Some(req) if req.generation == generation => Some(self.reqs.remove(key)),
            _ => None,
        }
    }

    /// Write `value` into a channel's shared slot, marking every state
    /// set's shadow stale when `dirty` is set.
    pub(crate) fn write_shared(
        &mut self,
        cix: usize,
        count: usize,
        mut value: Value,
        meta: Option<Meta>,
        dirty: bool,
    ) {
        value.resize(count);
        self.shared[cix].value = value;

        if let Some(meta) = meta {
            self.shared[cix].meta = meta;
        }

        if dirty {
            for mask in &mut self.dirty {
                mask.set(cix as u32);
            }
        }
    }
}

impl Program {
    /// Build a program from its generated tables.
    ///
    /// `params` is the run-time parameter string, overriding entries of
    /// the table's default parameter string.
    pub fn new(def: ProgramDef, params: &str, bus: Arc<dyn Bus>) -> Result<Arc<Self>> {
        ensure!(
            def.magic == MAGIC,
            "program {}: bad magic {:#010x}",
            def.name,
            def.magic
        );
        ensure!(!def.state_sets.is_empty(), "program {}: no state sets", def.name);

        let num_chans = def.chans.len();
        let num_ev_flags = def.num_ev_flags;

        let queued = def.chans.iter().filter(|c| c.queue_size > 0).count();
        ensure!(
            queued == def.num_queues,
            "program {}: {} queued channels but table declares {}",
            def.name,
            queued,
            def.num_queues
        );

        let mut chans = Vec::with_capacity(num_chans);
        let mut synced_to = Vec::with_capacity(num_chans);

        for (ix, chan) in def.chans.iter().enumerate() {
            ensure!(
                chan.ef_id.get() <= num_ev_flags,
                "channel {}: sync flag {} out of range",
                chan.var_name,
                chan.ef_id
            );

            let event_num = if chan.event_num != 0 {
                chan.event_num
            } else {
                num_ev_flags + 1 + ix as u32
            };

            chans.push(Chan::new(chan, event_num));
            synced_to.push(chan.ef_id);
        }

        let max_bit = chans
            .iter()
            .map(|c| c.event_num)
            .chain([num_ev_flags])
            .max()
            .unwrap_or(0);

        let mut defs = Vec::with_capacity(def.state_sets.len());

        for ss in def.state_sets {
            ensure!(
                !ss.states.is_empty(),
                "state set {}: no states",
                ss.name
            );

            let mut states = Vec::with_capacity(ss.states.len());

            for state in ss.states {
                for &bit in &state.event_mask {
                    ensure!(
                        bit <= max_bit,
                        "state {}.{}: event mask bit {} out of range",
                        ss.name,
                        state.name,
                        bit
                    );
                }

                states.push(StateRt {
                    mask: Mask::with_bits(max_bit, state.event_mask.iter().copied()),
                    name: state.name,
                    action: state.action,
                    event: state.event,
                    delay: state.delay,
                    entry: state.entry,
                    exit: state.exit,
                    options: state.options,
                });
            }

            debug!(
                ss = %ss.name,
                states = states.len(),
                delays = ss.num_delays,
                "state set"
            );

            defs.push(SsDef {
                name: ss.name,
                states,
                num_delays: ss.num_delays,
            });
        }

        let ss = defs
            .iter()
            .map(|_| SsShared {
                wake: BinSem::new(false),
                current_state: AtomicUsize::new(0),
                get_sem: (0..num_chans).map(|_| BinSem::new(true)).collect(),
                put_sem: (0..num_chans).map(|_| BinSem::new(true)).collect(),
            })
            .collect::<Vec<_>>();

        let dirty_width = num_chans.saturating_sub(1) as u32;

        let mut locked = Locked {
            ev_flags: Mask::new(max_bit),
            synced_to,
            synced: (0..=num_ev_flags as usize).map(|_| Vec::new()).collect(),
            monitored: def.chans.iter().map(|c| c.monitored).collect(),
            dbch: (0..num_chans).map(|_| None).collect(),
            shared: chans
                .iter()
                .map(|c| VarSlot::zeroed(c.ty, c.count))
                .collect(),
            dirty: (0..ss.len()).map(|_| Mask::new(dirty_width)).collect(),
            get_req: (0..ss.len()).map(|_| vec![None; num_chans]).collect(),
            put_req: (0..ss.len()).map(|_| vec![None; num_chans]).collect(),
            reqs: Slab::new(),
            req_gen: 0,
            assign_count: 0,
            connect_count: 0,
        };

        // Seed the per-flag sync lists from the channel table.
        for (cix, &ev) in locked.synced_to.iter().enumerate() {
            if !ev.is_none() {
                locked.synced[ev.index()].push(cix);
            }
        }

        let mut params_map = parse_params(&def.params);

        for (name, value) in parse_params(params) {
            match params_map.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = value,
                None => params_map.push((name, value)),
            }
        }

        Ok(Arc::new(Self {
            name: def.name,
            options: def.options,
            params: params_map,
            num_ev_flags,
            chans,
            defs,
            ss,
            locked: Mutex::new(locked),
            die: AtomicBool::new(false),
            ready: Latch::new(),
            bus,
            init: Mutex::new(def.init),
            entry: def.entry,
            exit_fn: def.exit,
        }))
    }

    /// Program name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Program option mask.
    pub fn options(&self) -> ProgOptions {
        self.options
    }

    /// Whether the program runs in safe mode.
    pub fn is_safe(&self) -> bool {
        self.options.contains(ProgOptions::SAFE)
    }

    /// Number of event flags.
    pub fn num_ev_flags(&self) -> u32 {
        self.num_ev_flags
    }

    /// Look up a program parameter by name.
    pub fn mac_value(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub(crate) fn locked(&self) -> MutexGuard<'_, Locked> {
        self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn assert_ev_flag(&self, ev: EvId) {
        assert!(
            !ev.is_none() && ev.get() <= self.num_ev_flags,
            "event flag {} out of range 1..={}",
            ev,
            self.num_ev_flags
        );
    }

    /// Whether the program has been asked to terminate.
    pub fn dying(&self) -> bool {
        self.die.load(Ordering::Acquire)
    }

    /// Ask every state set to terminate and unblock all sleepers.
    ///
    /// The state sets observe the request between scheduler iterations;
    /// [`Program::run`] then runs the global exit block and tears the
    /// program down.
    pub fn request_exit(&self) {
        self.die.store(true, Ordering::Release);
        // Take care that we die even while waiting for initial connects.
        self.ready.open();
        self.wakeup(0);
    }

    /// Wake every state set whose current state waits on `bit`; bit 0
    /// wakes everyone.
    pub(crate) fn wakeup(&self, bit: u32) {
        for (ix, ss) in self.ss.iter().enumerate() {
            if bit == 0 {
                ss.wake.give();
                continue;
            }

            let cur = ss.current_state.load(Ordering::Acquire);

            if self.defs[ix].states.get(cur).is_some_and(|st| st.mask.test(bit)) {
                ss.wake.give();
            }
        }
    }

    /// Detached context for driving one state set manually.
    ///
    /// A running program owns one context per state set; use this for
    /// diagnostics and tests only, never concurrently with [`Program::run`]
    /// on the same state set.
    pub fn state_set(self: &Arc<Self>, ix: usize) -> StateSet {
        StateSet::new(self.clone(), ix)
    }

    /// Run the program to completion.
    ///
    /// Registers the program, seeds variables, assigns named channels,
    /// waits for connections when the CONN option is set, runs the global
    /// entry block, then one thread per state set until every state set
    /// has terminated, the global exit block, and transport teardown.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        if let Some(init) = self.init.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let mut lk = self.locked();
            let Locked { ref mut shared, .. } = *lk;
            init(&mut VarInit::new(&self.chans, shared));
        }

        for cix in 0..self.chans.len() {
            if !self.chans[cix].pv_name.is_empty() {
                let name = self.chans[cix].pv_name.clone();
                let status = self.assign_chan(cix, &name);

                if !status.is_ok() {
                    warn!(
                        var = %self.chans[cix].var_name,
                        pv = %name,
                        "initial assignment failed"
                    );
                }
            }
        }

        if self.options.contains(ProgOptions::CONN) {
            let gated = {
                let lk = self.locked();
                lk.assign_count > 0 && lk.connect_count < lk.assign_count
            };

            if gated && !self.dying() {
                debug!(prog = %self.name, "waiting for connections");
                self.ready.wait();
            }
        }

        let mut first = StateSet::new(self.clone(), 0);

        if let Some(entry) = &self.entry {
            if !self.dying() {
                entry(&mut first);
            }
        }

        let mut first = Some(first);
        let mut threads = Vec::with_capacity(self.defs.len());

        for ix in 0..self.defs.len() {
            let ss = match (ix, first.take()) {
                (0, Some(first)) => first,
                _ => StateSet::new(self.clone(), ix),
            };

            let thread = thread::Builder::new()
                .name(format!("{}:{}", self.name, self.defs[ix].name))
                .spawn(move || ss.run())
                .with_context(|| format!("spawning state set {}", self.defs[ix].name))?;

            threads.push(thread);
        }

        registry::register(self, threads[0].thread().id());

        for thread in threads {
            if thread.join().is_err() {
                error!(prog = %self.name, "state set thread panicked");
            }
        }

        if let Some(exit) = &self.exit_fn {
            let mut ss = StateSet::new(self.clone(), 0);
            exit(&mut ss);
        }

        self.teardown();
        registry::unregister(self);
        Ok(())
    }

    /// Bind channel `cix` to the named PV, releasing any prior binding.
    /// An empty name leaves the channel unassigned.
    pub(crate) fn assign_chan(self: &Arc<Self>, cix: usize, name: &str) -> Status {
        let chan = &self.chans[cix];
        let mut lk = self.locked();

        if let Some(db) = lk.dbch[cix].take() {
            debug!(var = %chan.var_name, pv = %db.name, "releasing assignment");
            self.bus.var_destroy(db.id);
            lk.assign_count -= 1;

            if db.connected {
                lk.connect_count -= 1;
            }
        }

        if name.is_empty() {
            return Status::Ok;
        }

        let events: Arc<dyn BusEvents> = self.clone();

        match self.bus.var_create(name, events, cix as u32) {
            Ok(id) => {
                lk.dbch[cix] = Some(DbChan {
                    id,
                    name: name.to_owned(),
                    count: chan.count,
                    connected: false,
                });
                lk.assign_count += 1;
                Status::Ok
            }
            Err(error) => {
                error!(
                    var = %chan.var_name,
                    pv = name,
                    %error,
                    "pvAssign: varCreate failure"
                );
                Status::Error
            }
        }
    }

    fn teardown(&self) {
        let mut lk = self.locked();

        for cix in 0..self.chans.len() {
            if let Some(db) = lk.dbch[cix].take() {
                self.bus.var_destroy(db.id);
                lk.assign_count -= 1;

                if db.connected {
                    lk.connect_count -= 1;
                }
            }
        }
    }
}

fn parse_params(params: &str) -> Vec<(String, String)> {
    params
        .split(',')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let name = name.trim();

            if name.is_empty() {
                return None;
            }

            Some((name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}
