//! Per-state-set scheduler and façade context.
//!
//! One `StateSet` is the context a generated routine receives: it owns
//! the scheduler-local state (current state, timers) and, in safe mode,
//! the private shadow of variable values. All façade operations hang off
//! it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bus::{Severity, Status, Value};
use tracing::debug;

use crate::channel::VarSlot;
use crate::program::{Locked, Program};
use crate::table::{EvId, ProgOptions, StateOptions, VarId};

pub struct StateSet {
    prog: Arc<Program>,
    ix: usize,
    pub(crate) current_state: usize,
    prev_state: Option<usize>,
    pub(crate) time_entered: Instant,
    pub(crate) wakeup_time: Option<Instant>,
    /// Safe-mode shadow of the shared buffer; empty otherwise.
    pub(crate) vars: Vec<VarSlot>,
}

impl StateSet {
    pub(crate) fn new(prog: Arc<Program>, ix: usize) -> Self {
        assert!(ix < prog.defs.len(), "state set index {ix} out of range");

        let vars = if prog.is_safe() {
            prog.locked().shared.clone()
        } else {
            Vec::new()
        };

        Self {
            prog,
            ix,
            current_state: 0,
            prev_state: None,
            time_entered: Instant::now(),
            wakeup_time: None,
            vars,
        }
    }

    /// Index of this state set within the program.
    pub fn index(&self) -> usize {
        self.ix
    }

    /// Name of this state set.
    pub fn name(&self) -> &str {
        &self.prog.defs[self.ix].name
    }

    /// The owning program.
    pub fn program(&self) -> &Arc<Program> {
        &self.prog
    }

    /// This state set's view of a variable's value.
    ///
    /// In safe mode this reads the private shadow; otherwise it reads the
    /// shared buffer under the program lock.
    pub fn var(&self, v: VarId) -> Value {
        let cix = v.index();

        if self.prog.is_safe() {
            self.vars[cix].value.clone()
        } else {
            self.prog.locked().shared[cix].value.clone()
        }
    }

    /// Write this state set's view of a variable's value.
    ///
    /// The value is resized to the channel's declared count; its type
    /// must match the channel's declared type.
    pub fn set_var(&mut self, v: VarId, mut value: Value) {
        let cix = v.index();
        let (ty, count) = {
            let chan = &self.prog.chans[cix];
            (chan.ty, chan.count)
        };

        assert_eq!(
            value.ty(),
            ty,
            "value for variable {} has the wrong element type",
            v
        );

        value.resize(count);

        if self.prog.is_safe() {
            self.vars[cix].value = value;
        } else {
            self.prog.locked().shared[cix].value = value;
        }
    }

    /// Test whether `seconds` have elapsed since the state was entered.
    ///
    /// As a side effect, refines the next wake-up time when the delay has
    /// not yet expired.
    pub fn delay(&mut self, seconds: f64) -> bool {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        let expires = self.time_entered + Duration::from_secs_f64(seconds);

        if expires <= Instant::now() {
            return true;
        }

        self.wakeup_time = Some(match self.wakeup_time {
            Some(at) if at <= expires => at,
            _ => expires,
        });

        false
    }

    /// Ask the whole program to terminate.
    pub fn exit(&self) {
        self.prog.request_exit();
    }

    /// Query a program option by its option letter.
    pub fn opt_get(&self, opt: &str) -> bool {
        let options = self.prog.options();

        match opt.chars().next() {
            Some('a') => options.contains(ProgOptions::ASYNC),
            Some('c') => options.contains(ProgOptions::CONN),
            Some('d') => options.contains(ProgOptions::DEBUG),
            Some('e') => options.contains(ProgOptions::NEWEF),
            Some('r') => options.contains(ProgOptions::REENT),
            Some('s') => options.contains(ProgOptions::SAFE),
            _ => false,
        }
    }

    /// Look up a program parameter by name.
    pub fn mac_value_get(&self, name: &str) -> Option<&str> {
        self.prog.mac_value(name)
    }

    /// Copy a variable's shared slot into this state set's shadow,
    /// clearing its dirty bit. Safe mode only.
    pub(crate) fn read_var(&mut self, lk: &mut Locked, cix: usize) {
        self.vars[cix] = lk.shared[cix].clone();
        lk.dirty[self.ix].clear(cix as u32);
    }

    /// Copy every dirty variable synced to `ev` from the shared buffer
    /// into this state set's shadow. Safe mode only.
    pub(crate) fn read_selective(&mut self, lk: &mut Locked, ev: EvId) {
        for i in 0..lk.synced[ev.index()].len() {
            let cix = lk.synced[ev.index()][i];

            if lk.dirty[self.ix].test(cix as u32) {
                self.vars[cix] = lk.shared[cix].clone();
                lk.dirty[self.ix].clear(cix as u32);
            }
        }
    }

    /// Write status/severity/message into this state set's meta view of a
    /// variable.
    pub(crate) fn set_meta(
        &mut self,
        lk: &mut Locked,
        cix: usize,
        status: Status,
        severity: Severity,
        message: &'static str,
    ) {
        let meta = if self.prog.is_safe() {
            &mut self.vars[cix].meta
        } else {
            &mut lk.shared[cix].meta
        };

        meta.status = status;
        meta.severity = severity;
        meta.message = message;
    }

    /// The cooperative scheduler loop: run until the program dies.
    pub(crate) fn run(mut self) {
        let prog = self.prog.clone();
        let def = &prog.defs[self.ix];
        let shared = &prog.ss[self.ix];

        self.current_state = 0;
        self.prev_state = None;
        self.time_entered = Instant::now();
        shared.current_state.store(0, Ordering::Release);

        debug!(ss = %def.name, delays = def.num_delays, "starting");

        'run: while !prog.dying() {
            let state = &def.states[self.current_state];

            if self.prev_state != Some(self.current_state)
                || state.options.contains(StateOptions::DOENTRYFROMSELF)
            {
                if let Some(entry) = &state.entry {
                    entry(&mut self);
                }
            }

            let trans = loop {
                if prog.dying() {
                    break 'run;
                }

                self.wakeup_time = None;
                (state.delay)(&mut self);

                if let Some(trans) = (state.event)(&mut self) {
                    break trans;
                }

                let timeout = self
                    .wakeup_time
                    .map(|at| at.saturating_duration_since(Instant::now()));
                shared.wake.take_timeout(timeout);
            };

            assert!(
                trans.next_state < def.states.len(),
                "state set {}: transition to state {} out of range",
                def.name,
                trans.next_state
            );

            let to_self = trans.next_state == self.current_state;

            if !to_self || state.options.contains(StateOptions::DOEXITTOSELF) {
                if let Some(exit) = &state.exit {
                    exit(&mut self);
                }
            }

            let mut next = trans.next_state;
            (state.action)(&mut self, trans.trans_num, &mut next);

            assert!(
                next < def.states.len(),
                "state set {}: action rewrote next state to {} out of range",
                def.name,
                next
            );

            debug!(
                ss = %def.name,
                from = %state.name,
                to = %def.states[next].name,
                trans = trans.trans_num,
                "transition"
            );

            let to_self = next == self.current_state;
            self.prev_state = Some(self.current_state);
            self.current_state = next;
            shared.current_state.store(next, Ordering::Release);

            if !(to_self && def.states[next].options.contains(StateOptions::NORESETTIMERS)) {
                self.time_entered = Instant::now();
            }
        }

        debug!(ss = %def.name, "terminating");
    }
}
