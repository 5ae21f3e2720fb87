//! The PV request broker: get/put with completion modes, completion
//! tests and cancels, assignment, monitors, sync bindings and queued
//! channels.

use std::time::{Duration, Instant, SystemTime};

use bus::{Severity, Status};
use tracing::{debug, error, warn};

use crate::channel::{QEntry, lock_queue};
use crate::program::{Locked, ReqOp};
use crate::state_set::StateSet;
use crate::table::{CompType, EvId, ProgOptions, VarId};

/// Clamp a remaining timeout to at least one millisecond.
fn remaining(tmo: f64, before: Instant) -> f64 {
    let tmo = tmo - before.elapsed().as_secs_f64();
    if tmo <= 0.0 { 0.001 } else { tmo }
}

impl StateSet {
    fn check_connected(&mut self, lk: &mut Locked, cix: usize) -> Status {
        if lk.dbch[cix].as_ref().is_some_and(|db| db.connected) {
            Status::Ok
        } else {
            self.set_meta(lk, cix, Status::Disconn, Severity::Invalid, "disconnected");
            Status::Disconn
        }
    }

    /// Get a variable's value from its PV.
    ///
    /// `Sync` waits up to `tmo` seconds for completion; `Async` posts the
    /// request and returns, with completion observed through
    /// [`pv_get_complete`]; `Default` resolves to one of the two per the
    /// program's ASYNC option. In safe mode an anonymous variable is
    /// simply copied from the shared buffer.
    ///
    /// [`pv_get_complete`]: StateSet::pv_get_complete
    pub fn pv_get(&mut self, v: VarId, mode: CompType, tmo: f64) -> Status {
        let prog = self.program().clone();
        let cix = v.index();
        let ix = self.index();

        {
            let mut lk = prog.locked();

            if lk.dbch[cix].is_none() {
                if prog.is_safe() {
                    // Anonymous PV: completion is immediate, so there is
                    // no distinction between SYNC and ASYNC.
                    self.read_var(&mut lk, cix);
                    return Status::Ok;
                }

                error!(
                    var = %prog.chans[cix].var_name,
                    "pvGet: user error (variable not assigned)"
                );
                return Status::Error;
            }
        }

        let mode = match mode {
            CompType::Default if prog.options().contains(ProgOptions::ASYNC) => CompType::Async,
            CompType::Default => CompType::Sync,
            other => other,
        };

        let get_sem = &prog.ss[ix].get_sem[cix];
        let mut tmo = tmo;

        match mode {
            CompType::Sync => {
                if tmo <= 0.0 {
                    error!(
                        var = %prog.chans[cix].var_name,
                        tmo,
                        "pvGet(SYNC): user error (timeout must be positive)"
                    );
                    return Status::Error;
                }

                let before = Instant::now();

                if !get_sem.take_timeout(Some(Duration::from_secs_f64(tmo))) {
                    error!(
                        ss = self.name(),
                        var = %prog.chans[cix].var_name,
                        "pvGet: failed (timeout waiting for other get requests to finish)"
                    );
                    return Status::Error;
                }

                {
                    let mut lk = prog.locked();
                    // A previous request may have timed out without the
                    // user ever testing completion.
                    lk.get_req[ix][cix] = None;
                    let status = self.check_connected(&mut lk, cix);

                    if !status.is_ok() {
                        drop(lk);
                        get_sem.give();
                        return status;
                    }
                }

                tmo = remaining(tmo, before);
            }
            CompType::Async => {
                if !get_sem.try_take() {
                    error!(
                        ss = self.name(),
                        var = %prog.chans[cix].var_name,
                        "pvGet: user error (there is already a get pending for this \
                         variable/state set combination)"
                    );
                    return Status::Error;
                }

                let mut lk = prog.locked();
                lk.get_req[ix][cix] = None;
                let status = self.check_connected(&mut lk, cix);

                if !status.is_ok() {
                    drop(lk);
                    get_sem.give();
                    return status;
                }
            }
            CompType::Default => unreachable!(),
        }

        // Allocate a request and post the get. Requesting more elements
        // than the transport reports is allowed.
        let issue = {
            let mut lk = prog.locked();

            match lk.dbch[cix].as_ref().map(|db| db.id) {
                Some(id) => {
                    let token = lk.alloc_req(ix, cix, ReqOp::Get);
                    lk.get_req[ix][cix] = Some(token);
                    Some((token, id))
                }
                None => None,
            }
        };

        let Some((token, id)) = issue else {
            // Unassigned while we were acquiring; recover.
            get_sem.give();
            error!(
                var = %prog.chans[cix].var_name,
                "pvGet: user error (variable not assigned)"
            );
            return Status::Error;
        };

        let chan = &prog.chans[cix];
        let status = prog.bus().get_callback(id, chan.ty, chan.count, token);

        if !status.is_ok() {
            let mut lk = prog.locked();
            lk.get_req[ix][cix] = None;
            lk.take_req(token);
            self.set_meta(&mut lk, cix, Status::Error, Severity::Major, "get failure");
            let _ = self.check_connected(&mut lk, cix);
            drop(lk);
            get_sem.give();
            error!(
                var = %chan.var_name,
                ?status,
                "pvGet: varGetCallback failure"
            );
            return status;
        }

        if mode == CompType::Sync {
            prog.bus().flush();
            let completed = get_sem.take_timeout(Some(Duration::from_secs_f64(tmo)));

            let mut lk = prog.locked();
            lk.get_req[ix][cix] = None;

            if !completed {
                self.set_meta(&mut lk, cix, Status::Timeout, Severity::Major, "get completion timeout");
                drop(lk);
                get_sem.give();
                return Status::Timeout;
            }

            let status = self.check_connected(&mut lk, cix);

            if !status.is_ok() {
                drop(lk);
                get_sem.give();
                return status;
            }

            if prog.is_safe() {
                self.read_var(&mut lk, cix);
            }

            drop(lk);
            get_sem.give();
        }

        Status::Ok
    }

    /// Return whether pending gets on `length` consecutive variables
    /// starting at `v` have completed.
    ///
    /// With `any` set, returns whether any completed (short-circuiting
    /// when `complete` is not supplied); otherwise whether all did.
    /// `complete`, when supplied, receives the per-variable answers. In
    /// safe mode a completed get is an observation point for its
    /// variable.
    pub fn pv_get_complete(
        &mut self,
        v: VarId,
        length: usize,
        any: bool,
        mut complete: Option<&mut [bool]>,
    ) -> bool {
        let prog = self.program().clone();
        let ix = self.index();

        let mut any_done = false;
        let mut all_done = true;

        for n in 0..length {
            let cix = v.index() + n;
            let mut lk = prog.locked();

            let done = if lk.dbch[cix].is_none() {
                // Anonymous PVs always complete immediately.
                if !prog.is_safe() {
                    error!(
                        var = %prog.chans[cix].var_name,
                        "pvGetComplete: user error (variable not assigned)"
                    );
                }

                true
            } else if lk.get_req[ix][cix].is_none() {
                warn!(
                    var = %prog.chans[cix].var_name,
                    "pvGetComplete: no pending get request for this variable"
                );
                false
            } else if prog.ss[ix].get_sem[cix].try_take() {
                lk.get_req[ix][cix] = None;
                let status = self.check_connected(&mut lk, cix);

                if status.is_ok() && prog.is_safe() {
                    self.read_var(&mut lk, cix);
                }

                drop(lk);
                prog.ss[ix].get_sem[cix].give();
                true
            } else {
                false
            };

            any_done = any_done || done;
            all_done = all_done && done;

            if let Some(out) = complete.as_deref_mut() {
                out[n] = done;
            } else if any && done {
                break;
            }
        }

        debug!(v = %v, length, any_done, all_done, "pvGetComplete");

        if any { any_done } else { all_done }
    }

    /// Cancel pending gets on `length` consecutive variables starting at
    /// `v`. A completion arriving later finds no recorded request and is
    /// dropped.
    pub fn pv_get_cancel(&mut self, v: VarId, length: usize) {
        let prog = self.program().clone();
        let ix = self.index();

        for n in 0..length {
            let cix = v.index() + n;
            let mut lk = prog.locked();

            if lk.dbch[cix].is_none() {
                if !prog.is_safe() {
                    warn!(
                        var = %prog.chans[cix].var_name,
                        "pvGetCancel: user error (variable not assigned)"
                    );
                }
            } else {
                lk.get_req[ix][cix] = None;
                drop(lk);
                prog.ss[ix].get_sem[cix].give();
            }
        }
    }

    /// Put this state set's value of a variable to its PV.
    ///
    /// `Default` issues a non-blocking put with no completion tracking;
    /// `Sync`/`Async` mirror [`pv_get`]. In safe mode an anonymous
    /// variable is written to the shared buffer or its queue, its synced
    /// flag is set, and listeners of its event number are woken.
    ///
    /// [`pv_get`]: StateSet::pv_get
    pub fn pv_put(&mut self, v: VarId, mode: CompType, tmo: f64) -> Status {
        let prog = self.program().clone();
        let cix = v.index();
        let ix = self.index();

        {
            let lk = prog.locked();

            if lk.dbch[cix].is_none() {
                drop(lk);

                if prog.is_safe() {
                    self.anonymous_put(cix);
                    return Status::Ok;
                }

                error!(
                    var = %prog.chans[cix].var_name,
                    "pvPut: user error (variable not assigned)"
                );
                return Status::Error;
            }
        }

        {
            let mut lk = prog.locked();
            let status = self.check_connected(&mut lk, cix);

            if !status.is_ok() {
                return status;
            }
        }

        let put_sem = &prog.ss[ix].put_sem[cix];
        let mut tmo = tmo;

        match mode {
            CompType::Sync => {
                if tmo <= 0.0 {
                    error!(
                        var = %prog.chans[cix].var_name,
                        tmo,
                        "pvPut(SYNC): user error (timeout must be positive)"
                    );
                    return Status::Error;
                }

                let before = Instant::now();

                if !put_sem.take_timeout(Some(Duration::from_secs_f64(tmo))) {
                    error!(
                        ss = self.name(),
                        var = %prog.chans[cix].var_name,
                        "pvPut: failed (timeout waiting for other put requests to finish)"
                    );
                    return Status::Error;
                }

                let mut lk = prog.locked();
                lk.put_req[ix][cix] = None;
                drop(lk);

                tmo = remaining(tmo, before);
            }
            CompType::Async => {
                if !put_sem.try_take() {
                    let mut lk = prog.locked();
                    self.set_meta(&mut lk, cix, Status::Error, Severity::Major, "already one put pending");
                    drop(lk);
                    error!(
                        ss = self.name(),
                        var = %prog.chans[cix].var_name,
                        "pvPut: user error (there is already a put pending for this \
                         variable/state set combination)"
                    );
                    return Status::Error;
                }

                let mut lk = prog.locked();
                lk.put_req[ix][cix] = None;
            }
            CompType::Default => {}
        }

        // Snapshot the value and put no more elements than the transport
        // reports.
        let issue = {
            let lk = prog.locked();

            match lk.dbch[cix].as_ref() {
                Some(db) => {
                    let count = db.count.min(prog.chans[cix].count);
                    let mut value = if prog.is_safe() {
                        self.vars[cix].value.clone()
                    } else {
                        lk.shared[cix].value.clone()
                    };
                    value.resize(count);
                    Some((db.id, count, value))
                }
                None => None,
            }
        };

        let Some((id, count, value)) = issue else {
            if mode != CompType::Default {
                put_sem.give();
            }

            error!(
                var = %prog.chans[cix].var_name,
                "pvPut: user error (variable not assigned)"
            );
            return Status::Error;
        };

        let chan = &prog.chans[cix];

        if mode == CompType::Default {
            let status = prog.bus().put_no_block(id, chan.ty, count, &value);

            if !status.is_ok() {
                error!(var = %chan.var_name, ?status, "pvPut: varPutNoBlock failure");
                return status;
            }

            return Status::Ok;
        }

        let token = {
            let mut lk = prog.locked();
            let token = lk.alloc_req(ix, cix, ReqOp::Put);
            lk.put_req[ix][cix] = Some(token);
            token
        };

        let status = prog.bus().put_callback(id, chan.ty, count, &value, token);

        if !status.is_ok() {
            let mut lk = prog.locked();
            lk.put_req[ix][cix] = None;
            lk.take_req(token);
            let _ = self.check_connected(&mut lk, cix);
            drop(lk);
            put_sem.give();
            error!(var = %chan.var_name, ?status, "pvPut: varPutCallback failure");
            return status;
        }

        if mode == CompType::Sync {
            prog.bus().flush();
            let completed = put_sem.take_timeout(Some(Duration::from_secs_f64(tmo)));

            let mut lk = prog.locked();
            lk.put_req[ix][cix] = None;

            if !completed {
                self.set_meta(&mut lk, cix, Status::Timeout, Severity::Major, "put completion timeout");
                drop(lk);
                put_sem.give();
                return Status::Timeout;
            }

            let status = self.check_connected(&mut lk, cix);
            drop(lk);
            put_sem.give();

            if !status.is_ok() {
                return status;
            }
        }

        Status::Ok
    }

    /// Return whether pending puts on `length` consecutive variables
    /// starting at `v` have completed. Mirrors [`pv_get_complete`].
    ///
    /// [`pv_get_complete`]: StateSet::pv_get_complete
    pub fn pv_put_complete(
        &mut self,
        v: VarId,
        length: usize,
        any: bool,
        mut complete: Option<&mut [bool]>,
    ) -> bool {
        let prog = self.program().clone();
        let ix = self.index();

        let mut any_done = false;
        let mut all_done = true;

        for n in 0..length {
            let cix = v.index() + n;
            let mut lk = prog.locked();

            let done = if lk.dbch[cix].is_none() {
                if !prog.is_safe() {
                    error!(
                        var = %prog.chans[cix].var_name,
                        "pvPutComplete: user error (variable not assigned)"
                    );
                }

                true
            } else if lk.put_req[ix][cix].is_none() {
                warn!(
                    var = %prog.chans[cix].var_name,
                    "pvPutComplete: no pending put request for this variable"
                );
                false
            } else if prog.ss[ix].put_sem[cix].try_take() {
                lk.put_req[ix][cix] = None;
                let _ = self.check_connected(&mut lk, cix);
                drop(lk);
                prog.ss[ix].put_sem[cix].give();
                true
            } else {
                false
            };

            any_done = any_done || done;
            all_done = all_done && done;

            if let Some(out) = complete.as_deref_mut() {
                out[n] = done;
            } else if any && done {
                break;
            }
        }

        debug!(v = %v, length, any_done, all_done, "pvPutComplete");

        if any { any_done } else { all_done }
    }

    /// Cancel pending puts on `length` consecutive variables starting at
    /// `v`.
    pub fn pv_put_cancel(&mut self, v: VarId, length: usize) {
        let prog = self.program().clone();
        let ix = self.index();

        for n in 0..length {
            let cix = v.index() + n;
            let mut lk = prog.locked();

            if lk.dbch[cix].is_none() {
                if !prog.is_safe() {
                    warn!(
                        var = %prog.chans[cix].var_name,
                        "pvPutCancel: user error (variable not assigned)"
                    );
                }
            } else {
                lk.put_req[ix][cix] = None;
                drop(lk);
                prog.ss[ix].put_sem[cix].give();
            }
        }
    }

    fn anonymous_put(&mut self, cix: usize) {
        let prog = self.program().clone();
        let chan = &prog.chans[cix];
        let value = self.vars[cix].value.clone();
        let meta = self.vars[cix].meta.clone();

        debug!(var = %chan.var_name, "anonymous put");

        if let Some(queue) = &chan.queue {
            // Multiple state sets may put concurrently; the ring carries
            // its own lock. Anonymous and named PVs are disjoint, so no
            // bus callback contends here.
            let was_full = lock_queue(queue).push(QEntry { value, meta });

            if was_full {
                warn!(
                    var = %chan.var_name,
                    "pvPut on queued variable (anonymous): oldest queue element \
                     dropped (queue is full)"
                );
            }
        } else {
            let mut lk = prog.locked();
            let dirty = lk.monitored[cix];
            lk.write_shared(cix, chan.count, value, None, dirty);
        }

        let ev = {
            let mut lk = prog.locked();
            let ev = lk.synced_to[cix];

            if !ev.is_none() {
                lk.ev_flags.set(ev.get());
            }

            ev
        };

        if !ev.is_none() {
            prog.wakeup(ev.get());
        }

        prog.wakeup(chan.event_num);
    }

    /// Assign the variable to the named PV, releasing any prior
    /// assignment first. An empty name leaves the variable unassigned
    /// (anonymous in safe mode).
    pub fn pv_assign(&mut self, v: VarId, name: &str) -> Status {
        debug!(var = %v, pv = name, "pvAssign");
        self.program().clone().assign_chan(v.index(), name)
    }

    /// Start monitoring the variable.
    pub fn pv_monitor(&mut self, v: VarId) -> Status {
        self.set_monitor(v, true)
    }

    /// Stop monitoring the variable.
    pub fn pv_stop_monitor(&mut self, v: VarId) -> Status {
        self.set_monitor(v, false)
    }

    fn set_monitor(&mut self, v: VarId, on: bool) -> Status {
        let prog = self.program().clone();
        let cix = v.index();
        let mut lk = prog.locked();

        let Some(db) = lk.dbch[cix].as_ref() else {
            if prog.is_safe() {
                lk.monitored[cix] = on;
                return Status::Ok;
            }

            error!(
                var = %prog.chans[cix].var_name,
                "pvMonitor: user error (variable not assigned)"
            );
            return Status::Error;
        };

        let id = db.id;
        lk.monitored[cix] = on;
        prog.bus().monitor(id, on)
    }

    /// Rebind `length` consecutive variables starting at `v` to the
    /// event flag `ev`; [`EvId::NONE`] removes the binding.
    pub fn pv_sync(&mut self, v: VarId, length: usize, ev: EvId) {
        let prog = self.program().clone();

        assert!(
            ev.get() <= prog.num_ev_flags(),
            "event flag {} out of range 0..={}",
            ev,
            prog.num_ev_flags()
        );

        let mut lk = prog.locked();

        for n in 0..length {
            let cix = v.index() + n;
            let old = lk.synced_to[cix];

            if old == ev {
                continue;
            }

            if !old.is_none() {
                lk.synced[old.index()].retain(|&c| c != cix);
            }

            lk.synced_to[cix] = ev;

            if !ev.is_none() {
                lk.synced[ev.index()].push(cix);
            }
        }
    }

    /// Pop one record from a queued variable into this state set's view.
    ///
    /// Returns whether a record was present. If the variable is synced to
    /// an event flag and the queue drained, the flag is cleared.
    pub fn pv_get_q(&mut self, v: VarId) -> bool {
        let prog = self.program().clone();
        let cix = v.index();

        let Some(queue) = &prog.chans[cix].queue else {
            error!(
                var = %prog.chans[cix].var_name,
                "pvGetQ: user error (variable not queued)"
            );
            return false;
        };

        let entry = lock_queue(queue).pop();
        let got = entry.is_some();

        let mut lk = prog.locked();

        if let Some(entry) = entry {
            let assigned = lk.dbch[cix].is_some();
            let mut value = entry.value;
            value.resize(prog.chans[cix].count);

            if prog.is_safe() {
                self.vars[cix].value = value;

                if assigned {
                    self.vars[cix].meta = entry.meta;
                }
            } else {
                lk.shared[cix].value = value;

                if assigned {
                    lk.shared[cix].meta = entry.meta;
                }
            }
        }

        let ev = lk.synced_to[cix];

        if !ev.is_none() && lock_queue(queue).is_empty() {
            lk.ev_flags.clear(ev.get());
        }

        got
    }

    /// Drop every record of a queued variable and clear its synced flag.
    pub fn pv_flush_q(&mut self, v: VarId) {
        let prog = self.program().clone();
        let cix = v.index();

        let Some(queue) = &prog.chans[cix].queue else {
            error!(
                var = %prog.chans[cix].var_name,
                "pvFlushQ: user error (variable not queued)"
            );
            return;
        };

        debug!(var = %prog.chans[cix].var_name, dropped = lock_queue(queue).len(), "pvFlushQ");
        lock_queue(queue).flush();

        let mut lk = prog.locked();
        let ev = lk.synced_to[cix];

        if !ev.is_none() {
            lk.ev_flags.clear(ev.get());
        }
    }

    /// The PV name of an assigned variable.
    pub fn pv_name(&self, v: VarId) -> Option<String> {
        let lk = self.program().locked();
        lk.dbch[v.index()].as_ref().map(|db| db.name.clone())
    }

    /// Element count: the transport-reported count when assigned, the
    /// declared count otherwise.
    pub fn pv_count(&self, v: VarId) -> usize {
        let prog = self.program();
        let lk = prog.locked();

        lk.dbch[v.index()]
            .as_ref()
            .map(|db| db.count)
            .unwrap_or(prog.chans[v.index()].count)
    }

    /// Alarm status of the variable; `Ok` when unassigned.
    pub fn pv_status(&self, v: VarId) -> Status {
        let lk = self.program().locked();

        if lk.dbch[v.index()].is_some() {
            self.meta_status(&lk, v.index()).0
        } else {
            Status::Ok
        }
    }

    /// Alarm severity of the variable; `Ok` when unassigned.
    pub fn pv_severity(&self, v: VarId) -> Severity {
        let lk = self.program().locked();

        if lk.dbch[v.index()].is_some() {
            self.meta_status(&lk, v.index()).1
        } else {
            Severity::Ok
        }
    }

    /// Error message of the variable's last operation; empty when
    /// unassigned.
    pub fn pv_message(&self, v: VarId) -> &'static str {
        let lk = self.program().locked();

        if lk.dbch[v.index()].is_some() {
            self.meta_status(&lk, v.index()).2
        } else {
            ""
        }
    }

    /// Time stamp of the variable's last delivery; the current time when
    /// unassigned.
    pub fn pv_timestamp(&self, v: VarId) -> SystemTime {
        let prog = self.program();
        let lk = prog.locked();
        let cix = v.index();

        if lk.dbch[cix].is_none() {
            return SystemTime::now();
        }

        if prog.is_safe() {
            self.vars[cix].meta.timestamp
        } else {
            lk.shared[cix].meta.timestamp
        }
    }

    fn meta_status(&self, lk: &Locked, cix: usize) -> (Status, Severity, &'static str) {
        let meta = if self.program().is_safe() {
            &self.vars[cix].meta
        } else {
            &lk.shared[cix].meta
        };

        (meta.status, meta.severity, meta.message)
    }

    /// Whether the variable is assigned to a named PV.
    pub fn pv_assigned(&self, v: VarId) -> bool {
        self.program().locked().dbch[v.index()].is_some()
    }

    /// Whether the variable's PV is connected.
    pub fn pv_connected(&self, v: VarId) -> bool {
        self.program().locked().dbch[v.index()]
            .as_ref()
            .is_some_and(|db| db.connected)
    }

    /// Channel-table index of the variable.
    pub fn pv_index(&self, v: VarId) -> usize {
        v.index()
    }

    /// Total number of channels in the program.
    pub fn pv_channel_count(&self) -> usize {
        self.program().chans.len()
    }

    /// Number of channels assigned to a named PV.
    pub fn pv_assign_count(&self) -> usize {
        self.program().locked().assign_count
    }

    /// Number of assigned channels currently connected.
    pub fn pv_connect_count(&self) -> usize {
        self.program().locked().connect_count
    }

    /// Push any buffered transport requests out to the bus.
    pub fn pv_flush(&self) {
        self.program().bus().flush();
    }
}
