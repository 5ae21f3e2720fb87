//! Bus event handlers: connection tracking, monitor delivery and get/put
//! completion matching.
//!
//! Handlers run in the transport's context. Each one mutates flag bits
//! and the shared buffer under the program lock, releases it, and only
//! then posts wake-ups.

use bus::{BusEvents, Meta, Severity, Status, Value};
use tracing::{debug, error, warn};

use crate::channel::{QEntry, lock_queue};
use crate::program::{Program, ReqOp};

impl BusEvents for Program {
    fn connection(&self, tag: u32, connected: bool, count: usize) {
        let cix = tag as usize;

        let Some(chan) = self.chans.get(cix) else {
            return;
        };

        {
            let mut lk = self.locked();

            let Some(db) = lk.dbch[cix].as_mut() else {
                // Unassigned while the event was in flight.
                return;
            };

            if connected && !db.connected {
                db.connected = true;
                db.count = count.clamp(1, chan.count);
                let id = db.id;
                debug!(var = %chan.var_name, pv = %db.name, count, "connected");
                lk.connect_count += 1;

                if lk.monitored[cix] {
                    let status = self.bus().monitor(id, true);

                    if !status.is_ok() {
                        error!(var = %chan.var_name, ?status, "monitor subscription failure");
                    }
                }

                if lk.connect_count == lk.assign_count {
                    self.ready.open();
                }
            } else if !connected && db.connected {
                db.connected = false;
                warn!(var = %chan.var_name, pv = %db.name, "disconnected");
                lk.connect_count -= 1;
            } else {
                return;
            }
        }

        self.wakeup(chan.event_num);
    }

    fn event(&self, tag: u32, value: Value, meta: Meta) {
        let cix = tag as usize;

        let Some(chan) = self.chans.get(cix) else {
            return;
        };

        if let Some(queue) = &chan.queue {
            let was_full = lock_queue(queue).push(QEntry { value, meta });

            if was_full {
                warn!(
                    var = %chan.var_name,
                    "monitor on queued variable: oldest queue element dropped \
                     (queue is full)"
                );
            }
        } else {
            let mut lk = self.locked();
            lk.write_shared(cix, chan.count, value, Some(meta), true);
        }

        let ev = {
            let mut lk = self.locked();
            let ev = lk.synced_to[cix];

            if !ev.is_none() {
                lk.ev_flags.set(ev.get());
            }

            ev
        };

        if !ev.is_none() {
            self.wakeup(ev.get());
        }

        self.wakeup(chan.event_num);
    }

    fn get_complete(&self, token: u64, status: Status, value: Option<Value>, meta: Meta) {
        let mut meta = meta;

        if !status.is_ok() && meta.status.is_ok() {
            meta.status = status;
            meta.severity = Severity::Major;
        }

        let (ssix, cix, ev) = {
            let mut lk = self.locked();

            let Some(req) = lk.take_req(token) else {
                // Cancelled, superseded or timed out; drop the delivery.
                return;
            };

            let (ssix, cix) = (req.ss, req.var);

            if req.op != ReqOp::Get || lk.get_req[ssix][cix] != Some(token) {
                return;
            }

            let chan = &self.chans[cix];

            match value {
                Some(value) => lk.write_shared(cix, chan.count, value, Some(meta), true),
                None => lk.shared[cix].meta = meta,
            }

            let ev = lk.synced_to[cix];

            if !ev.is_none() {
                lk.ev_flags.set(ev.get());
            }

            (ssix, cix, ev)
        };

        self.ss[ssix].get_sem[cix].give();

        if !ev.is_none() {
            self.wakeup(ev.get());
        }

        self.wakeup(self.chans[cix].event_num);
    }

    fn put_complete(&self, token: u64, status: Status) {
        let (ssix, cix, ev) = {
            let mut lk = self.locked();

            let Some(req) = lk.take_req(token) else {
                return;
            };

            let (ssix, cix) = (req.ss, req.var);

            if req.op != ReqOp::Put || lk.put_req[ssix][cix] != Some(token) {
                return;
            }

            if !status.is_ok() {
                lk.shared[cix].meta.status = status;
                lk.shared[cix].meta.severity = Severity::Major;
            }

            let ev = lk.synced_to[cix];

            if !ev.is_none() {
                lk.ev_flags.set(ev.get());
            }

            (ssix, cix, ev)
        };

        self.ss[ssix].put_sem[cix].give();

        if !ev.is_none() {
            self.wakeup(ev.get());
        }

        self.wakeup(self.chans[cix].event_num);
    }
}
