//! Safe-mode buffering: shadow isolation, selective reads at event-flag
//! observation points, and anonymous PVs.

mod common;

use std::sync::Arc;

use sequencer::bus::mem::MemBus;
use sequencer::bus::{Type, Value};
use sequencer::{ChanDef, CompType, EvId, ProgOptions, Program, ProgramDef, VarId};

use self::common::{idle_ss, membus, program};

const X: VarId = VarId::new(0);
const F: EvId = EvId::new(1);

fn safe_program(bus: &Arc<MemBus>, chans: Vec<ChanDef>) -> Arc<Program> {
    let mut def = ProgramDef::new("safetest")
        .ev_flags(2)
        .options(ProgOptions::SAFE)
        .state_set(idle_ss("consumer"))
        .state_set(idle_ss("producer"));

    for chan in chans {
        def = def.chan(chan);
    }

    program(def, bus)
}

/// A monitor delivery becomes visible to a state set only when it
/// acknowledges the synced event flag.
#[test]
fn test_monitor_then_flag_then_read() {
    let bus = membus();
    let prog = safe_program(
        &bus,
        vec![ChanDef::new("x", Type::Int).named("pv:x").monitored().synced(F)],
    );
    let mut ss = prog.state_set(0);

    assert!(ss.pv_assign(X, "pv:x").is_ok());
    bus.connect_all();

    bus.post("pv:x", Value::int(42));

    // Not yet observed: the shadow still has the initial value.
    assert_eq!(ss.var(X), Value::int(0));

    assert!(ss.ef_test(F));
    assert_eq!(ss.var(X), Value::int(42));
}

#[test]
fn test_selective_read_touches_only_synced_variables() {
    let bus = membus();
    let g = EvId::new(2);
    let prog = safe_program(
        &bus,
        vec![
            ChanDef::new("a", Type::Int).named("pv:a").monitored().synced(F),
            ChanDef::new("b", Type::Int).named("pv:b").monitored().synced(g),
        ],
    );
    let a = VarId::new(0);
    let b = VarId::new(1);
    let mut ss = prog.state_set(0);

    assert!(ss.pv_assign(a, "pv:a").is_ok());
    assert!(ss.pv_assign(b, "pv:b").is_ok());
    bus.connect_all();

    bus.post("pv:a", Value::int(1));
    bus.post("pv:b", Value::int(2));

    // Acknowledging flag F pulls in `a` but not `b`.
    assert!(ss.ef_test_and_clear(F));
    assert_eq!(ss.var(a), Value::int(1));
    assert_eq!(ss.var(b), Value::int(0));

    assert!(ss.ef_test_and_clear(g));
    assert_eq!(ss.var(b), Value::int(2));
}

/// Between two observation points the shadow does not move, no matter
/// what arrives on the bus.
#[test]
fn test_shadow_stable_between_observation_points() {
    let bus = membus();
    let prog = safe_program(
        &bus,
        vec![ChanDef::new("x", Type::Int).named("pv:x").monitored().synced(F)],
    );
    let mut ss = prog.state_set(0);

    assert!(ss.pv_assign(X, "pv:x").is_ok());
    bus.connect_all();

    bus.post("pv:x", Value::int(1));
    assert!(ss.ef_test_and_clear(F));
    assert_eq!(ss.var(X), Value::int(1));

    bus.post("pv:x", Value::int(2));
    bus.post("pv:x", Value::int(3));
    assert_eq!(ss.var(X), Value::int(1));

    assert!(ss.ef_test_and_clear(F));
    assert_eq!(ss.var(X), Value::int(3));
}

/// Anonymous PVs carry values between state sets: a put writes the
/// shared buffer, a get copies it into the reader's shadow.
#[test]
fn test_anonymous_put_then_get() {
    let bus = membus();
    let prog = safe_program(&bus, vec![ChanDef::new("x", Type::Int)]);
    let mut consumer = prog.state_set(0);
    let mut producer = prog.state_set(1);

    producer.set_var(X, Value::int(7));
    assert!(producer.pv_put(X, CompType::Default, 0.0).is_ok());

    // The producer's put is invisible until the consumer observes.
    assert_eq!(consumer.var(X), Value::int(0));

    assert!(consumer.pv_get(X, CompType::Default, 0.0).is_ok());
    assert_eq!(consumer.var(X), Value::int(7));
}

/// An anonymous monitored variable synced to a flag is observed through
/// the flag acknowledgement instead of an explicit get.
#[test]
fn test_anonymous_put_observed_through_flag() {
    let bus = membus();
    let prog = safe_program(
        &bus,
        vec![ChanDef::new("x", Type::Int).monitored().synced(F)],
    );
    let mut consumer = prog.state_set(0);
    let mut producer = prog.state_set(1);

    producer.set_var(X, Value::int(11));
    assert!(producer.pv_put(X, CompType::Default, 0.0).is_ok());

    assert!(consumer.ef_test_and_clear(F));
    assert_eq!(consumer.var(X), Value::int(11));
}

/// Capacity-two queue, three puts: the oldest element is overwritten,
/// the flag follows queue emptiness.
#[test]
fn test_anonymous_queued_put() {
    let bus = membus();
    let prog = safe_program(
        &bus,
        vec![ChanDef::new("q", Type::Int).queued_with(2).synced(F)],
    );
    let mut consumer = prog.state_set(0);
    let mut producer = prog.state_set(1);

    for n in [1, 2, 3] {
        producer.set_var(X, Value::int(n));
        assert!(producer.pv_put(X, CompType::Default, 0.0).is_ok());
    }

    assert!(consumer.ef_test(F));

    assert!(consumer.pv_get_q(X));
    assert_eq!(consumer.var(X), Value::int(2));
    assert!(consumer.ef_test(F));

    assert!(consumer.pv_get_q(X));
    assert_eq!(consumer.var(X), Value::int(3));

    // The queue drained; the flag was cleared with it.
    assert!(!consumer.pv_get_q(X));
    assert!(!consumer.ef_test(F));
}

#[test]
fn test_flush_q_clears_flag_and_queue() {
    let bus = membus();
    let prog = safe_program(
        &bus,
        vec![ChanDef::new("q", Type::Int).queued_with(4).synced(F)],
    );
    let mut consumer = prog.state_set(0);
    let mut producer = prog.state_set(1);

    producer.set_var(X, Value::int(1));
    assert!(producer.pv_put(X, CompType::Default, 0.0).is_ok());
    assert!(consumer.ef_test(F));

    consumer.pv_flush_q(X);

    assert!(!consumer.ef_test(F));
    assert!(!consumer.pv_get_q(X));
}

/// A sync get on an assigned channel is an unconditional observation
/// point.
#[test]
fn test_sync_get_copies_into_shadow() {
    let bus = membus();
    let prog = safe_program(&bus, vec![ChanDef::new("x", Type::Int).named("pv:x")]);
    let mut ss = prog.state_set(0);

    assert!(ss.pv_assign(X, "pv:x").is_ok());
    bus.seed("pv:x", Value::int(23));
    bus.connect_all();

    assert!(ss.pv_get(X, CompType::Sync, 1.0).is_ok());
    assert_eq!(ss.var(X), Value::int(23));
}

/// Anonymous monitor/stop-monitor bookkeeping needs no transport.
#[test]
fn test_anonymous_monitor_toggle() {
    let bus = membus();
    let prog = safe_program(&bus, vec![ChanDef::new("x", Type::Int)]);
    let mut ss = prog.state_set(0);

    assert!(ss.pv_monitor(X).is_ok());
    assert!(ss.pv_stop_monitor(X).is_ok());
    assert_eq!(bus.var_count(), 0);
}
