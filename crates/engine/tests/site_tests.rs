//! Site admission, restarts, aborts and failure handling

mod common;

use common::*;
use spectra_concurrency::{ConflictCheckError, CustomChecker};
use spectra_engine::{
    Counter, ExecutorState, FnProcedure, Invocation, PartitionId, Site, SiteConfig, SpectraError, Status, Value,
    WorkUnit,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// `Hold` blocks inside its handler at P1 until the gate opens
fn with_hold(gate: Arc<Gate>) -> impl FnOnce(spectra_engine::SiteBuilder) -> spectra_engine::SiteBuilder {
    move |b| {
        b.procedure(
            FnProcedure::new("Hold", move |ctx| {
                let values = ctx.execute_local(WorkUnit::new("Hold").get("acct:1"))?;
                gate.wait(NOTIFY_TIMEOUT);
                Ok(values)
            })
            .into_handler(),
        )
    }
}

fn hold_at_p1() -> Invocation {
    Invocation::new("Hold", vec![1i64.into()]).base_partition(P1)
}

#[test]
fn test_single_partition_never_blocks() {
    let ps = PaymentSite::start(SiteConfig::default());
    let handles: Vec<_> = (0..5)
        .map(|_| ps.site.submit(ps.local_payment_at_p1()).unwrap())
        .collect();
    for handle in handles {
        let response = handle.wait(NOTIFY_TIMEOUT).unwrap();
        assert_eq!(response.status, Status::Ok);
        assert!(response.single_partition);
        assert_eq!(response.base_partition, P1);
    }
    for p in [P0, P1] {
        assert_eq!(ps.site.executor(p).unwrap().blocked_remote_entries(), 0);
    }
    assert_eq!(ps.checking(P1, 1), Some(INITIAL_BALANCE - 5.0));
    assert_eq!(ps.checking(P1, 3), Some(INITIAL_BALANCE + 5.0));
    assert_eq!(ps.site.counters().get(Counter::SinglePartition), 5);
    ps.site.shutdown().unwrap();
}

#[test]
fn test_answered_transactions_are_no_longer_active() {
    let ps = PaymentSite::start(SiteConfig::default());
    for _ in 0..50 {
        let response = ps
            .site
            .submit(ps.local_payment_at_p1())
            .unwrap()
            .wait(NOTIFY_TIMEOUT)
            .unwrap();
        assert_eq!(response.status, Status::Ok);
        assert_eq!(ps.site.active_transactions(), 0);
    }
    ps.site.shutdown().unwrap();
}

#[test]
fn test_mispredicted_partition_restarts() {
    let ps = PaymentSite::start_with(SiteConfig::default(), false, |b| {
        b.procedure(
            FnProcedure::new("Misrouted", |ctx| {
                let mut values = ctx.execute_local(WorkUnit::new("Local").get("acct:0"))?;
                values.extend(ctx.execute(P1, WorkUnit::new("Probe").get("acct:1"))?);
                Ok(values)
            })
            .into_handler(),
        )
    });

    // no model entry, so admitted single-partition at P0
    let handle = ps
        .site
        .submit(Invocation::new("Misrouted", vec![0i64.into()]).base_partition(P0))
        .unwrap();
    let response = handle.wait(NOTIFY_TIMEOUT).unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.restart_counter, 1);
    assert!(!response.single_partition);
    assert_eq!(
        response.results,
        vec![Value::from("customer-0"), Value::from("customer-1")]
    );
    assert_eq!(response.debug.unwrap().predicted_partitions, both());

    let counters = ps.site.counters().snapshot();
    assert_eq!(counters.get(Counter::Mispredicted), 1);
    assert_eq!(counters.get(Counter::Restarted), 1);
    assert_eq!(counters.get(Counter::Completed), 1);
    assert_eq!(ps.site.active_transactions(), 0);
    ps.site.shutdown().unwrap();
}

#[test]
fn test_mispredict_without_restarts_left_aborts() {
    let cfg = SiteConfig {
        txn_restart_limit: 0,
        ..SiteConfig::default()
    };
    let ps = PaymentSite::start_with(cfg, false, |b| {
        b.procedure(
            FnProcedure::new("Misrouted", |ctx| ctx.execute(P1, WorkUnit::new("Probe").get("acct:1"))).into_handler(),
        )
    });
    let response = ps
        .site
        .submit(Invocation::new("Misrouted", vec![0i64.into()]).base_partition(P0))
        .unwrap()
        .wait(NOTIFY_TIMEOUT)
        .unwrap();
    assert_eq!(response.status, Status::AbortMispredict);
    assert_eq!(response.restart_counter, 0);
    assert!(response.results.is_empty());
    ps.site.shutdown().unwrap();
}

#[test]
fn test_abort_queued_transaction() {
    let gate = Arc::new(Gate::default());
    let ps = PaymentSite::start_with(SiteConfig::default(), false, with_hold(Arc::clone(&gate)));
    let hold = ps.site.submit(hold_at_p1()).unwrap();
    assert!(ps.site.executor(P1).unwrap().wait_for_procedure("Hold", NOTIFY_TIMEOUT));

    let payment = ps.site.submit(ps.local_payment_at_p1()).unwrap();
    assert!(ps.wait_queue_len(P1, 1));
    let queued = ps.site.queue_manager().lock_queue(P1).unwrap().peek().unwrap();
    assert!(ps.site.abort(queued.id()));
    // a second request for the same transaction is a no-op
    assert!(!ps.site.abort(queued.id()));

    gate.release();
    assert_eq!(hold.wait(NOTIFY_TIMEOUT).unwrap().status, Status::Ok);
    let response = payment.wait(NOTIFY_TIMEOUT).unwrap();
    assert_eq!(response.status, Status::AbortGraceful);
    assert_eq!(ps.checking(P1, 1), Some(INITIAL_BALANCE));
    assert!(!ps.site.abort(queued.id()));
    ps.site.shutdown().unwrap();
}

#[test]
fn test_remote_lock_wait_times_out() {
    let cfg = SiteConfig {
        txn_restart_limit: 0,
        remote_wait_timeout_ms: 200,
        poll_interval_ms: 10,
        ..SiteConfig::default()
    };
    let gate = Arc::new(Gate::default());
    let ps = PaymentSite::start_with(cfg, false, with_hold(Arc::clone(&gate)));
    let hold = ps.site.submit(hold_at_p1()).unwrap();
    assert!(ps.site.executor(P1).unwrap().wait_for_procedure("Hold", NOTIFY_TIMEOUT));

    // P1 never grants while `Hold` runs
    let dtxn = ps.site.submit(ps.blocking_dtxn()).unwrap();
    let response = dtxn.wait(NOTIFY_TIMEOUT).unwrap();
    assert_eq!(response.status, Status::AbortUnexpected);
    assert!(response.status_message.unwrap().contains("did not respond"));
    assert_eq!(ps.queue_len(P1), 0);

    gate.release();
    assert_eq!(hold.wait(NOTIFY_TIMEOUT).unwrap().status, Status::Ok);
    assert!(ps.site.executor(P0).unwrap().wait_for_state(ExecutorState::Idle, NOTIFY_TIMEOUT));
    assert_eq!(ps.checking(P0, 0), Some(INITIAL_BALANCE));
    ps.site.shutdown().unwrap();
}

#[test]
fn test_conflict_checker_failure_stops_executor() {
    let cfg = SiteConfig {
        specexec_ignore_stallpoints: Vec::new(),
        txn_restart_limit: 0,
        remote_wait_timeout_ms: 300,
        ..SiteConfig::default()
    };
    let broken = CustomChecker::new("broken", |_, _, partition| {
        Err(ConflictCheckError::Failed {
            partition,
            detail: "lost track of the holder".to_string(),
        })
    });
    let ps = PaymentSite::start_with(cfg, false, |b| b.conflict_checker(P1, Arc::new(broken)));
    let remote = ps.site.executor(P1).unwrap();

    let dtxn = ps.site.submit(ps.blocking_dtxn()).unwrap();
    assert!(ps.gates.notify_before.wait(NOTIFY_TIMEOUT));
    let payment = ps.site.submit(ps.local_payment_at_p1()).unwrap();

    assert!(remote.wait_for_state(ExecutorState::Failed, NOTIFY_TIMEOUT));
    assert!(remote.failure().unwrap().contains("broken"));
    assert_eq!(payment.wait(NOTIFY_TIMEOUT).unwrap().status, Status::AbortReject);

    // the base gives up on the dead partition
    ps.gates.open_all();
    assert_eq!(dtxn.wait(NOTIFY_TIMEOUT).unwrap().status, Status::AbortUnexpected);
    assert_eq!(ps.checking(P0, 0), Some(INITIAL_BALANCE));

    match ps.site.shutdown() {
        Err(SpectraError::ConflictChecker { checker, partition, .. }) => {
            assert_eq!(checker, "broken");
            assert_eq!(partition, P1);
        }
        other => panic!("expected checker failure, got {:?}", other),
    }
    assert!(ps.site.shutdown().is_ok());
}

#[test]
fn test_admission_errors() {
    let ps = PaymentSite::start(SiteConfig::default());

    let err = ps.site.submit(Invocation::new("NoSuchProcedure", vec![])).unwrap_err();
    assert!(matches!(err, SpectraError::UnknownProcedure(ref name) if name == "NoSuchProcedure"));

    let err = ps
        .site
        .submit(ps.local_payment_at_p1().base_partition(PartitionId::new(7)))
        .unwrap_err();
    assert!(matches!(err, SpectraError::InvalidPartition { count: 2, .. }));

    let counters = ps.site.counters().snapshot();
    assert_eq!(counters.get(Counter::Received), 2);
    assert_eq!(counters.get(Counter::Rejected), 2);

    ps.site.shutdown().unwrap();
    let err = ps.site.submit(ps.local_payment_at_p1()).unwrap_err();
    assert!(matches!(err, SpectraError::InvalidOperation(_)));
}

#[test]
fn test_base_partition_from_parameter() {
    let ps = PaymentSite::start(SiteConfig::default());
    // account 3 lives on P1
    let response = ps
        .site
        .submit(Invocation::new("Deposit", vec![3i64.into(), 2.5f64.into()]))
        .unwrap()
        .wait(NOTIFY_TIMEOUT)
        .unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.base_partition, P1);
    assert_eq!(ps.checking(P1, 3), Some(INITIAL_BALANCE + 2.5));
    ps.site.shutdown().unwrap();
}

#[test]
fn test_shutdown_rejects_queued_work() {
    let gate = Arc::new(Gate::default());
    let ps = PaymentSite::start_with(SiteConfig::default(), false, with_hold(Arc::clone(&gate)));
    let _hold = ps.site.submit(hold_at_p1()).unwrap();
    assert!(ps.site.executor(P1).unwrap().wait_for_procedure("Hold", NOTIFY_TIMEOUT));
    let queued = ps.site.submit(ps.local_payment_at_p1()).unwrap();
    assert!(ps.wait_queue_len(P1, 1));

    let releaser = {
        let gate = Arc::clone(&gate);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            gate.release();
        })
    };
    ps.site.shutdown().unwrap();
    releaser.join().unwrap();

    assert_eq!(queued.wait(NOTIFY_TIMEOUT).unwrap().status, Status::AbortReject);
    assert_eq!(ps.site.active_transactions(), 0);
}

#[test]
fn test_site_from_config_file() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(spectra_engine::CONFIG_FILE_NAME);
    SiteConfig::write_default_if_missing(&path).unwrap();
    let mut config = SiteConfig::from_file(&path).unwrap();
    assert_eq!(config, SiteConfig::default());

    config.partitions = 4;
    config.write_to_file(&path).unwrap();
    let loaded = SiteConfig::from_file(&path).unwrap();
    assert_eq!(loaded.partitions, 4);

    let site = Site::builder(loaded)
        .procedure(
            FnProcedure::new("Put", |ctx| {
                let key = format!("k:{}", ctx.param(0).cloned().unwrap_or(Value::Null));
                ctx.execute_local(WorkUnit::new("Put").put(key, 1i64))
            })
            .into_handler(),
        )
        .start()
        .unwrap();
    assert_eq!(site.num_partitions(), 4);
    for n in 0..4i64 {
        let response = site.submit(Invocation::new("Put", vec![n.into()])).unwrap();
        assert_eq!(response.wait(NOTIFY_TIMEOUT).unwrap().base_partition, PartitionId::new(n as u32));
    }
    site.shutdown().unwrap();
}

#[test]
fn test_invalid_config_is_rejected_at_start() {
    let config = SiteConfig {
        partitions: 0,
        ..SiteConfig::default()
    };
    let err = Site::builder(config).start().unwrap_err();
    assert!(matches!(err, SpectraError::InvalidConfig(_)));

    let err = Site::builder(SiteConfig::default())
        .preload(PartitionId::new(9), "k", 1i64)
        .start()
        .unwrap_err();
    assert!(matches!(err, SpectraError::InvalidPartition { .. }));
}
