//! End-to-end use of the `spectradb` facade

use spectradb::concurrency::{CheckerKind, ConflictChecker, ReadWriteSetOverlap};
use spectradb::{
    AccessSet, FnProcedure, Invocation, PartitionId, PartitionSet, Site, SiteConfig, Status, Value, WorkUnit,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn counter_site(config: SiteConfig) -> Site {
    let bump = FnProcedure::new("Bump", |ctx| {
        let key = format!("n:{}", ctx.param(0).cloned().unwrap_or(Value::Null));
        ctx.execute_local(WorkUnit::new("Bump").add(key.clone(), 1i64).get(key))
    })
    .with_declared(|params, n| {
        let key = format!("n:{}", params.get(0)?);
        let partition = params.get(0)?.partition(n);
        Some(AccessSet::new().write(partition, key))
    });
    let scan = FnProcedure::new("Scan", |ctx| {
        let mut values = Vec::new();
        for p in 0..ctx.num_partitions() {
            let key = format!("n:{}", p);
            values.extend(ctx.execute(PartitionId::new(p), WorkUnit::new("Scan").get(key))?);
        }
        Ok(values)
    })
    .read_only();
    Site::builder(config)
        .procedure(bump.into_handler())
        .procedure(scan.into_handler())
        .start()
        .unwrap()
}

#[test]
fn test_concurrent_clients_see_serial_results() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let site = Arc::new(counter_site(SiteConfig {
        partitions: 4,
        ..SiteConfig::default()
    }));

    let clients: Vec<_> = (0..4i64)
        .map(|p| {
            let site = Arc::clone(&site);
            std::thread::spawn(move || {
                for _ in 0..25 {
                    let response = site
                        .submit(Invocation::new("Bump", vec![p.into()]))
                        .unwrap()
                        .wait(WAIT)
                        .unwrap();
                    assert_eq!(response.status, Status::Ok);
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    let response = site
        .submit(Invocation::new("Scan", vec![]).partitions(PartitionSet::all(4)))
        .unwrap()
        .wait(WAIT)
        .unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.results, vec![Value::Int(25); 4]);
    assert_eq!(site.active_transactions(), 0);
    site.shutdown().unwrap();
}

#[test]
fn test_checker_selected_by_config() {
    let site = counter_site(SiteConfig {
        specexec_checker: CheckerKind::ReadWriteSet,
        ..SiteConfig::default()
    });
    let checker = site.executor(PartitionId::new(0)).unwrap().spec_scheduler().conflict_checker();
    assert_eq!(checker.name(), ReadWriteSetOverlap.name());
    site.shutdown().unwrap();
}
