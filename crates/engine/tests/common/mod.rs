//! Shared fixtures for engine integration tests
//!
//! A SmallBank-style payment workload over two partitions. Account `n`
//! lives on partition `n % 2` with keys `acct:n` and `checking:n`.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use spectra_engine::{
    ExecutionContext, FnProcedure, Invocation, PartitionId, PartitionSet, ProcedureError, ProcedureResult, Site,
    SiteConfig, Value, WorkUnit,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);
pub const INITIAL_BALANCE: f64 = 100.0;
pub const P0: PartitionId = PartitionId::new(0);
pub const P1: PartitionId = PartitionId::new(1);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One-way latch
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn release(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        let mut open = self.open.lock();
        if !*open {
            self.cond.wait_for(&mut open, timeout);
        }
        *open
    }
}

/// Rendezvous points inside `BlockingSendPayment`
#[derive(Default)]
pub struct Gates {
    /// Opened by the handler once both accounts were read
    pub notify_before: Gate,
    /// Opened by the test to let the payment proceed
    pub lock_before: Gate,
    /// Opened by the handler after the last update
    pub notify_after: Gate,
    /// Opened by the test to let the handler return
    pub lock_after: Gate,
}

impl Gates {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open everything so a stuck handler can finish
    pub fn open_all(&self) {
        self.notify_before.release();
        self.lock_before.release();
        self.notify_after.release();
        self.lock_after.release();
    }
}

/// Path model of the payment procedures
pub const PAYMENT_MODEL: &str = r#"{
    "procedures": {
        "BlockingSendPayment": {
            "statements": [
                { "name": "GetAccount", "target": { "param": 0 } },
                { "name": "GetAccount", "target": { "param": 1 } },
                { "name": "GetCheckingBalance", "target": { "param": 0 } },
                { "name": "UpdateCheckingBalance", "target": { "param": 0 } },
                { "name": "UpdateCheckingBalance", "target": { "param": 1 } }
            ]
        },
        "NonBlockingSendPayment": {
            "statements": [
                { "name": "GetAccount", "target": { "param": 0 } },
                { "name": "GetAccount", "target": { "param": 1 } },
                { "name": "GetCheckingBalance", "target": { "param": 0 } },
                { "name": "UpdateCheckingBalance", "target": { "param": 0 } },
                { "name": "UpdateCheckingBalance", "target": { "param": 1 } }
            ]
        }
    }
}"#;

fn acct(v: &Value) -> String {
    format!("acct:{}", v)
}

fn checking(v: &Value) -> String {
    format!("checking:{}", v)
}

/// Move `amount` from the checking account of param 0 to that of param 1
pub fn send_payment(ctx: &mut ExecutionContext<'_>, gates: Option<&Gates>, abort_at_end: bool) -> ProcedureResult {
    let from = ctx.param(0).cloned().unwrap_or(Value::Null);
    let to = ctx.param(1).cloned().unwrap_or(Value::Null);
    let amount = ctx.param(2).and_then(Value::as_float).unwrap_or(0.0);
    let (p_from, p_to) = (ctx.partition_for(&from), ctx.partition_for(&to));

    ctx.execute(p_from, WorkUnit::new("GetAccount").get(acct(&from)))?;
    ctx.execute(p_to, WorkUnit::new("GetAccount").get(acct(&to)))?;
    if let Some(g) = gates {
        g.notify_before.release();
        g.lock_before.wait(NOTIFY_TIMEOUT);
    }

    let balance = ctx.execute(p_from, WorkUnit::new("GetCheckingBalance").get(checking(&from)))?;
    if balance.first().and_then(Value::as_float).unwrap_or(0.0) < amount {
        return Err(ProcedureError::user_abort("insufficient funds"));
    }
    ctx.execute(p_from, WorkUnit::new("UpdateCheckingBalance").add(checking(&from), -amount))?;
    ctx.execute(p_to, WorkUnit::new("UpdateCheckingBalance").add(checking(&to), amount))?;

    if let Some(g) = gates {
        g.notify_after.release();
        g.lock_after.wait(NOTIFY_TIMEOUT);
    }
    if abort_at_end {
        return Err(ProcedureError::user_abort("aborted by test"));
    }
    Ok(vec![Value::Float(amount)])
}

/// Procedures and data of the payment workload
pub struct PaymentSite {
    pub site: Site,
    pub gates: Arc<Gates>,
    _model_dir: TempDir,
}

impl PaymentSite {
    pub fn start(config: SiteConfig) -> Self {
        Self::start_with(config, false, |b| b)
    }

    /// Start with `BlockingSendPayment` aborting after its last update when
    /// `abort_at_end` is set
    pub fn start_with(
        config: SiteConfig,
        abort_at_end: bool,
        customize: impl FnOnce(spectra_engine::SiteBuilder) -> spectra_engine::SiteBuilder,
    ) -> Self {
        Self::start_with_model(config, PAYMENT_MODEL, abort_at_end, customize)
    }

    /// Like [`PaymentSite::start_with`] with `model` as the path model JSON
    pub fn start_with_model(
        mut config: SiteConfig,
        model: &str,
        abort_at_end: bool,
        customize: impl FnOnce(spectra_engine::SiteBuilder) -> spectra_engine::SiteBuilder,
    ) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let model_path = dir.path().join("payment_model.json");
        std::fs::write(&model_path, model).unwrap();
        config.markov_enable = true;
        config.markov_path = Some(model_path);
        config.txn_client_debug = true;

        let gates = Gates::new();
        let blocking = {
            let gates = Arc::clone(&gates);
            FnProcedure::new("BlockingSendPayment", move |ctx| {
                send_payment(ctx, Some(&gates), abort_at_end)
            })
        };
        let nonblocking = FnProcedure::new("NonBlockingSendPayment", |ctx| send_payment(ctx, None, false));
        let deposit = FnProcedure::new("Deposit", |ctx| {
            let account = ctx.param(0).cloned().unwrap_or(Value::Null);
            let amount = ctx.param(1).cloned().unwrap_or(Value::Float(0.0));
            ctx.execute_local(WorkUnit::new("Deposit").add(checking(&account), amount))
        });

        let mut builder = Site::builder(config)
            .procedure(blocking.into_handler())
            .procedure(nonblocking.into_handler())
            .procedure(deposit.into_handler());
        for n in 0..4i64 {
            let partition = PartitionId::new((n % 2) as u32);
            builder = builder
                .preload(partition, format!("acct:{}", n), format!("customer-{}", n))
                .preload(partition, format!("checking:{}", n), INITIAL_BALANCE);
        }
        let site = customize(builder).start().unwrap();
        Self {
            site,
            gates,
            _model_dir: dir,
        }
    }

    /// Blocking payment from account 0 (P0) to account 1 (P1)
    pub fn blocking_dtxn(&self) -> Invocation {
        Invocation::new("BlockingSendPayment", vec![0i64.into(), 1i64.into(), 1.0f64.into()])
            .base_partition(P0)
    }

    /// Local payment from account 1 to account 3, both on P1
    pub fn local_payment_at_p1(&self) -> Invocation {
        Invocation::new("NonBlockingSendPayment", vec![1i64.into(), 3i64.into(), 1.0f64.into()])
            .base_partition(P1)
    }

    pub fn checking(&self, partition: PartitionId, account: i64) -> Option<f64> {
        self.site
            .executor(partition)?
            .read_key(&format!("checking:{}", account))?
            .as_float()
    }

    pub fn queue_len(&self, partition: PartitionId) -> usize {
        self.site
            .queue_manager()
            .lock_queue(partition)
            .map(|q| q.size())
            .unwrap_or(0)
    }

    pub fn wait_queue_len(&self, partition: PartitionId, len: usize) -> bool {
        self.site
            .queue_manager()
            .lock_queue(partition)
            .is_some_and(|q| q.wait_for_size(len, NOTIFY_TIMEOUT))
    }
}

/// Both partitions
pub fn both() -> PartitionSet {
    PartitionSet::all(2)
}
