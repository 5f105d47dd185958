//! Transaction path estimation
//!
//! The executor consults a [`PathEstimator`] at admission (which partitions
//! will this transaction touch?) and after every work unit of a distributed
//! transaction (is it done with partition P?). Answers are advisory: the
//! executor only acts on a "done" answer when the transaction's own protocol
//! record agrees, and a wrong answer surfaces as a mispredict restart.
//!
//! [`ModelEstimator`] reads a JSON path model:
//!
//! ```json
//! {
//!   "procedures": {
//!     "SendPayment": {
//!       "statements": [
//!         { "name": "GetAccount",    "target": { "param": 0 }, "probability": 1.0 },
//!         { "name": "GetAccount",    "target": { "param": 1 }, "probability": 1.0 },
//!         { "name": "UpdateBalance", "target": "base",         "probability": 0.9 }
//!       ]
//!     }
//!   }
//! }
//! ```
//!
//! Statements run in list order. A transaction whose trace stops matching the
//! list has left the model and is never declared done.

use serde::{Deserialize, Serialize};
use spectra_concurrency::Transaction;
use spectra_core::{ParameterSet, PartitionId, PartitionSet, SpectraError, SpectraResult};
use std::collections::HashMap;
use std::path::Path;

/// Predicts which partitions a transaction touches
pub trait PathEstimator: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Partitions a new transaction is expected to touch, if known
    fn predict_partitions(
        &self,
        procedure: &str,
        params: &ParameterSet,
        base: PartitionId,
        num_partitions: u32,
    ) -> Option<PartitionSet>;

    /// Whether `txn` will not touch `partition` again
    ///
    /// Called on the base partition's worker after every work unit, so it
    /// must be cheap and free of side effects.
    fn is_done_at_partition(&self, txn: &Transaction, partition: PartitionId) -> bool;
}

/// Estimator that knows nothing; Early 2PC never triggers
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEstimator;

impl PathEstimator for NullEstimator {
    fn name(&self) -> &str {
        "null"
    }

    fn predict_partitions(
        &self,
        _procedure: &str,
        _params: &ParameterSet,
        _base: PartitionId,
        _num_partitions: u32,
    ) -> Option<PartitionSet> {
        None
    }

    fn is_done_at_partition(&self, _txn: &Transaction, _partition: PartitionId) -> bool {
        false
    }
}

/// Partition a modelled statement runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementTarget {
    /// The transaction's base partition
    Base,
    /// Every partition
    All,
    /// The partition of procedure parameter `n`
    Param(usize),
}

/// One statement of a procedure model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementModel {
    /// Statement label, compared with work unit labels
    pub name: String,
    /// Where it runs
    pub target: StatementTarget,
    /// Probability that the statement executes
    #[serde(default = "default_probability")]
    pub probability: f64,
}

fn default_probability() -> f64 {
    1.0
}

/// Ordered statements of one procedure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureModel {
    /// Statements in execution order
    pub statements: Vec<StatementModel>,
}

/// Path model of every known procedure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathModel {
    /// Models by procedure name
    #[serde(default)]
    pub procedures: HashMap<String, ProcedureModel>,
}

impl PathModel {
    /// Parse a model from JSON text
    pub fn from_json(json: &str) -> SpectraResult<Self> {
        let model: PathModel = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    /// Load a model file
    pub fn from_file(path: &Path) -> SpectraResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    fn validate(&self) -> SpectraResult<()> {
        for (name, proc) in &self.procedures {
            if let Some(bad) = proc
                .statements
                .iter()
                .find(|s| !(0.0..=1.0).contains(&s.probability))
            {
                return Err(SpectraError::InvalidConfig(format!(
                    "path model {}.{}: probability {} outside [0, 1]",
                    name, bad.name, bad.probability
                )));
            }
        }
        Ok(())
    }
}

/// Estimator backed by a [`PathModel`]
#[derive(Debug, Clone)]
pub struct ModelEstimator {
    model: PathModel,
    confidence: f64,
    num_partitions: u32,
}

impl ModelEstimator {
    /// Estimator declaring a partition done once the chance of touching it
    /// again is at most `1 - confidence`
    pub fn new(model: PathModel, confidence: f64, num_partitions: u32) -> Self {
        Self {
            model,
            confidence,
            num_partitions,
        }
    }

    /// Load the model from `path`
    pub fn from_file(path: &Path, confidence: f64, num_partitions: u32) -> SpectraResult<Self> {
        Ok(Self::new(PathModel::from_file(path)?, confidence, num_partitions))
    }

    fn targets(
        &self,
        target: StatementTarget,
        params: &ParameterSet,
        base: PartitionId,
        num_partitions: u32,
    ) -> PartitionSet {
        match target {
            StatementTarget::Base => PartitionSet::single(base),
            StatementTarget::All => PartitionSet::all(num_partitions),
            StatementTarget::Param(i) => match params.get(i) {
                Some(v) => PartitionSet::single(v.partition(num_partitions)),
                // unknown parameter: assume anywhere
                None => PartitionSet::all(num_partitions),
            },
        }
    }
}

impl PathEstimator for ModelEstimator {
    fn name(&self) -> &str {
        "model"
    }

    fn predict_partitions(
        &self,
        procedure: &str,
        params: &ParameterSet,
        base: PartitionId,
        num_partitions: u32,
    ) -> Option<PartitionSet> {
        let model = self.model.procedures.get(procedure)?;
        let floor = 1.0 - self.confidence;
        let mut predicted = PartitionSet::single(base);
        for stmt in model.statements.iter().filter(|s| s.probability > floor) {
            predicted = predicted.union(&self.targets(stmt.target, params, base, num_partitions));
        }
        Some(predicted)
    }

    fn is_done_at_partition(&self, txn: &Transaction, partition: PartitionId) -> bool {
        let Some(model) = self.model.procedures.get(txn.procedure()) else {
            return false;
        };
        let trace = txn.trace();
        if trace.len() > model.statements.len() {
            return false;
        }
        let on_model = trace
            .iter()
            .zip(&model.statements)
            .all(|(entry, stmt)| entry.statement == stmt.name);
        if !on_model {
            return false;
        }

        let mut untouched = 1.0;
        for stmt in &model.statements[trace.len()..] {
            let targets = self.targets(stmt.target, txn.params(), txn.base_partition(), self.num_partitions);
            if targets.contains(partition) {
                untouched *= 1.0 - stmt.probability;
            }
        }
        1.0 - untouched <= 1.0 - self.confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectra_concurrency::TransactionSpec;
    use spectra_core::{TxnId, Value};

    const MODEL: &str = r#"{
        "procedures": {
            "SendPayment": {
                "statements": [
                    { "name": "GetAccount", "target": { "param": 0 } },
                    { "name": "GetAccount", "target": { "param": 1 } },
                    { "name": "Debit", "target": "base", "probability": 1.0 },
                    { "name": "Credit", "target": { "param": 1 }, "probability": 1.0 },
                    { "name": "Audit", "target": "all", "probability": 0.01 }
                ]
            }
        }
    }"#;

    fn p(n: u32) -> PartitionId {
        PartitionId::new(n)
    }

    fn estimator() -> ModelEstimator {
        ModelEstimator::new(PathModel::from_json(MODEL).unwrap(), 0.95, 2)
    }

    fn payment() -> Transaction {
        let params = ParameterSet::new(vec![Value::Int(0), Value::Int(1), Value::Float(1.0)]);
        let spec = TransactionSpec::new("SendPayment", params, p(0)).partitions(PartitionSet::all(2));
        Transaction::new(TxnId::new(1), spec)
    }

    #[test]
    fn test_predicts_param_partitions() {
        let est = estimator();
        let params = ParameterSet::new(vec![Value::Int(0), Value::Int(1)]);
        let predicted = est.predict_partitions("SendPayment", &params, p(0), 2).unwrap();
        assert_eq!(predicted, PartitionSet::all(2));

        let local = ParameterSet::new(vec![Value::Int(1), Value::Int(3)]);
        let predicted = est.predict_partitions("SendPayment", &local, p(1), 2).unwrap();
        assert_eq!(predicted, PartitionSet::single(p(1)));

        assert!(est.predict_partitions("Unknown", &params, p(0), 2).is_none());
    }

    #[test]
    fn test_done_after_last_remote_statement() {
        let est = estimator();
        let txn = payment();
        txn.push_trace("GetAccount", p(0));
        txn.push_trace("GetAccount", p(1));
        assert!(!est.is_done_at_partition(&txn, p(1)));
        txn.push_trace("Debit", p(0));
        assert!(!est.is_done_at_partition(&txn, p(1)));
        txn.push_trace("Credit", p(1));
        // only the unlikely audit remains
        assert!(est.is_done_at_partition(&txn, p(1)));
    }

    #[test]
    fn test_off_model_trace_is_never_done() {
        let est = estimator();
        let txn = payment();
        txn.push_trace("Surprise", p(0));
        assert!(!est.is_done_at_partition(&txn, p(1)));
    }

    #[test]
    fn test_null_estimator() {
        let txn = payment();
        assert!(!NullEstimator.is_done_at_partition(&txn, p(1)));
        assert!(NullEstimator
            .predict_partitions("SendPayment", txn.params(), p(0), 2)
            .is_none());
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let bad = r#"{"procedures":{"X":{"statements":[{"name":"a","target":"base","probability":2.0}]}}}"#;
        assert!(matches!(PathModel::from_json(bad), Err(SpectraError::InvalidConfig(_))));
        assert!(matches!(PathModel::from_json("nope"), Err(SpectraError::Serialization(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, MODEL).unwrap();
        let est = ModelEstimator::from_file(&path, 0.95, 2).unwrap();
        assert_eq!(est.name(), "model");
        assert!(ModelEstimator::from_file(&dir.path().join("missing.json"), 0.95, 2).is_err());
    }
}
