//! Work queue for the transactional executor.
//!
//! Holds every unit that has not completed or been abandoned, in enqueue
//! order, and runs single attempts on request. Deciding what to do with an
//! attempt's result (apply, retry, start a commit) is the `Server`'s job;
//! this module only tracks unit state, attempt counts and livelock.

use std::backtrace::Backtrace;
use std::collections::BTreeSet;

use ferry_core::{ObjectId, ServerId, TransactionId, WorkPriority};
use serde::Serialize;

use crate::channel::PeerSender;
use crate::txn::{Abort, AttemptOutcome, Txn, WorkFn};
use crate::world::World;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Queued,
    Running,
    /// Closure finished; waiting on a multi-server commit.
    AwaitingCommit,
}

pub struct WorkUnit {
    pub name: String,
    pub transaction: TransactionId,
    pub priority: WorkPriority,
    pub is_transactional: bool,
    closure: WorkFn,
    /// Aborted attempts so far.
    pub execution_attempts: u32,
    pub requires_multi_server_commit: bool,
    pub multi_server_commit_reason: Option<String>,
    pub state: UnitState,
    /// Objects read or written by the most recent attempt.
    pub last_touched: BTreeSet<ObjectId>,
    pub last_abort: Option<Abort>,
    consecutive_aborts: u32,
}

impl std::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkUnit")
            .field("name", &self.name)
            .field("transaction", &self.transaction)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("execution_attempts", &self.execution_attempts)
            .finish()
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub completed: u64,
    pub abandoned: u64,
    pub aborts: u64,
    pub livelock_reports: u64,
}

pub struct Executor {
    local: ServerId,
    next_transaction: u64,
    units: Vec<WorkUnit>,
    livelock_report_interval: u32,
    stats: ExecutorStats,
}

impl Executor {
    pub fn new(local: ServerId, livelock_report_interval: u32) -> Self {
        Self {
            local,
            next_transaction: 1,
            units: Vec::new(),
            livelock_report_interval: livelock_report_interval.max(1),
            stats: ExecutorStats::default(),
        }
    }

    /// Append a unit. Without an explicit priority it runs as fresh root
    /// work of this server.
    pub fn enqueue(
        &mut self,
        name: impl Into<String>,
        priority: Option<WorkPriority>,
        is_transactional: bool,
        closure: WorkFn,
    ) -> TransactionId {
        let transaction = TransactionId(self.next_transaction);
        self.next_transaction += 1;
        let priority = priority.unwrap_or_else(|| WorkPriority::root(self.local, transaction));
        let name = name.into();
        tracing::debug!(unit = %name, %transaction, %priority, "work enqueued");
        self.units.push(WorkUnit {
            name,
            transaction,
            priority,
            is_transactional,
            closure,
            execution_attempts: 0,
            requires_multi_server_commit: false,
            multi_server_commit_reason: None,
            state: UnitState::Queued,
            last_touched: BTreeSet::new(),
            last_abort: None,
            consecutive_aborts: 0,
        });
        transaction
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats
    }

    pub fn unit(&self, transaction: TransactionId) -> Option<&WorkUnit> {
        self.units.iter().find(|u| u.transaction == transaction)
    }

    pub fn units(&self) -> impl Iterator<Item = &WorkUnit> {
        self.units.iter()
    }

    /// Units ready for an attempt, in enqueue order.
    pub fn queued(&self) -> Vec<TransactionId> {
        self.units
            .iter()
            .filter(|u| u.state == UnitState::Queued)
            .map(|u| u.transaction)
            .collect()
    }

    /// `(priority, objects touched by the last attempt)` for every unit.
    /// Arbitration uses these as the units' claims on objects.
    pub fn claims(&self) -> impl Iterator<Item = (WorkPriority, &BTreeSet<ObjectId>)> {
        self.units.iter().map(|u| (u.priority, &u.last_touched))
    }

    /// Run one attempt of a unit against the world.
    pub fn attempt(
        &mut self,
        transaction: TransactionId,
        world: &mut World,
        sender: &PeerSender,
    ) -> Option<(Result<(), Abort>, AttemptOutcome)> {
        let unit = self.units.iter_mut().find(|u| u.transaction == transaction)?;
        unit.state = UnitState::Running;
        tracing::trace!(unit = %unit.name, %transaction, attempt = unit.execution_attempts, "attempt");

        let mut txn = Txn::new(world, sender, unit.transaction, unit.priority);
        let result = (unit.closure)(&mut txn);
        let outcome = txn.finish();
        unit.last_touched = outcome.journal.touched.clone();
        Some((result, outcome))
    }

    /// The attempt ended in an abort; the unit goes back to `Queued`.
    pub fn record_abort(&mut self, transaction: TransactionId, abort: Abort) {
        let interval = self.livelock_report_interval;
        let Some(unit) = self.units.iter_mut().find(|u| u.transaction == transaction) else {
            return;
        };
        unit.execution_attempts += 1;
        unit.consecutive_aborts += 1;
        unit.state = UnitState::Queued;
        unit.requires_multi_server_commit = false;
        self.stats.aborts += 1;

        tracing::debug!(
            unit = %unit.name,
            %transaction,
            attempts = unit.execution_attempts,
            reason = %abort,
            "attempt aborted"
        );

        if unit.consecutive_aborts % interval == 0 {
            self.stats.livelock_reports += 1;
            tracing::warn!(
                unit = %unit.name,
                %transaction,
                priority = %unit.priority,
                consecutive_aborts = unit.consecutive_aborts,
                reason = %abort,
                backtrace = %Backtrace::force_capture(),
                "possible livelock: unit keeps aborting"
            );
        }
        unit.last_abort = Some(abort);
    }

    /// The closure finished but a multi-server commit must land first.
    pub fn await_commit(&mut self, transaction: TransactionId, reason: &str) {
        if let Some(unit) = self.units.iter_mut().find(|u| u.transaction == transaction) {
            unit.state = UnitState::AwaitingCommit;
            unit.requires_multi_server_commit = true;
            unit.multi_server_commit_reason = Some(reason.to_string());
        }
    }

    pub fn complete(&mut self, transaction: TransactionId) -> Option<WorkUnit> {
        let index = self.units.iter().position(|u| u.transaction == transaction)?;
        let unit = self.units.remove(index);
        self.stats.completed += 1;
        tracing::debug!(
            unit = %unit.name,
            %transaction,
            attempts = unit.execution_attempts,
            "work completed"
        );
        Some(unit)
    }

    pub fn abandon(&mut self, transaction: TransactionId, description: &str) -> Option<WorkUnit> {
        let index = self.units.iter().position(|u| u.transaction == transaction)?;
        let unit = self.units.remove(index);
        self.stats.abandoned += 1;
        tracing::warn!(unit = %unit.name, %transaction, reason = description, "work abandoned");
        Some(unit)
    }
}
