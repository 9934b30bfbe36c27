//! Multi-server commit coordinator.
//!
//! A server takes part in at most one commit at a time, either as the
//! initiator (its own unit finished with borrowed objects in its journal)
//! or as a participant (it lent objects to someone else's unit). Priority
//! decides every conflict: a participant accepts a `Begin` when idle or
//! busy with a weaker commit, which it aborts first, and denies it
//! otherwise. The initiator applies its journal only once every lender has
//! answered `Ready` with a state that matches its own view.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use ferry_core::wire::{CommitAbortReason, CommitId, CommitMode, ObjectState, CLOSED_COMMIT_MEMORY};
use ferry_core::{ObjectId, ServerId, TransactionId, WorkPriority};
use serde::Serialize;

use crate::channel::PeerSender;
use crate::registry::Registry;
use crate::server::EngineError;
use crate::txn::{CommitRequirement, Journal};

/// Our own commit in flight.
#[derive(Debug)]
pub struct InitiatedCommit {
    pub id: CommitId,
    pub priority: WorkPriority,
    pub mode: CommitMode,
    pub reason: String,
    /// Lender and the objects it lent us.
    pub participants: BTreeMap<ServerId, Vec<ObjectId>>,
    ready: BTreeMap<ServerId, Vec<ObjectState>>,
    journal: Journal,
    deadline: Instant,
}

impl InitiatedCommit {
    pub fn transaction(&self) -> TransactionId {
        self.id.transaction
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn touches(&self, object: ObjectId) -> bool {
        self.journal.touched.contains(&object)
    }
}

/// Someone else's commit we lent objects to.
#[derive(Debug, Clone)]
pub struct ServicedCommit {
    pub id: CommitId,
    pub priority: WorkPriority,
    pub mode: CommitMode,
    pub objects: Vec<ObjectId>,
    deadline: Instant,
}

#[derive(Debug)]
enum Active {
    Initiating(InitiatedCommit),
    Servicing(ServicedCommit),
}

impl Active {
    fn priority(&self) -> WorkPriority {
        match self {
            Active::Initiating(c) => c.priority,
            Active::Servicing(c) => c.priority,
        }
    }

    fn id(&self) -> CommitId {
        match self {
            Active::Initiating(c) => c.id,
            Active::Servicing(c) => c.id,
        }
    }
}

/// A commit this server no longer tracks. Late verbs for it are ignored,
/// except a `Commit` for one we had accepted: the initiator's decision
/// stands even if we were pre-empted after saying ready.
#[derive(Debug, Clone)]
struct ClosedCommit {
    id: CommitId,
    lent: Option<ServicedCommit>,
}

/// Our role, for status reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum CommitRole {
    Idle,
    Initiating { commit: String, ready: usize, participants: usize },
    Servicing { commit: String, initiator: ServerId },
}

/// What the server must do once an initiated commit resolves.
#[derive(Debug)]
pub enum CommitOutcome {
    /// Apply the journal and complete the unit.
    Committed {
        transaction: TransactionId,
        journal: Journal,
        mode: CommitMode,
        borrowed: Vec<ObjectId>,
    },
    /// Drop the journal; the unit retries.
    Aborted {
        transaction: TransactionId,
        reason: String,
    },
}

/// Result of starting a commit.
#[derive(Debug)]
pub enum Begun {
    /// Nothing was borrowed after all; apply directly.
    NoParticipants(Journal),
    Started(CommitId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    pub committed: u64,
    pub aborted: u64,
    pub denied: u64,
    pub serviced: u64,
}

pub struct CommitCoordinator {
    local: ServerId,
    timeout: Duration,
    active: Option<Active>,
    closed: VecDeque<ClosedCommit>,
    stats: CommitStats,
}

impl CommitCoordinator {
    pub fn new(local: ServerId, timeout: Duration) -> Self {
        Self {
            local,
            timeout,
            active: None,
            closed: VecDeque::new(),
            stats: CommitStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn stats(&self) -> CommitStats {
        self.stats
    }

    pub fn initiated(&self) -> Option<&InitiatedCommit> {
        match &self.active {
            Some(Active::Initiating(c)) => Some(c),
            _ => None,
        }
    }

    pub fn serviced(&self) -> Option<&ServicedCommit> {
        match &self.active {
            Some(Active::Servicing(c)) => Some(c),
            _ => None,
        }
    }

    pub fn role(&self) -> CommitRole {
        match &self.active {
            None => CommitRole::Idle,
            Some(Active::Initiating(c)) => CommitRole::Initiating {
                commit: c.id.to_string(),
                ready: c.ready.len(),
                participants: c.participants.len(),
            },
            Some(Active::Servicing(c)) => CommitRole::Servicing {
                commit: c.id.to_string(),
                initiator: c.id.initiator,
            },
        }
    }

    // ── Initiator side ────────────────────────────────────────────────────────

    /// Start a commit for a unit whose closure has finished.
    ///
    /// Participants are the owners of every touched object we do not own.
    pub fn begin(
        &mut self,
        transaction: TransactionId,
        attempt: u32,
        priority: WorkPriority,
        requirement: CommitRequirement,
        journal: Journal,
        registry: &Registry,
        sender: &PeerSender,
    ) -> Begun {
        let mut participants: BTreeMap<ServerId, Vec<ObjectId>> = BTreeMap::new();
        for object in journal.borrowed(registry) {
            let owner = registry.owner_of(object);
            if owner == self.local || !owner.is_valid() {
                continue;
            }
            participants.entry(owner).or_default().push(object);
        }
        if participants.is_empty() {
            return Begun::NoParticipants(journal);
        }

        let id = CommitId {
            initiator: self.local,
            transaction,
            attempt,
        };
        for (participant, objects) in &participants {
            sender.begin(*participant, id, priority, objects.clone(), requirement.mode);
        }
        tracing::info!(
            commit = %id,
            %priority,
            participants = participants.len(),
            mode = ?requirement.mode,
            reason = %requirement.reason,
            "multi-server commit started"
        );

        self.active = Some(Active::Initiating(InitiatedCommit {
            id,
            priority,
            mode: requirement.mode,
            reason: requirement.reason,
            participants,
            ready: BTreeMap::new(),
            journal,
            deadline: Instant::now() + self.timeout,
        }));
        Begun::Started(id)
    }

    pub fn handle_ready(
        &mut self,
        from: ServerId,
        commit: CommitId,
        states: Vec<ObjectState>,
        registry: &Registry,
        sender: &PeerSender,
    ) -> Result<Option<CommitOutcome>, EngineError> {
        let Some(Active::Initiating(current)) = &mut self.active else {
            return self.late_or_violation("ready", commit, from).map(|_| None);
        };
        if current.id != commit {
            return self.late_or_violation("ready", commit, from).map(|_| None);
        }
        if !current.participants.contains_key(&from) {
            return Err(EngineError::ProtocolViolation {
                verb: "ready",
                commit,
                from,
            });
        }
        current.ready.insert(from, states);
        if current.ready.len() < current.participants.len() {
            return Ok(None);
        }

        if let Some(stale) = current
            .ready
            .values()
            .flatten()
            .find(|s| s.serial > registry.last_known_serial(s.object) || s.owner != registry.owner_of(s.object))
        {
            let reason = format!("stale view of {}", stale.object);
            return Ok(self.abort_initiated(sender, reason, None));
        }

        let Some(Active::Initiating(done)) = self.active.take() else {
            return Ok(None);
        };
        for participant in done.participants.keys() {
            sender.commit(*participant, done.id);
        }
        self.remember(done.id, None);
        self.stats.committed += 1;
        tracing::info!(commit = %done.id, "multi-server commit landed");

        let borrowed = done.participants.into_values().flatten().collect();
        Ok(Some(CommitOutcome::Committed {
            transaction: done.id.transaction,
            journal: done.journal,
            mode: done.mode,
            borrowed,
        }))
    }

    /// Abort our own commit if one of its objects just left.
    pub fn abort_for_departure(
        &mut self,
        departed: &[ObjectId],
        sender: &PeerSender,
    ) -> Option<CommitOutcome> {
        let hit = self
            .initiated()
            .and_then(|c| departed.iter().copied().find(|id| c.touches(*id)))?;
        self.abort_initiated(sender, format!("{hit} left during commit"), None)
    }

    fn abort_initiated(
        &mut self,
        sender: &PeerSender,
        reason: String,
        except: Option<ServerId>,
    ) -> Option<CommitOutcome> {
        let Some(Active::Initiating(current)) = self.active.take() else {
            return None;
        };
        for participant in current.participants.keys() {
            if Some(*participant) != except {
                sender.abort(*participant, current.id, CommitAbortReason::InitiatorAborted);
            }
        }
        self.remember(current.id, None);
        self.stats.aborted += 1;
        tracing::info!(commit = %current.id, reason = %reason, "multi-server commit aborted");
        Some(CommitOutcome::Aborted {
            transaction: current.id.transaction,
            reason,
        })
    }

    // ── Participant side ──────────────────────────────────────────────────────

    /// A lender's view of an incoming `Begin`.
    ///
    /// Returns an outcome when accepting pre-empted our own commit.
    pub fn handle_begin(
        &mut self,
        from: ServerId,
        commit: CommitId,
        priority: WorkPriority,
        objects: Vec<ObjectId>,
        mode: CommitMode,
        registry: &Registry,
        sender: &PeerSender,
    ) -> Option<CommitOutcome> {
        if self.is_closed(commit) {
            tracing::debug!(commit = %commit, "begin for closed commit ignored");
            return None;
        }

        let mut outcome = None;
        match &self.active {
            Some(Active::Servicing(current)) if current.id == commit => {
                // Duplicate begin: answer again.
                sender.ready(from, commit, lender_states(registry, &objects));
                return None;
            }
            Some(Active::Servicing(current)) if supersedes(commit, current.id) => {
                let old = current.clone();
                self.remember(old.id, Some(old));
            }
            Some(active) if active.priority() < priority => {
                outcome = self.preempt(commit, sender);
            }
            Some(active) => {
                tracing::debug!(
                    commit = %commit,
                    holding = %active.id(),
                    "begin denied, servicing stronger commit"
                );
                sender.abort(from, commit, CommitAbortReason::Denied);
                self.remember(commit, None);
                self.stats.denied += 1;
                return None;
            }
            None => {}
        }

        sender.ready(from, commit, lender_states(registry, &objects));
        tracing::debug!(commit = %commit, objects = objects.len(), "servicing commit");
        self.active = Some(Active::Servicing(ServicedCommit {
            id: commit,
            priority,
            mode,
            objects,
            deadline: Instant::now() + self.timeout,
        }));
        outcome
    }

    /// Give up whatever we are doing for a stronger commit.
    fn preempt(&mut self, by: CommitId, sender: &PeerSender) -> Option<CommitOutcome> {
        match self.active.take()? {
            Active::Initiating(current) => {
                self.active = Some(Active::Initiating(current));
                self.abort_initiated(sender, format!("pre-empted by {by}"), None)
            }
            Active::Servicing(current) => {
                sender.abort(current.id.initiator, current.id, CommitAbortReason::Preempted);
                tracing::debug!(commit = %current.id, by = %by, "serviced commit pre-empted");
                self.remember(current.id, Some(current));
                None
            }
        }
    }

    pub fn handle_commit(
        &mut self,
        from: ServerId,
        commit: CommitId,
        registry: &mut Registry,
    ) -> Result<(), EngineError> {
        let serviced = match &self.active {
            Some(Active::Servicing(current)) if current.id == commit => {
                if from != current.id.initiator {
                    return Err(EngineError::ProtocolViolation {
                        verb: "commit",
                        commit,
                        from,
                    });
                }
                match self.active.take() {
                    Some(Active::Servicing(current)) => current,
                    _ => return Ok(()),
                }
            }
            _ => {
                let late = self
                    .closed
                    .iter()
                    .find(|c| c.id == commit)
                    .map(|c| c.lent.clone());
                match late {
                    Some(Some(lent)) => lent,
                    Some(None) => return Ok(()),
                    None => {
                        return Err(EngineError::ProtocolViolation {
                            verb: "commit",
                            commit,
                            from,
                        })
                    }
                }
            }
        };

        if serviced.mode == CommitMode::TransferAuthority {
            for object in &serviced.objects {
                if registry.owner_of(*object) == self.local {
                    registry.set_owner(*object, serviced.id.initiator);
                }
            }
        }
        self.stats.serviced += 1;
        tracing::debug!(commit = %commit, mode = ?serviced.mode, "serviced commit landed");
        self.forget(commit);
        self.remember(commit, None);
        Ok(())
    }

    pub fn handle_abort(
        &mut self,
        from: ServerId,
        commit: CommitId,
        reason: CommitAbortReason,
        sender: &PeerSender,
    ) -> Result<Option<CommitOutcome>, EngineError> {
        match &self.active {
            Some(Active::Initiating(current)) if current.id == commit => {
                if !current.participants.contains_key(&from) {
                    return Err(EngineError::ProtocolViolation {
                        verb: "abort",
                        commit,
                        from,
                    });
                }
                let why = format!("{from} answered {reason:?}");
                Ok(self.abort_initiated(sender, why, Some(from)))
            }
            Some(Active::Servicing(current)) if current.id == commit => {
                if from != current.id.initiator {
                    return Err(EngineError::ProtocolViolation {
                        verb: "abort",
                        commit,
                        from,
                    });
                }
                self.active = None;
                self.remember(commit, None);
                tracing::debug!(commit = %commit, ?reason, "serviced commit aborted by initiator");
                Ok(None)
            }
            _ => self.late_or_violation("abort", commit, from).map(|_| None),
        }
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    /// Expire commits whose deadline has passed.
    pub fn expire(&mut self, now: Instant, sender: &PeerSender) -> Option<CommitOutcome> {
        match &self.active {
            Some(Active::Initiating(current)) if now >= current.deadline => {
                let waiting: Vec<ServerId> = current
                    .participants
                    .keys()
                    .filter(|p| !current.ready.contains_key(*p))
                    .copied()
                    .collect();
                tracing::warn!(commit = %current.id, ?waiting, "commit timed out waiting for ready");
                self.abort_initiated(sender, "timed out".to_string(), None)
            }
            Some(Active::Servicing(current)) if now >= current.deadline => {
                tracing::warn!(commit = %current.id, "initiator went quiet, releasing commit");
                let id = current.id;
                self.active = None;
                self.remember(id, None);
                None
            }
            _ => None,
        }
    }

    fn is_closed(&self, commit: CommitId) -> bool {
        self.closed.iter().any(|c| c.id == commit)
    }

    fn late_or_violation(&self, verb: &'static str, commit: CommitId, from: ServerId) -> Result<(), EngineError> {
        if self.is_closed(commit) {
            tracing::debug!(verb, commit = %commit, from = %from, "late verb for closed commit ignored");
            Ok(())
        } else {
            Err(EngineError::ProtocolViolation { verb, commit, from })
        }
    }

    fn remember(&mut self, id: CommitId, lent: Option<ServicedCommit>) {
        self.closed.push_back(ClosedCommit { id, lent });
        while self.closed.len() > CLOSED_COMMIT_MEMORY {
            self.closed.pop_front();
        }
    }

    fn forget(&mut self, id: CommitId) {
        self.closed.retain(|c| c.id != id);
    }
}

/// A newer attempt of the same unit replaces the one we hold.
fn supersedes(incoming: CommitId, held: CommitId) -> bool {
    incoming.initiator == held.initiator
        && incoming.transaction == held.transaction
        && incoming.attempt > held.attempt
}

fn lender_states(registry: &Registry, objects: &[ObjectId]) -> Vec<ObjectState> {
    objects
        .iter()
        .map(|&object| ObjectState {
            object,
            serial: registry.last_known_serial(object),
            owner: registry.owner_of(object),
        })
        .collect()
}
