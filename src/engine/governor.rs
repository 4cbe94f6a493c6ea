//! Concurrency governor: one FIFO admission gate per concurrency group.
//!
//! A gate counts active permits against a limit. Callers that cannot be
//! admitted queue in arrival order; a release hands the freed slot directly
//! to the oldest waiter, so a later caller never overtakes an earlier one
//! while the gate is saturated. Permits release on drop.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use super::context::CallContext;
use crate::tools::ConcurrencyGroup;
use crate::types::{Error, GroupId, Result, UngroupedPolicy};

/// Which gate an invocation is admitted through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateKey {
    Group(GroupId),
    /// Implicit gate for tools without a concurrency group.
    Ungrouped,
}

/// Point-in-time view of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    pub limit: usize,
    pub active: usize,
    pub waiting: usize,
}

// =============================================================================
// Gate
// =============================================================================

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct GateState {
    limit: usize,
    active: usize,
    next_ticket: u64,
    waiters: VecDeque<Waiter>,
}

impl GateState {
    /// Hand free slots to queued waiters, oldest first.
    fn admit_waiters(&mut self) {
        while self.active < self.limit {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // A closed receiver means the waiter is being torn down right now;
            // its ticket is gone from the queue, so it will not claim a slot.
            if waiter.tx.send(()).is_ok() {
                self.active += 1;
            }
        }
    }

    fn release_one(&mut self) {
        self.active = self.active.saturating_sub(1);
        self.admit_waiters();
    }
}

/// Counting gate with strict FIFO admission.
#[derive(Debug)]
struct Gate {
    key: GateKey,
    state: Mutex<GateState>,
}

impl Gate {
    fn new(key: GateKey, limit: usize) -> Self {
        Self {
            key,
            state: Mutex::new(GateState {
                limit: limit.max(1),
                active: 0,
                next_ticket: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_limit(&self, limit: usize) {
        let mut state = self.lock();
        state.limit = limit.max(1);
        state.admit_waiters();
    }

    fn snapshot(&self) -> GateSnapshot {
        let state = self.lock();
        GateSnapshot {
            limit: state.limit,
            active: state.active,
            waiting: state.waiters.len(),
        }
    }

    async fn acquire(self: Arc<Self>, ctx: &CallContext) -> Result<Permit> {
        if ctx.is_done() {
            return Err(ctx.done().await);
        }

        let mut queued = {
            let mut state = self.lock();
            if state.waiters.is_empty() && state.active < state.limit {
                state.active += 1;
                return Ok(Permit { gate: self.clone() });
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { ticket, tx });
            tracing::debug!(
                gate = ?self.key,
                ticket,
                queued = state.waiters.len(),
                "waiting for concurrency slot"
            );
            QueuedTicket {
                gate: self.clone(),
                ticket,
                rx,
                armed: true,
            }
        };

        tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            granted = &mut queued.rx => match granted {
                Ok(()) => {
                    queued.armed = false;
                    Ok(Permit { gate: self.clone() })
                }
                Err(_) => Err(Error::internal("concurrency gate dropped a queued waiter")),
            },
        }
        // `queued` drops here; if still armed it withdraws the ticket or
        // returns a slot that was granted after the caller gave up.
    }
}

/// A queued acquisition. Keeps the receiver alive until the gate lock is
/// held on teardown, so a grant is either observed here or never sent.
#[derive(Debug)]
struct QueuedTicket {
    gate: Arc<Gate>,
    ticket: u64,
    rx: oneshot::Receiver<()>,
    armed: bool,
}

impl Drop for QueuedTicket {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.gate.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.ticket == self.ticket) {
            state.waiters.remove(pos);
        } else {
            // Granted between the caller giving up and this drop.
            state.release_one();
        }
    }
}

/// An admitted slot. Released exactly once, when dropped.
#[derive(Debug)]
pub struct Permit {
    gate: Arc<Gate>,
}

impl Permit {
    pub fn key(&self) -> GateKey {
        self.gate.key
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.lock().release_one();
    }
}

// =============================================================================
// Governor
// =============================================================================

/// Maps concurrency groups to their admission gates.
#[derive(Debug)]
pub struct ConcurrencyGovernor {
    groups: Mutex<HashMap<GroupId, Arc<Gate>>>,
    /// `None` when ungrouped tools are unbounded.
    ungrouped: Option<Arc<Gate>>,
}

impl ConcurrencyGovernor {
    pub fn new(policy: UngroupedPolicy) -> Self {
        let ungrouped = match policy {
            UngroupedPolicy::Unbounded => None,
            UngroupedPolicy::Shared { max_concurrency } => {
                Some(Arc::new(Gate::new(GateKey::Ungrouped, max_concurrency)))
            }
        };
        Self {
            groups: Mutex::new(HashMap::new()),
            ungrouped,
        }
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<GroupId, Arc<Gate>>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gate for a group, created on first use. A changed `max_concurrency`
    /// on the record applies to admissions from now on.
    fn gate_for(&self, group: &ConcurrencyGroup) -> Arc<Gate> {
        let mut groups = self.groups();
        let gate = groups
            .entry(group.id)
            .or_insert_with(|| Arc::new(Gate::new(GateKey::Group(group.id), group.max_concurrency)))
            .clone();
        drop(groups);

        if gate.snapshot().limit != group.max_concurrency.max(1) {
            tracing::info!(
                group = %group.id,
                limit = group.max_concurrency,
                "concurrency group limit changed"
            );
            gate.set_limit(group.max_concurrency);
        }
        gate
    }

    /// Wait for a slot in `group` (or the ungrouped gate).
    ///
    /// Returns `Cancelled` if the caller gives up first; a cancelled caller
    /// never holds a slot.
    pub async fn acquire(
        &self,
        group: Option<&ConcurrencyGroup>,
        ctx: &CallContext,
    ) -> Result<Option<Permit>> {
        let gate = match group {
            Some(group) => self.gate_for(group),
            None => match &self.ungrouped {
                Some(gate) => gate.clone(),
                None => {
                    if ctx.is_done() {
                        return Err(ctx.done().await);
                    }
                    return Ok(None);
                }
            },
        };
        let permit = gate.acquire(ctx).await?;
        tracing::debug!(gate = ?permit.key(), "concurrency slot acquired");
        Ok(Some(permit))
    }

    /// Change a live group's limit without waiting for the next admission.
    ///
    /// Permits already granted are kept; a lower limit only holds back new
    /// admissions. Returns false if the group has no gate yet (its first
    /// admission will read the limit from the record).
    pub fn resize(&self, group: GroupId, limit: usize) -> bool {
        let Some(gate) = self.groups().get(&group).cloned() else {
            return false;
        };
        tracing::info!(group = %group, limit, "concurrency group resized");
        gate.set_limit(limit);
        true
    }

    /// Forget a group's gate. Permits already granted release into the old gate.
    pub fn reset(&self, group: GroupId) -> bool {
        self.groups().remove(&group).is_some()
    }

    pub fn snapshot(&self, key: GateKey) -> Option<GateSnapshot> {
        match key {
            GateKey::Group(id) => self.groups().get(&id).map(|g| g.snapshot()),
            GateKey::Ungrouped => self.ungrouped.as_ref().map(|g| g.snapshot()),
        }
    }
}

impl Default for ConcurrencyGovernor {
    fn default() -> Self {
        Self::new(UngroupedPolicy::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
