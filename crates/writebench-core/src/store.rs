// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Byte-budgeted memory store and the action application protocol.
//!
//! The store owns every retained item and is the only mutation path:
//! policies describe what they want as [`MemoryAction`]s and the store
//! validates each one completely before touching any state. A rejected
//! action leaves the store byte-for-byte unchanged.
//!
//! Invariants maintained after every successful application:
//!
//! - The sum of item byte costs equals `bytes_used`, and
//!   `bytes_used <= max_bytes`.
//! - Every DELTA's parent timestep is present and holds a BASE.
//! - A DELTA never chains to another DELTA.
//! - A DELTA and its parent BASE carry equal endpoint identity.
//! - At most one item per timestep.
//!
//! DELTA children are indexed as a backlink from the parent timestep,
//! so "expire a BASE with surviving children" is refused in constant
//! time and no owning reference cycle exists: the map owns the items,
//! DELTAs hold a by-value parent key.

use crate::action::{canonical_delta, ActionKind, MemoryAction, ENDPOINT_KEY};
use crate::episode::Step;
use crate::estimator::{estimate_delta_bytes, estimate_step_bytes};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Whether an item is a full stored step or a partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// A full step stored by WRITE.
    Base,
    /// A partial update stored by MERGE, tied to a BASE parent.
    Delta,
}

#[derive(Debug, Clone, PartialEq)]
enum ItemPayload {
    Base,
    Delta {
        parent_t: u64,
        delta: Map<String, Value>,
    },
}

/// One retained item. Immutable after creation: MERGE adds a new DELTA
/// item, it never edits the BASE.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryItem {
    step: Step,
    written_at: u64,
    byte_cost: u64,
    payload: ItemPayload,
}

impl MemoryItem {
    /// Timestep this item occupies (its step's timestep).
    #[must_use]
    pub fn t(&self) -> u64 {
        self.step.t
    }

    /// The originating step.
    #[must_use]
    pub fn step(&self) -> &Step {
        &self.step
    }

    /// Timestep at which the item was inserted.
    #[must_use]
    pub fn written_at(&self) -> u64 {
        self.written_at
    }

    /// Exact bytes charged at insertion.
    #[must_use]
    pub fn byte_cost(&self) -> u64 {
        self.byte_cost
    }

    /// BASE or DELTA.
    #[must_use]
    pub fn kind(&self) -> ItemKind {
        match self.payload {
            ItemPayload::Base => ItemKind::Base,
            ItemPayload::Delta { .. } => ItemKind::Delta,
        }
    }

    /// Parent timestep, for DELTA items.
    #[must_use]
    pub fn merge_parent_t(&self) -> Option<u64> {
        match self.payload {
            ItemPayload::Base => None,
            ItemPayload::Delta { parent_t, .. } => Some(parent_t),
        }
    }

    /// The canonical delta mapping, for DELTA items.
    #[must_use]
    pub fn delta(&self) -> Option<&Map<String, Value>> {
        match &self.payload {
            ItemPayload::Base => None,
            ItemPayload::Delta { delta, .. } => Some(delta),
        }
    }
}

/// Why an action was rejected. Rejections are not errors: the driver
/// counts them and the policy continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// WRITE or MERGE targeting a timestep already in the store.
    #[error("timestep {t} already present")]
    DuplicateTimestep {
        /// Occupied timestep.
        t: u64,
    },
    /// WRITE or MERGE whose cost exceeds the remaining budget.
    #[error("needs {needed} bytes, {remaining} remaining")]
    InsufficientBudget {
        /// Bytes the action would charge.
        needed: u64,
        /// Bytes currently available.
        remaining: u64,
    },
    /// MERGE or EXPIRE naming a timestep that is not in the store.
    #[error("no item at timestep {target_t}")]
    MissingTarget {
        /// Requested timestep.
        target_t: u64,
    },
    /// MERGE onto a DELTA item.
    #[error("merge target at {target_t} is a delta")]
    TargetIsDelta {
        /// Requested timestep.
        target_t: u64,
    },
    /// MERGE where either observation lacks endpoint identity.
    #[error("observation at timestep {t} has no endpoint identity")]
    MissingEndpoint {
        /// Timestep of the observation without an `api` field.
        t: u64,
    },
    /// MERGE across different endpoints.
    #[error("endpoint identity differs from base at {target_t}")]
    EndpointMismatch {
        /// The base's timestep.
        target_t: u64,
    },
    /// MERGE whose canonical delta is empty.
    #[error("canonical delta is empty")]
    EmptyDelta,
    /// MERGE whose supplied delta differs from the canonical delta.
    #[error("supplied delta differs from canonical delta")]
    DeltaMismatch,
    /// EXPIRE of the current or a future timestep.
    #[error("timestep {target_t} is not older than current step {current_t}")]
    NotYetExpirable {
        /// Requested timestep.
        target_t: u64,
        /// The store's current timestep.
        current_t: u64,
    },
    /// EXPIRE of a BASE that still has DELTA children.
    #[error("base at {target_t} has surviving delta children")]
    HasLiveDeltas {
        /// Requested timestep.
        target_t: u64,
    },
}

/// Fatal store corruption. Indicates an implementation bug, never a
/// policy mistake; the driver aborts the run.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A post-apply integrity check found an invariant violated.
    #[error("[WB_STORE_CORRUPT] internal invariant violated: {0}")]
    Corruption(&'static str),
}

/// Budget-tracked collection of retained items.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    max_bytes: u64,
    bytes_used: u64,
    current_t: u64,
    items: BTreeMap<u64, MemoryItem>,
    insertion: Vec<u64>,
    children: FxHashMap<u64, BTreeSet<u64>>,
}

impl MemoryStore {
    /// Creates an empty store with the given byte budget.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            bytes_used: 0,
            current_t: 0,
            items: BTreeMap::new(),
            insertion: Vec::new(),
            children: FxHashMap::default(),
        }
    }

    /// The byte budget.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes currently charged.
    #[must_use]
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    /// Bytes still available.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.max_bytes - self.bytes_used
    }

    /// Advances the store to timestep `t`. The driver calls this once
    /// per step before requesting actions; EXPIRE only accepts targets
    /// strictly older than the current timestep.
    pub fn begin_step(&mut self, t: u64) {
        self.current_t = t;
    }

    /// The current timestep.
    #[must_use]
    pub fn current_t(&self) -> u64 {
        self.current_t
    }

    /// Number of retained items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether an item occupies timestep `t`.
    #[must_use]
    pub fn contains(&self, t: u64) -> bool {
        self.items.contains_key(&t)
    }

    /// The item at timestep `t`, if any.
    #[must_use]
    pub fn get(&self, t: u64) -> Option<&MemoryItem> {
        self.items.get(&t)
    }

    /// Current items in timestep order.
    pub fn items(&self) -> impl Iterator<Item = &MemoryItem> {
        self.items.values()
    }

    /// The earliest-inserted item still present.
    #[must_use]
    pub fn oldest_item(&self) -> Option<&MemoryItem> {
        self.insertion.first().and_then(|t| self.items.get(t))
    }

    /// Applies one action. Returns `true` on success, `false` on
    /// rejection; never partially mutates state on rejection.
    pub fn apply(&mut self, action: &MemoryAction) -> bool {
        self.apply_checked(action).is_ok()
    }

    /// Applies one action, reporting the rejection reason on failure.
    ///
    /// All validation and the cost check precede any mutation, so a
    /// rejected action leaves `bytes_used`, the item set, and the
    /// insertion order untouched.
    pub fn apply_checked(&mut self, action: &MemoryAction) -> Result<ActionKind, RejectReason> {
        match action {
            MemoryAction::Skip => Ok(ActionKind::Skip),
            MemoryAction::Write { step } => {
                self.apply_write(step)?;
                Ok(ActionKind::Write)
            }
            MemoryAction::Merge {
                step,
                target_t,
                delta,
            } => {
                self.apply_merge(step, *target_t, delta.as_ref())?;
                Ok(ActionKind::Merge)
            }
            MemoryAction::Expire { target_t } => {
                self.apply_expire(*target_t)?;
                Ok(ActionKind::Expire)
            }
        }
    }

    fn apply_write(&mut self, step: &Step) -> Result<(), RejectReason> {
        if self.items.contains_key(&step.t) {
            return Err(RejectReason::DuplicateTimestep { t: step.t });
        }
        let needed = estimate_step_bytes(step);
        if needed > self.remaining() {
            return Err(RejectReason::InsufficientBudget {
                needed,
                remaining: self.remaining(),
            });
        }
        self.insert(MemoryItem {
            step: step.clone(),
            written_at: self.current_t,
            byte_cost: needed,
            payload: ItemPayload::Base,
        });
        Ok(())
    }

    fn apply_merge(
        &mut self,
        step: &Step,
        target_t: u64,
        supplied: Option<&Map<String, Value>>,
    ) -> Result<(), RejectReason> {
        let target = self
            .items
            .get(&target_t)
            .ok_or(RejectReason::MissingTarget { target_t })?;
        if target.kind() == ItemKind::Delta {
            return Err(RejectReason::TargetIsDelta { target_t });
        }
        let base_endpoint = target
            .step
            .observation
            .get(ENDPOINT_KEY)
            .ok_or(RejectReason::MissingEndpoint { t: target_t })?;
        let step_endpoint = step
            .observation
            .get(ENDPOINT_KEY)
            .ok_or(RejectReason::MissingEndpoint { t: step.t })?;
        if base_endpoint != step_endpoint {
            return Err(RejectReason::EndpointMismatch { target_t });
        }
        // Both observations carry the endpoint key, so both are objects
        // and the canonical delta is defined.
        let canonical = canonical_delta(&step.observation, &target.step.observation)
            .ok_or(RejectReason::EmptyDelta)?;
        if canonical.is_empty() {
            return Err(RejectReason::EmptyDelta);
        }
        if let Some(supplied) = supplied {
            if *supplied != canonical {
                return Err(RejectReason::DeltaMismatch);
            }
        }
        if self.items.contains_key(&step.t) {
            return Err(RejectReason::DuplicateTimestep { t: step.t });
        }
        let needed = estimate_delta_bytes(&canonical);
        if needed > self.remaining() {
            return Err(RejectReason::InsufficientBudget {
                needed,
                remaining: self.remaining(),
            });
        }
        self.insert(MemoryItem {
            step: step.clone(),
            written_at: self.current_t,
            byte_cost: needed,
            payload: ItemPayload::Delta {
                parent_t: target_t,
                delta: canonical,
            },
        });
        Ok(())
    }

    fn apply_expire(&mut self, target_t: u64) -> Result<(), RejectReason> {
        let item = self
            .items
            .get(&target_t)
            .ok_or(RejectReason::MissingTarget { target_t })?;
        if target_t >= self.current_t {
            return Err(RejectReason::NotYetExpirable {
                target_t,
                current_t: self.current_t,
            });
        }
        if item.kind() == ItemKind::Base
            && self.children.get(&target_t).is_some_and(|c| !c.is_empty())
        {
            return Err(RejectReason::HasLiveDeltas { target_t });
        }
        // Validation complete; now mutate.
        let item = self
            .items
            .remove(&target_t)
            .ok_or(RejectReason::MissingTarget { target_t })?;
        self.bytes_used -= item.byte_cost;
        self.insertion.retain(|&t| t != target_t);
        if let Some(parent_t) = item.merge_parent_t() {
            if let Some(children) = self.children.get_mut(&parent_t) {
                children.remove(&target_t);
                if children.is_empty() {
                    self.children.remove(&parent_t);
                }
            }
        }
        self.children.remove(&target_t);
        Ok(())
    }

    fn insert(&mut self, item: MemoryItem) {
        let t = item.t();
        if let Some(parent_t) = item.merge_parent_t() {
            self.children.entry(parent_t).or_default().insert(t);
        }
        self.bytes_used += item.byte_cost;
        self.items.insert(t, item);
        self.insertion.push(t);
    }

    /// Re-verifies every store invariant plus the children index. The driver
    /// runs this after every successful application; a failure means
    /// the store itself is buggy and the run must abort.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        let sum: u64 = self.items.values().map(MemoryItem::byte_cost).sum();
        if sum != self.bytes_used {
            return Err(StoreError::Corruption("byte accounting drifted"));
        }
        if self.bytes_used > self.max_bytes {
            return Err(StoreError::Corruption("budget exceeded"));
        }
        if self.insertion.len() != self.items.len() {
            return Err(StoreError::Corruption("insertion log out of sync"));
        }
        for t in &self.insertion {
            if !self.items.contains_key(t) {
                return Err(StoreError::Corruption("insertion log names absent item"));
            }
        }
        for item in self.items.values() {
            let Some(parent_t) = item.merge_parent_t() else {
                continue;
            };
            let Some(parent) = self.items.get(&parent_t) else {
                return Err(StoreError::Corruption("orphan delta"));
            };
            if parent.kind() != ItemKind::Base {
                return Err(StoreError::Corruption("delta chained to delta"));
            }
            if parent.step.observation.get(ENDPOINT_KEY)
                != item.step.observation.get(ENDPOINT_KEY)
            {
                return Err(StoreError::Corruption("endpoint identity broken"));
            }
            if !self
                .children
                .get(&parent_t)
                .is_some_and(|c| c.contains(&item.t()))
            {
                return Err(StoreError::Corruption("children index missing a delta"));
            }
        }
        for (parent_t, children) in &self.children {
            for child_t in children {
                let ok = self
                    .items
                    .get(child_t)
                    .is_some_and(|c| c.merge_parent_t() == Some(*parent_t));
                if !ok {
                    return Err(StoreError::Corruption("children index names a non-child"));
                }
            }
        }
        Ok(())
    }
}
