//! Ordered list of recall units hanging off one channel or audio.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::recall_unit::{RecallHandle, UnitList};

/// Templates and instances attached to a node, in insertion order.
///
/// Cloning shares the list. Finished units remove themselves through a
/// weak back-reference, so walks never see a unit after its `done` or
/// `cancel` returned.
#[derive(Clone, Default)]
pub struct RecallList {
    units: Arc<UnitList>,
}

impl RecallList {
    pub fn new() -> Self {
        Self {
            units: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append `unit`. Adding a unit already present is a no-op.
    pub fn add(&self, unit: RecallHandle) {
        {
            let mut units = self.units.lock();
            if units.iter().any(|u| Arc::ptr_eq(u, &unit)) {
                return;
            }
            units.push(unit.clone());
        }
        unit.attach(Arc::downgrade(&self.units));
    }

    pub fn remove(&self, unit: &RecallHandle) -> bool {
        let removed = {
            let mut units = self.units.lock();
            let before = units.len();
            units.retain(|u| !Arc::ptr_eq(u, unit));
            units.len() != before
        };
        if removed {
            unit.clear_owner(&self.units);
        }
        removed
    }

    /// Copy of the current members, safe to iterate while units detach.
    pub fn snapshot(&self) -> Vec<RecallHandle> {
        self.units.lock().clone()
    }

    pub fn templates(&self) -> Vec<RecallHandle> {
        self.filter(|u| u.is_template())
    }

    /// Instances bound to recall id `recall_id`.
    pub fn instances(&self, recall_id: u64) -> Vec<RecallHandle> {
        self.filter(|u| u.recall_id().is_some_and(|r| r.id == recall_id))
    }

    /// Members sharing container `container`.
    pub fn container(&self, container: u64) -> Vec<RecallHandle> {
        self.filter(|u| u.container() == container)
    }

    /// Whether every instance of `recall_id` still in the list finished.
    pub fn is_done(&self, recall_id: u64) -> bool {
        self.instances(recall_id)
            .iter()
            .all(|u| u.state().is_finished())
    }

    pub fn len(&self) -> usize {
        self.units.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.lock().is_empty()
    }

    fn filter(&self, keep: impl Fn(&RecallHandle) -> bool) -> Vec<RecallHandle> {
        self.units.lock().iter().filter(|u| keep(u)).cloned().collect()
    }
}

impl std::fmt::Debug for RecallList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.units.lock().iter()).finish()
    }
}
