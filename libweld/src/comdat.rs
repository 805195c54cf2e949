//! Comdat group deduplication. Multiple objects may declare a group with the same signature
//! (typically a template instantiation); exactly one declaring file keeps its copy and every
//! other file kills the sections its group listed.

use crate::context::Context;
use object::LittleEndian;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Slot of a group in the comdat map.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ComdatGroupId(pub(crate) u32);

pub(crate) struct ComdatGroup {
    /// Priority of the owning file. Unclaimed groups hold `u32::MAX`; claiming is a min-CAS so
    /// the terminal owner is the lowest declaring priority regardless of arrival order.
    owner: AtomicU32,
}

pub(crate) const COMDAT_UNCLAIMED: u32 = u32::MAX;

impl ComdatGroup {
    pub(crate) fn new() -> Self {
        Self {
            owner: AtomicU32::new(COMDAT_UNCLAIMED),
        }
    }

    pub(crate) fn claim(&self, priority: u32) {
        let mut current = self.owner.load(Ordering::Relaxed);
        while current == COMDAT_UNCLAIMED || current > priority {
            match self.owner.compare_exchange_weak(
                current,
                priority,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }

    pub(crate) fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }
}

/// Every loaded file races to claim each of its groups.
#[tracing::instrument(skip_all, name = "Resolve comdat groups")]
pub(crate) fn resolve_comdat_groups(ctx: &Context) {
    ctx.for_each_object(|file| {
        if !file.is_alive() {
            return;
        }
        for (group_id, _) in &file.comdat_groups {
            ctx.comdat_groups.value(group_id.0).claim(file.priority);
        }
    });
}

/// Files that lost a group kill every section the group listed.
#[tracing::instrument(skip_all, name = "Eliminate duplicate comdat groups")]
pub(crate) fn eliminate_duplicate_comdat_groups(ctx: &Context) {
    ctx.for_each_object(|file| {
        if !file.is_alive() {
            return;
        }
        for (group_id, members) in &file.comdat_groups {
            if ctx.comdat_groups.value(group_id.0).owner() == file.priority {
                continue;
            }
            for entry in *members {
                let section_index = entry.get(LittleEndian) as usize;
                if let Some(Some(section)) = file.sections.get(section_index) {
                    section.kill();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_priority_wins_regardless_of_order() {
        let group = ComdatGroup::new();
        assert_eq!(group.owner(), COMDAT_UNCLAIMED);
        group.claim(5);
        group.claim(2);
        group.claim(9);
        assert_eq!(group.owner(), 2);

        let group = ComdatGroup::new();
        group.claim(2);
        group.claim(5);
        assert_eq!(group.owner(), 2);
    }

    #[test]
    fn concurrent_claims_converge_to_minimum() {
        let group = ComdatGroup::new();
        std::thread::scope(|scope| {
            for priority in [9u32, 3, 7, 4, 11, 3, 5] {
                let group = &group;
                scope.spawn(move || group.claim(priority));
            }
        });
        assert_eq!(group.owner(), 3);
    }
}
