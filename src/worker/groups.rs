//! In-process group concurrency. Best effort and per node; the store-backed
//! `FetchOptions::group_concurrency` is the cross-node limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::job::{GroupConcurrency, Job};

#[derive(Debug)]
pub struct LocalGroups {
    limits: GroupConcurrency,
    active: Mutex<HashMap<String, Slot>>,
}

/// Held permits of one group and the limit they were granted under.
#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u32,
    limit: u32,
}

/// One slot of a group's local limit, released on drop.
#[derive(Debug)]
pub struct GroupPermit {
    groups: Arc<LocalGroups>,
    group_id: String,
}

impl Drop for GroupPermit {
    fn drop(&mut self) {
        let mut active = self.groups.lock();
        if let Some(slot) = active.get_mut(&self.group_id) {
            slot.count = slot.count.saturating_sub(1);
            if slot.count == 0 {
                active.remove(&self.group_id);
            }
        }
    }
}

/// Split of a claimed batch.
#[derive(Debug, Default)]
pub struct Admission {
    pub admitted: Vec<Job>,
    /// Held until the admitted jobs settle.
    pub permits: Vec<GroupPermit>,
    /// Jobs over their group's limit, to be returned to the queue.
    pub excess: Vec<Uuid>,
}

impl LocalGroups {
    pub fn new(limits: GroupConcurrency) -> Arc<Self> {
        Arc::new(Self {
            limits,
            active: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Jobs currently holding a slot of `group_id`.
    pub fn active(&self, group_id: &str) -> u32 {
        self.lock().get(group_id).map_or(0, |slot| slot.count)
    }

    /// Groups with every local slot taken, to exclude from the next fetch.
    pub fn saturated(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, slot)| slot.count >= slot.limit)
            .map(|(group_id, _)| group_id.clone())
            .collect();
        groups.sort();
        groups
    }

    pub fn try_acquire(self: &Arc<Self>, group_id: &str, tier: Option<&str>) -> Option<GroupPermit> {
        let limit = self.limits.limit_for(tier);
        let mut active = self.lock();
        let slot = active
            .entry(group_id.to_string())
            .or_insert(Slot { count: 0, limit });
        slot.limit = limit;
        if slot.count >= limit {
            if slot.count == 0 {
                active.remove(group_id);
            }
            return None;
        }
        slot.count += 1;
        Some(GroupPermit {
            groups: Arc::clone(self),
            group_id: group_id.to_string(),
        })
    }

    /// Admit jobs in order; ungrouped jobs always pass.
    pub fn admit(self: &Arc<Self>, jobs: Vec<Job>) -> Admission {
        let mut admission = Admission::default();
        for job in jobs {
            let Some(ref group_id) = job.group_id else {
                admission.admitted.push(job);
                continue;
            };
            match self.try_acquire(group_id, job.group_tier.as_deref()) {
                Some(permit) => {
                    admission.permits.push(permit);
                    admission.admitted.push(job);
                }
                None => admission.excess.push(job.id),
            }
        }
        admission
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(group: Option<&str>, tier: Option<&str>) -> Job {
        Job {
            id: Uuid::now_v7(),
            name: "q".into(),
            data: serde_json::Value::Null,
            expire_in_seconds: 60,
            group_id: group.map(String::from),
            group_tier: tier.map(String::from),
            metadata: None,
        }
    }

    #[test]
    fn excess_beyond_limit() {
        let groups = LocalGroups::new(GroupConcurrency::new(2));
        let admission = groups.admit(vec![
            job(Some("g"), None),
            job(Some("g"), None),
            job(Some("g"), None),
            job(None, None),
        ]);
        assert_eq!(admission.admitted.len(), 3);
        assert_eq!(admission.excess.len(), 1);
        assert_eq!(groups.active("g"), 2);
    }

    #[test]
    fn permits_release_on_drop() {
        let groups = LocalGroups::new(GroupConcurrency::new(1));
        let permit = groups.try_acquire("g", None).unwrap();
        assert!(groups.try_acquire("g", None).is_none());
        drop(permit);
        assert_eq!(groups.active("g"), 0);
        assert!(groups.try_acquire("g", None).is_some());
    }

    #[test]
    fn saturated_lists_full_groups() {
        let groups = LocalGroups::new(GroupConcurrency::new(2).with_tier("solo", 1));
        let a = groups.try_acquire("a", None).unwrap();
        let _b = groups.try_acquire("b", Some("solo")).unwrap();
        assert_eq!(groups.saturated(), vec!["b".to_string()]);

        let _a2 = groups.try_acquire("a", None).unwrap();
        assert_eq!(groups.saturated(), vec!["a".to_string(), "b".to_string()]);
        drop(a);
        assert_eq!(groups.saturated(), vec!["b".to_string()]);
    }

    #[test]
    fn tiers_override_default() {
        let groups = LocalGroups::new(GroupConcurrency::new(1).with_tier("gold", 3));
        let admission = groups.admit(vec![
            job(Some("a"), Some("gold")),
            job(Some("a"), Some("gold")),
            job(Some("b"), None),
            job(Some("b"), None),
        ]);
        assert_eq!(admission.admitted.len(), 3);
        assert_eq!(admission.excess.len(), 1);
        drop(admission);
        assert_eq!(groups.active("a"), 0);
    }
}
