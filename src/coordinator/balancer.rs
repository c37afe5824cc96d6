//! Weighted load balancing among equally eligible branches
//!
//! Smooth weighted round-robin: every pick adds each candidate's weight to
//! its running counter, chooses the largest counter and subtracts the total
//! weight from the winner. Over any window of `sum(weights)` picks each
//! branch is chosen exactly `weight` times, interleaved rather than bunched.
//!
//! State is kept per coordination group behind the group's own mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Debug, Default)]
struct GroupWheel {
    current: HashMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct LoadBalancer {
    groups: RwLock<HashMap<String, Arc<Mutex<GroupWheel>>>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn wheel(&self, group: &str) -> Arc<Mutex<GroupWheel>> {
        if let Some(w) = self
            .groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group)
        {
            return w.clone();
        }
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(group.to_string())
            .or_default()
            .clone()
    }

    /// Choose one of `candidates` (branch, weight) for `group`.
    /// Zero-weight candidates only win when every candidate weighs zero.
    pub fn pick(&self, group: &str, candidates: &[(String, u32)]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let total: i64 = candidates.iter().map(|(_, w)| i64::from(*w)).sum();
        if total == 0 {
            return candidates.first().map(|(b, _)| b.clone());
        }

        let wheel = self.wheel(group);
        let mut wheel = wheel.lock().unwrap_or_else(PoisonError::into_inner);
        // a member that left the rotation rejoins from zero
        wheel
            .current
            .retain(|b, _| candidates.iter().any(|(c, w)| c == b && *w > 0));

        let mut best: Option<(&str, i64)> = None;
        for (branch, weight) in candidates {
            if *weight == 0 {
                continue;
            }
            let counter = wheel.current.entry(branch.clone()).or_insert(0);
            *counter += i64::from(*weight);
            if best.map_or(true, |(_, c)| *counter > c) {
                best = Some((branch.as_str(), *counter));
            }
        }

        let (winner, _) = best?;
        if let Some(counter) = wheel.current.get_mut(winner) {
            *counter -= total;
        }
        Some(winner.to_string())
    }

    /// Put the picked branch first, keeping the others in their given order
    pub fn order(&self, group: &str, candidates: &[(String, u32)]) -> Vec<String> {
        let mut ordered: Vec<String> = candidates.iter().map(|(b, _)| b.clone()).collect();
        if let Some(head) = self.pick(group, candidates) {
            if let Some(pos) = ordered.iter().position(|b| *b == head) {
                let head = ordered.remove(pos);
                ordered.insert(0, head);
            }
        }
        ordered
    }

    /// Drop state for groups that no longer exist
    pub fn retain_groups(&self, groups: &[String]) {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| groups.contains(id));
    }
}
