//! Grouped timer wheel, component 4.E.
//!
//! Grounded on `utils/timer.c`: requests overwhelmingly share exact
//! timeout values (`recv_timeout`, `send_timeout`, ...), so instead of a
//! general priority queue the timer keeps one FIFO group per distinct
//! timeout. Because every node in a group shares the same duration, the
//! group's head always has the earliest deadline, giving O(1) "what's
//! next" per group and an `expire()` that only has to look at each
//! group's head.

use std::time::{Duration, Instant};

/// Handle to a scheduled node, stable until the node is removed or expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(usize);

struct Node<T> {
    deadline: Instant,
    group: usize,
    prev: Option<usize>,
    next: Option<usize>,
    payload: T,
}

struct Group {
    timeout: Duration,
    head: Option<usize>,
    tail: Option<usize>,
}

/// A grouped timer wheel holding payloads of type `T` (typically a request
/// or connection identifier).
pub struct TimerWheel<T> {
    groups: Vec<Group>,
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        TimerWheel {
            groups: Vec::new(),
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Schedules `payload` to expire at `now + timeout`, creating a new
    /// group if no existing group shares this exact timeout (linear scan,
    /// matching `timer_add`'s group search — the group count in practice
    /// is tiny, bounded by the number of distinct configured timeouts).
    pub fn add(&mut self, timeout: Duration, now: Instant, payload: T) -> TimerHandle {
        let group_idx = self.group_for(timeout);
        let idx = self.alloc_node(Node {
            deadline: now + timeout,
            group: group_idx,
            prev: self.groups[group_idx].tail,
            next: None,
            payload,
        });
        self.link_tail(group_idx, idx);
        TimerHandle(idx)
    }

    /// Removes a node before it expires, returning its payload.
    pub fn remove(&mut self, handle: TimerHandle) -> Option<T> {
        let idx = handle.0;
        let node = self.nodes[idx].take()?;
        self.unlink(idx, &node);
        self.free.push(idx);
        Some(node.payload)
    }

    /// Rearms a node with a new timeout. If the new timeout matches the
    /// node's current group, this is a cheap move-to-tail; otherwise the
    /// node is unlinked and re-added to (possibly a new) group.
    pub fn update(&mut self, handle: TimerHandle, timeout: Duration, now: Instant) {
        let idx = handle.0;
        let same_group = self.nodes[idx]
            .as_ref()
            .map(|n| self.groups[n.group].timeout == timeout)
            .unwrap_or(false);

        if same_group {
            let group_idx = self.nodes[idx].as_ref().unwrap().group;
            let node = self.nodes[idx].take().unwrap();
            self.unlink(idx, &node);
            let mut node = node;
            node.deadline = now + timeout;
            node.prev = self.groups[group_idx].tail;
            node.next = None;
            self.nodes[idx] = Some(node);
            self.link_tail(group_idx, idx);
        } else if let Some(node) = self.nodes[idx].take() {
            self.unlink(idx, &node);
            self.free.push(idx);
            self.add(timeout, now, node.payload);
        }
    }

    /// Returns the duration until the next deadline across all groups, or
    /// `None` if nothing is scheduled. Returns `Duration::ZERO` if
    /// something is already due.
    pub fn closest(&self, now: Instant) -> Option<Duration> {
        self.groups
            .iter()
            .filter_map(|g| g.head)
            .filter_map(|idx| self.nodes[idx].as_ref())
            .map(|n| n.deadline.saturating_duration_since(now))
            .min()
    }

    /// Moves every node whose deadline has passed into the returned list,
    /// stopping at the first non-expired head in each group (all later
    /// nodes in that group are guaranteed not to be due yet either, since
    /// groups are FIFO-ordered by insertion and share one timeout).
    pub fn expire(&mut self, now: Instant) -> Vec<(TimerHandle, T)> {
        let mut expired = Vec::new();
        for group_idx in 0..self.groups.len() {
            loop {
                let head = self.groups[group_idx].head;
                let Some(idx) = head else { break };
                let due = self.nodes[idx]
                    .as_ref()
                    .map(|n| n.deadline <= now)
                    .unwrap_or(false);
                if !due {
                    break;
                }
                let node = self.nodes[idx].take().unwrap();
                self.unlink(idx, &node);
                self.free.push(idx);
                expired.push((TimerHandle(idx), node.payload));
            }
        }
        expired
    }

    fn group_for(&mut self, timeout: Duration) -> usize {
        if let Some(i) = self.groups.iter().position(|g| g.timeout == timeout) {
            return i;
        }
        self.groups.push(Group {
            timeout,
            head: None,
            tail: None,
        });
        self.groups.len() - 1
    }

    fn alloc_node(&mut self, node: Node<T>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn link_tail(&mut self, group_idx: usize, idx: usize) {
        let prev_tail = self.groups[group_idx].tail;
        if let Some(prev_idx) = prev_tail {
            if let Some(prev_node) = self.nodes[prev_idx].as_mut() {
                prev_node.next = Some(idx);
            }
        } else {
            self.groups[group_idx].head = Some(idx);
        }
        self.groups[group_idx].tail = Some(idx);
    }

    fn unlink(&mut self, idx: usize, node: &Node<T>) {
        match node.prev {
            Some(prev_idx) => {
                if let Some(prev_node) = self.nodes[prev_idx].as_mut() {
                    prev_node.next = node.next;
                }
            }
            None => self.groups[node.group].head = node.next,
        }
        match node.next {
            Some(next_idx) => {
                if let Some(next_node) = self.nodes[next_idx].as_mut() {
                    next_node.prev = node.prev;
                }
            }
            None => self.groups[node.group].tail = node.prev,
        }
        let _ = idx;
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_in_insertion_order_within_a_group() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let a = wheel.add(Duration::from_secs(1), now, "a");
        let _b = wheel.add(Duration::from_secs(1), now, "b");
        let expired = wheel.expire(now + Duration::from_secs(2));
        assert_eq!(expired.len(), 2);
        assert_eq!(expired[0].0, a);
    }

    #[test]
    fn does_not_expire_before_deadline() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.add(Duration::from_secs(60), now, "a");
        assert!(wheel.expire(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn distinct_timeouts_get_distinct_groups() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.add(Duration::from_secs(1), now, "short");
        wheel.add(Duration::from_secs(60), now, "long");
        let expired = wheel.expire(now + Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1, "short");
    }

    #[test]
    fn remove_before_expiry_works() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let h = wheel.add(Duration::from_secs(1), now, "a");
        assert_eq!(wheel.remove(h), Some("a"));
        assert!(wheel.expire(now + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn update_same_timeout_moves_to_tail() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let a = wheel.add(Duration::from_secs(10), now, "a");
        let b = wheel.add(Duration::from_secs(10), now, "b");
        wheel.update(a, Duration::from_secs(10), now + Duration::from_secs(1));
        let expired = wheel.expire(now + Duration::from_secs(100));
        assert_eq!(expired[0].0, b, "b should now expire before a");
        assert_eq!(expired[1].0, a);
    }

    #[test]
    fn closest_reports_earliest_deadline() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.add(Duration::from_secs(60), now, "long");
        wheel.add(Duration::from_secs(5), now, "short");
        let closest = wheel.closest(now).unwrap();
        assert!(closest <= Duration::from_secs(5));
    }
}
