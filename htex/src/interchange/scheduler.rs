use crate::id::FabricId;
use crate::message::TaskMessage;
use crate::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cap on the number of tasks routed to one fabric in a single batch.
pub const BATCH_CAP: usize = 10;

#[derive(Debug)]
struct FabricEntry {
    /// Capacity requested minus tasks already dispatched.
    capacity: usize,
    last_seen: Instant,
    alive: bool,
}

/// The interchange's scheduling state, kept apart from the socket plumbing:
/// the inbound task buffer, per-fabric outstanding capacity, the
/// round-robin cursor and the liveness deadlines.
#[derive(Debug)]
pub struct Scheduler {
    buffer: VecDeque<TaskMessage>,
    fabrics: HashMap<FabricId, FabricEntry>,
    /// Round-robin order, by registration.
    order: Vec<FabricId>,
    cursor: usize,
    heartbeat_period: Duration,
}

impl Scheduler {
    pub fn new(heartbeat_period: Duration) -> Self {
        Self {
            buffer: VecDeque::new(),
            fabrics: HashMap::new(),
            order: Vec::new(),
            cursor: 0,
            heartbeat_period,
        }
    }

    /// Registers a fabric by its wire identity.
    pub fn register(&mut self, id: FabricId, now: Instant) {
        debug!("[interchange] fabric {} registered", id);
        self.fabrics.insert(
            id.clone(),
            FabricEntry {
                capacity: 0,
                last_seen: now,
                alive: true,
            },
        );
        if !self.order.contains(&id) {
            self.order.push(id);
        }
    }

    /// Drops a fabric that disconnected.
    pub fn unregister(&mut self, id: &str) {
        self.fabrics.remove(id);
        self.order.retain(|known| known != id);
    }

    /// Buffers a task read from the client until downstream demand exists.
    pub fn enqueue(&mut self, task: TaskMessage) {
        self.buffer.push_back(task);
    }

    /// Puts an undeliverable batch back at the front of the buffer.
    pub fn requeue(&mut self, batch: Vec<TaskMessage>) {
        for task in batch.into_iter().rev() {
            self.buffer.push_front(task);
        }
    }

    /// Applies a capacity request of `count`; zero is the heartbeat and
    /// only refreshes the liveness deadline.
    pub fn capacity_request(&mut self, id: &str, count: u32, now: Instant) {
        if let Some(entry) = self.fabrics.get_mut(id) {
            entry.last_seen = now;
            if count > 0 && entry.alive {
                entry.capacity += count as usize;
            }
        }
    }

    /// Refreshes the liveness deadline; any message from a fabric counts.
    pub fn seen(&mut self, id: &str, now: Instant) {
        if let Some(entry) = self.fabrics.get_mut(id) {
            entry.last_seen = now;
        }
    }

    /// Marks fabrics whose deadline expired as dead, zeroing their
    /// capacity; tasks already dispatched to them are not redriven.
    /// Returns the newly dead identities.
    pub fn check_liveness(&mut self, now: Instant) -> Vec<FabricId> {
        let heartbeat_period = self.heartbeat_period;
        self.fabrics
            .iter_mut()
            .filter(|(_, entry)| {
                entry.alive && now.duration_since(entry.last_seen) > heartbeat_period
            })
            .map(|(id, entry)| {
                entry.alive = false;
                entry.capacity = 0;
                id.clone()
            })
            .collect()
    }

    /// Picks the next batch to dispatch: the first fabric in round-robin
    /// order that is alive and has outstanding capacity, with a batch sized
    /// to `min(buffered, capacity, BATCH_CAP)`. `None` when nothing can be
    /// dispatched.
    pub fn next_batch(&mut self) -> Option<(FabricId, Vec<TaskMessage>)> {
        if self.buffer.is_empty() || self.order.is_empty() {
            return None;
        }
        for offset in 0..self.order.len() {
            let index = (self.cursor + offset) % self.order.len();
            let id = &self.order[index];
            let entry = match self.fabrics.get_mut(id.as_str()) {
                Some(entry) => entry,
                None => continue,
            };
            if !entry.alive || entry.capacity == 0 {
                continue;
            }
            let size = self.buffer.len().min(entry.capacity).min(BATCH_CAP);
            entry.capacity -= size;
            let batch = self.buffer.drain(..size).collect();
            let id = id.clone();
            // resume the scan after this fabric next time
            self.cursor = (index + 1) % self.order.len();
            return Some((id, batch));
        }
        None
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.fabrics.get(id).map(|e| e.alive).unwrap_or(false)
    }

    pub fn capacity_of(&self, id: &str) -> usize {
        self.fabrics.get(id).map(|e| e.capacity).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TaskId;

    fn task() -> TaskMessage {
        TaskMessage {
            task_id: TaskId::new(),
            buffer: Vec::new(),
        }
    }

    fn scheduler_with(fabrics: &[&str]) -> (Scheduler, Instant) {
        let now = Instant::now();
        let mut scheduler = Scheduler::new(Duration::from_secs(30));
        for id in fabrics {
            scheduler.register(id.to_string(), now);
        }
        (scheduler, now)
    }

    #[test]
    fn no_dispatch_without_capacity() {
        let (mut scheduler, _now) = scheduler_with(&["a"]);
        scheduler.enqueue(task());
        assert!(scheduler.next_batch().is_none());
    }

    #[test]
    fn no_dispatch_without_tasks() {
        let (mut scheduler, now) = scheduler_with(&["a"]);
        scheduler.capacity_request("a", 4, now);
        assert!(scheduler.next_batch().is_none());
    }

    #[test]
    fn batch_is_bounded_by_capacity() {
        let (mut scheduler, now) = scheduler_with(&["a"]);
        for _ in 0..8 {
            scheduler.enqueue(task());
        }
        scheduler.capacity_request("a", 3, now);

        let (id, batch) = scheduler.next_batch().expect("batch should dispatch");
        assert_eq!(id, "a");
        assert_eq!(batch.len(), 3);
        assert_eq!(scheduler.capacity_of("a"), 0);
        assert_eq!(scheduler.pending(), 5);
        // capacity exhausted; the rest stays buffered
        assert!(scheduler.next_batch().is_none());
    }

    #[test]
    fn batch_is_bounded_by_batch_cap() {
        let (mut scheduler, now) = scheduler_with(&["a"]);
        for _ in 0..50 {
            scheduler.enqueue(task());
        }
        scheduler.capacity_request("a", 40, now);

        let (_, batch) = scheduler.next_batch().expect("batch should dispatch");
        assert_eq!(batch.len(), BATCH_CAP);
        assert_eq!(scheduler.capacity_of("a"), 40 - BATCH_CAP);
    }

    #[test]
    fn dispatch_never_exceeds_requested_capacity() {
        let (mut scheduler, now) = scheduler_with(&["a"]);
        for _ in 0..100 {
            scheduler.enqueue(task());
        }
        scheduler.capacity_request("a", 4, now);
        scheduler.capacity_request("a", 4, now);

        let mut dispatched = 0;
        while let Some((_, batch)) = scheduler.next_batch() {
            dispatched += batch.len();
        }
        assert_eq!(dispatched, 8);
    }

    #[test]
    fn eligible_fabrics_alternate_round_robin() {
        let (mut scheduler, now) = scheduler_with(&["a", "b"]);
        for _ in 0..40 {
            scheduler.enqueue(task());
        }
        scheduler.capacity_request("a", 20, now);
        scheduler.capacity_request("b", 20, now);

        let (first, _) = scheduler.next_batch().expect("batch should dispatch");
        let (second, _) = scheduler.next_batch().expect("batch should dispatch");
        let (third, _) = scheduler.next_batch().expect("batch should dispatch");
        assert_eq!(first, "a");
        assert_eq!(second, "b");
        assert_eq!(third, "a");
    }

    #[test]
    fn heartbeats_refresh_but_add_no_capacity() {
        let (mut scheduler, now) = scheduler_with(&["a"]);
        scheduler.enqueue(task());
        scheduler.capacity_request("a", 0, now + Duration::from_secs(29));
        assert!(scheduler.next_batch().is_none());
        // the heartbeat pushed the deadline out
        assert!(scheduler
            .check_liveness(now + Duration::from_secs(31))
            .is_empty());
        assert!(scheduler.is_alive("a"));
    }

    #[test]
    fn expired_fabrics_are_marked_dead_and_skipped() {
        let (mut scheduler, now) = scheduler_with(&["a", "b"]);
        scheduler.capacity_request("a", 5, now);
        scheduler.capacity_request("b", 5, now + Duration::from_secs(20));
        for _ in 0..4 {
            scheduler.enqueue(task());
        }

        let dead = scheduler.check_liveness(now + Duration::from_secs(31));
        assert_eq!(dead, vec!["a".to_string()]);
        assert!(!scheduler.is_alive("a"));
        assert_eq!(scheduler.capacity_of("a"), 0);

        // all dispatches now go to the survivor
        let (id, batch) = scheduler.next_batch().expect("batch should dispatch");
        assert_eq!(id, "b");
        assert_eq!(batch.len(), 4);

        // a dead fabric's late capacity requests are ignored
        scheduler.capacity_request("a", 5, now + Duration::from_secs(32));
        assert_eq!(scheduler.capacity_of("a"), 0);
    }

    #[test]
    fn requeued_tasks_keep_their_order() {
        let (mut scheduler, now) = scheduler_with(&["a"]);
        let first = task();
        let second = task();
        scheduler.enqueue(first.clone());
        scheduler.enqueue(second.clone());
        scheduler.capacity_request("a", 10, now);

        let (_, batch) = scheduler.next_batch().expect("batch should dispatch");
        scheduler.requeue(batch);
        scheduler.capacity_request("a", 10, now);
        let (_, batch) = scheduler.next_batch().expect("batch should dispatch");
        assert_eq!(batch[0].task_id, first.task_id);
        assert_eq!(batch[1].task_id, second.task_id);
    }
}
