use std::collections::{HashSet, VecDeque};

use confab_core::ids::MessageId;

/// Consumer-side duplicate filter for hub frames.
///
/// Delivery is at-least-once, and a sender also receives its own message
/// back. Clients feed every incoming message id through [`insert`] and
/// drop the ones it rejects. Only the last `capacity` ids are remembered.
///
/// [`insert`]: SeenMessages::insert
#[derive(Debug)]
pub struct SeenMessages {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`. Returns `false` if it was already seen.
    pub fn insert(&mut self, id: &MessageId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                let _ = self.ids.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for SeenMessages {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_rejected() {
        let mut seen = SeenMessages::default();
        let id = MessageId::new();
        assert!(seen.insert(&id));
        assert!(!seen.insert(&id));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn oldest_ids_are_forgotten() {
        let mut seen = SeenMessages::new(2);
        let ids: Vec<MessageId> = (0..3).map(|_| MessageId::new()).collect();
        for id in &ids {
            assert!(seen.insert(id));
        }
        assert!(!seen.contains(&ids[0]));
        assert!(seen.contains(&ids[2]));
        assert!(seen.insert(&ids[0]));
    }
}
