//! Server liveness tracking
//!
//! Liveness is a property of the endpoint, not of the stripe map: a failed
//! server keeps its slots, callers consult this map before dispatching.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::ids::ServerId;

#[derive(Debug, Default)]
pub struct HealthMap {
    down: RwLock<HashSet<ServerId>>,
}

impl HealthMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_down(&self, server: ServerId) -> bool {
        self.down.write().insert(server)
    }

    pub fn mark_up(&self, server: ServerId) -> bool {
        self.down.write().remove(&server)
    }

    pub fn is_down(&self, server: ServerId) -> bool {
        self.down.read().contains(&server)
    }

    pub fn down_servers(&self) -> Vec<ServerId> {
        self.down.read().iter().copied().collect()
    }

    /// Number of reachable servers among the given slots.
    pub fn count_up(&self, servers: &[ServerId]) -> usize {
        let down = self.down.read();
        servers.iter().filter(|s| !down.contains(s)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_down_and_up() {
        let health = HealthMap::new();
        assert!(!health.is_down(1));
        assert!(health.mark_down(1));
        assert!(!health.mark_down(1));
        assert!(health.is_down(1));
        assert!(health.mark_up(1));
        assert!(!health.is_down(1));
    }

    #[test]
    fn test_count_up() {
        let health = HealthMap::new();
        health.mark_down(2);
        assert_eq!(health.count_up(&[0, 1, 2, 3]), 3);
    }
}
