//! Public port allocation for `tcp` tunnels.

use std::collections::HashMap;
use std::sync::Mutex;

/// Hands out ports from a configured range, one per tunnel.
pub struct PortAllocator {
    start: u16,
    end: u16,
    used: Mutex<HashMap<String, u16>>,
}

impl PortAllocator {
    /// Allocate from the inclusive range `start..=end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end: end.max(start),
            used: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the next free port for `subdomain`, or `None` when the range is
    /// exhausted.
    pub fn allocate(&self, subdomain: &str) -> Option<u16> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(port) = used.get(subdomain) {
            return Some(*port);
        }
        let taken: std::collections::HashSet<u16> = used.values().copied().collect();
        let port = (self.start..=self.end).find(|p| !taken.contains(p))?;
        used.insert(subdomain.to_string(), port);
        Some(port)
    }

    /// Release the port held by `subdomain`. Idempotent.
    pub fn release(&self, subdomain: &str) {
        self.used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(subdomain);
    }

    pub fn allocated(&self, subdomain: &str) -> Option<u16> {
        self.used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(subdomain)
            .copied()
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
