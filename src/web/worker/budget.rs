//! Memory budget bookkeeping.
//!
//! Pure accounting: which alias holds how many bytes. Eviction under
//! pressure is driven by the orchestrator, which owns both this and the
//! registry under one lock.

use std::collections::HashMap;

use serde::Serialize;
use voice_insight_config::BYTES_PER_GB;

#[derive(Debug, Clone, Copy)]
struct Reservation {
    instance_id: u64,
    bytes: u64,
}

/// Admission failure: how far short the budget is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub requested: u64,
    pub available: u64,
}

#[derive(Debug)]
pub struct MemoryBudget {
    total_bytes: u64,
    reservations: HashMap<String, Reservation>,
}

/// Budget usage as reported by the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub total_bytes: u64,
    pub reserved_bytes: u64,
    pub available_bytes: u64,
    pub total_gb: f64,
    pub reserved_gb: f64,
    pub usage_percent: f64,
}

impl MemoryBudget {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            reservations: HashMap::new(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reservations.values().map(|r| r.bytes).sum()
    }

    pub fn available_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.reserved_bytes())
    }

    pub fn reserved_for(&self, alias: &str) -> Option<u64> {
        self.reservations.get(alias).map(|r| r.bytes)
    }

    /// Whether `bytes` could ever fit, even with everything else evicted.
    pub fn can_ever_fit(&self, bytes: u64) -> bool {
        bytes <= self.total_bytes
    }

    /// Reserve `bytes` for `alias` if it fits right now. Never lets
    /// `reserved_bytes` exceed `total_bytes`.
    pub fn try_reserve(&mut self, alias: &str, instance_id: u64, bytes: u64) -> Result<(), Shortfall> {
        let available = self.available_bytes();
        if bytes > available {
            return Err(Shortfall {
                requested: bytes,
                available,
            });
        }
        self.reservations
            .insert(alias.to_string(), Reservation { instance_id, bytes });
        Ok(())
    }

    /// Release the reservation `instance_id` holds for `alias`. Returns the
    /// bytes freed; a repeat call (or a stale instance id) frees nothing.
    pub fn release(&mut self, alias: &str, instance_id: u64) -> u64 {
        match self.reservations.get(alias) {
            Some(r) if r.instance_id == instance_id => {
                let bytes = r.bytes;
                self.reservations.remove(alias);
                bytes
            }
            _ => 0,
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let reserved = self.reserved_bytes();
        let gb = BYTES_PER_GB as f64;
        BudgetSnapshot {
            total_bytes: self.total_bytes,
            reserved_bytes: reserved,
            available_bytes: self.available_bytes(),
            total_gb: self.total_bytes as f64 / gb,
            reserved_gb: reserved as f64 / gb,
            usage_percent: if self.total_bytes > 0 {
                reserved as f64 / self.total_bytes as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}
