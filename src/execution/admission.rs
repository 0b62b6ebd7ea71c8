/// Concurrency cap on simultaneously held instruments
///
/// "Active" means the authoritative book shows quantity, or we flagged the
/// symbol ourselves right after placing an entry that the book may not
/// reflect yet. When a position query fails we keep the flag: undercounting
/// available slots is acceptable, blowing through the cap is not.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{debug, info};

/// Outcome of an authoritative position query, kept distinct from "no
/// position" so a failed query never releases a slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionCheck {
    Confirmed(f64),
    Unknown,
}

pub struct AdmissionController {
    active: Mutex<HashSet<String>>,
    max_concurrent: usize,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
            max_concurrent,
        }
    }

    /// Fold a fresh authoritative check into the active set and report
    /// whether the symbol counts as active.
    pub fn record(&self, symbol: &str, check: PositionCheck) -> bool {
        let mut active = self.active.lock().unwrap();
        match check {
            PositionCheck::Confirmed(qty) if qty > 0.0 => {
                active.insert(symbol.to_string());
                true
            }
            PositionCheck::Confirmed(_) => {
                if active.remove(symbol) {
                    debug!(symbol, "confirmed flat; active flag cleared");
                }
                false
            }
            PositionCheck::Unknown => {
                debug!(symbol, "position query inconclusive; keeping flag");
                active.contains(symbol)
            }
        }
    }

    pub fn count_active(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn can_open(&self) -> bool {
        self.count_active() < self.max_concurrent
    }

    /// Claim a slot for a new entry. Check-and-flag under one lock so two
    /// symbols racing for the last slot cannot both win.
    pub fn try_admit(&self, symbol: &str) -> bool {
        let mut active = self.active.lock().unwrap();
        if active.contains(symbol) {
            return true; // already ours; adding to a position is not a new slot
        }
        if active.len() >= self.max_concurrent {
            info!(
                symbol,
                active = active.len(),
                cap = self.max_concurrent,
                "max concurrent positions reached; entry denied"
            );
            return false;
        }
        active.insert(symbol.to_string());
        true
    }

    /// Give a claimed slot back after a failed placement.
    pub fn release(&self, symbol: &str) {
        self.active.lock().unwrap().remove(symbol);
    }
}
