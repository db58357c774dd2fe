// Run Identifiers
// Generates `YYYYMMDD-HHMMSSmmm-CCCC` identifiers with a wrapping hex counter

use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU16, Ordering};

/// Shared by every run of one engine so identifiers never collide within it
#[derive(Debug, Default)]
pub struct RunIdGenerator {
    counter: AtomicU16,
}

impl RunIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the counter at a given value
    pub fn starting_at(counter: u16) -> Self {
        Self {
            counter: AtomicU16::new(counter),
        }
    }

    pub fn next(&self) -> String {
        self.next_at(Local::now())
    }

    pub fn next_at(&self, now: DateTime<Local>) -> String {
        // fetch_add wraps 0xFFFF back to 0
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:04X}", now.format("%Y%m%d-%H%M%S%3f"), counter)
    }
}
