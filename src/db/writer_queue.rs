// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{Condvar, Mutex};

struct QueueState {
    next_ticket: u64,
    serving: u64,
}

/// FIFO queue guarding the single writer slot
///
/// A ticket lock: writers draw a ticket and are admitted strictly in draw
/// order, so a burst of writers cannot starve an early one. The slot is
/// held through a guard, which releases on drop; a panicking transaction
/// callback therefore always hands the slot to the next writer.
pub struct WriterQueue {
    state: Mutex<QueueState>,
    cvar: Condvar,
}

impl Default for WriterQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_ticket: 0,
                serving: 0,
            }),
            cvar: Condvar::new(),
        }
    }
}

impl WriterQueue {
    /// Blocks until this caller holds the writer slot.
    pub fn acquire(&self) -> WriterSlot<'_> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        let ticket = state.next_ticket;
        state.next_ticket += 1;

        while state.serving != ticket {
            #[allow(clippy::expect_used)]
            {
                state = self.cvar.wait(state).expect("lock is poisoned");
            }
        }

        WriterSlot { queue: self }
    }
}

/// Exclusive hold of the writer slot; released on drop
pub struct WriterSlot<'a> {
    queue: &'a WriterQueue,
}

impl Drop for WriterSlot<'_> {
    fn drop(&mut self) {
        #[allow(clippy::expect_used)]
        let mut state = self.queue.state.lock().expect("lock is poisoned");

        state.serving += 1;
        self.queue.cvar.notify_all();
    }
}
