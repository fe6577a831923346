// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Native cleanup tied to script object lifetime
//!
//! Native code registers a cleanup routine against an engine object. The
//! routine runs once: either when the engine reports the object unreachable,
//! or when the bridge is flushed at request teardown.

use crate::engine::Engine;
use std::cell::RefCell;

/// Cleanup routine run with the object it was registered for
pub type Cleanup<E> = Box<dyn FnOnce(&mut E, <E as Engine>::Value)>;

struct FinalizerEntry<E: Engine> {
    handle: E::Weak,
    cleanup: Cleanup<E>,
}

/// Registry of pending finalizers
pub struct FinalizationBridge<E: Engine> {
    entries: RefCell<Vec<FinalizerEntry<E>>>,
}

impl<E: Engine> FinalizationBridge<E> {
    /// Create an empty bridge
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
        }
    }

    /// Run `cleanup` once `object` is no longer needed
    pub fn track(&self, engine: &mut E, object: &E::Value, cleanup: Cleanup<E>) {
        let handle = engine.track_for_finalization(object);
        self.entries
            .borrow_mut()
            .push(FinalizerEntry { handle, cleanup });
    }

    /// Handle an unreachability notification.
    ///
    /// Returns false for handles that are not (or no longer) tracked.
    pub fn on_notified(&self, engine: &mut E, handle: &E::Weak, object: E::Value) -> bool {
        let entry = {
            let mut entries = self.entries.borrow_mut();
            match entries.iter().position(|entry| entry.handle == *handle) {
                Some(index) => entries.remove(index),
                None => return false,
            }
        };
        engine.untrack(&entry.handle);
        (entry.cleanup)(engine, object);
        true
    }

    /// Consume every notification the engine has queued
    pub fn process_notifications(&self, engine: &mut E) -> usize {
        let mut finalized = 0;
        for (handle, object) in engine.take_unreachable() {
            if self.on_notified(engine, &handle, object) {
                finalized += 1;
            }
        }
        finalized
    }

    /// Run every remaining cleanup regardless of reachability.
    ///
    /// Cleanups registered by other cleanups during the flush run too.
    pub fn flush_all(&self, engine: &mut E) -> usize {
        let mut flushed = 0;
        loop {
            let entry = {
                let mut entries = self.entries.borrow_mut();
                if entries.is_empty() {
                    break;
                }
                entries.remove(0)
            };
            let object = match engine.materialize(&entry.handle) {
                Some(object) => object,
                None => engine.undefined(),
            };
            engine.untrack(&entry.handle);
            (entry.cleanup)(engine, object);
            flushed += 1;
        }
        if flushed > 0 {
            tracing::debug!("Flushed {} pending finalizers", flushed);
        }
        flushed
    }

    /// Number of pending finalizers
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl<E: Engine> Default for FinalizationBridge<E> {
    fn default() -> Self {
        Self::new()
    }
}
