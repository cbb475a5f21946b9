// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Concurrency gate for inference calls

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::api::errors::VisionError;

/// Bounded admission to the dispatcher
///
/// Waiters are admitted in FIFO order. Each slot is held by a `GatePermit`
/// and released when the permit is dropped, on every exit path.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One admitted slot
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot
    pub async fn acquire(&self) -> Result<GatePermit, VisionError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| VisionError::Resource("concurrency gate is closed".to_string()))?;
        Ok(GatePermit { _permit: permit })
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<GatePermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| GatePermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    /// Stop admitting; pending and future `acquire` calls fail
    pub fn close(&self) {
        self.semaphore.close();
    }
}
