// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The GPU-API-specific half of the wait worker: actually blocking on a
//! fence or timeline semaphore. This is the seam the design doc calls out
//! as an external collaborator (the client shim knows how to wait on its
//! own API's primitives); the broker only drives the retry loop around it.

use std::time::Duration;

use monado_broker_types::SyncHandle;

#[derive(Debug, Clone, thiserror::Error)]
#[error("gpu wait failed: {0}")]
pub struct GpuWaitError(pub String);

/// Waits on a single sync primitive with a bounded timeout per attempt.
pub trait GpuWaiter: Send + Sync {
    /// Returns `Ok(true)` if the primitive signalled within `timeout`,
    /// `Ok(false)` on a plain timeout (the caller retries), or `Err` if the
    /// underlying wait call itself reported a failure other than a
    /// timeout.
    fn wait(&self, sync: &SyncHandle, timeout: Duration) -> Result<bool, GpuWaitError>;
}

/// A waiter that never actually waits -- used for `layer_commit` with no
/// sync handle, where the client is assumed to have already done its own
/// CPU-side wait, and in tests that don't care about GPU timing.
pub struct ImmediateGpuWaiter;

impl GpuWaiter for ImmediateGpuWaiter {
    fn wait(&self, _sync: &SyncHandle, _timeout: Duration) -> Result<bool, GpuWaitError> {
        Ok(true)
    }
}
