// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Opaque, reference-counted handles to resources that live on the other
//! side of the GPU-API boundary. The broker never interprets their
//! contents; it only moves them between pipeline slots and drops them
//! when a slot is cleared.

use std::sync::Arc;

/// A strong reference to a client swapchain. Shared with the native
/// compositor; dropping the last `SwapchainRef` releases the underlying
/// resource.
#[derive(Clone)]
pub struct SwapchainRef(Arc<u64>);

impl SwapchainRef {
    pub fn new(id: u64) -> Self {
        Self(Arc::new(id))
    }

    pub fn id(&self) -> u64 {
        *self.0
    }

    /// Number of slots (plus the native compositor's own reference, if any)
    /// currently holding this swapchain alive.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl std::fmt::Debug for SwapchainRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SwapchainRef").field(&*self.0).finish()
    }
}

impl PartialEq for SwapchainRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A client-imported fence, handed off to the wait worker at `layer_commit`.
#[derive(Clone)]
pub struct FenceRef(Arc<u64>);

impl FenceRef {
    pub fn new(id: u64) -> Self {
        Self(Arc::new(id))
    }

    pub fn id(&self) -> u64 {
        *self.0
    }
}

impl std::fmt::Debug for FenceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FenceRef").field(&*self.0).finish()
    }
}

/// A client-created timeline semaphore.
#[derive(Clone)]
pub struct SemaphoreRef(Arc<u64>);

impl SemaphoreRef {
    pub fn new(id: u64) -> Self {
        Self(Arc::new(id))
    }

    pub fn id(&self) -> u64 {
        *self.0
    }
}

impl std::fmt::Debug for SemaphoreRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SemaphoreRef").field(&*self.0).finish()
    }
}

/// The sync primitive passed to `layer_commit`. Either a fence, a
/// (semaphore, wait-value) pair, or nothing at all -- in which case the
/// broker assumes the client already did a CPU-side wait.
#[derive(Debug, Clone)]
pub enum SyncHandle {
    Fence(FenceRef),
    Semaphore { sem: SemaphoreRef, value: u64 },
    Invalid,
}

impl SyncHandle {
    pub fn is_valid(&self) -> bool {
        !matches!(self, SyncHandle::Invalid)
    }
}
