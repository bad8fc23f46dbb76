// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The interface to the downstream "native" compositor -- the thing that
//! actually scans layers out to a display. Everything GPU-API-specific
//! lives on the other side of this trait; the broker only ever calls it,
//! never implements it for real.

use monado_broker_types::{
    FenceRef, Layer, PacerPoint, ResourceError, SemaphoreRef, SwapchainInfo, SwapchainRef, SyncHandle,
};

use crate::slot::EnvBlendMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameData {
    pub frame_id: i64,
    pub display_time_ns: u64,
    pub env_blend_mode: EnvBlendMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictedNativeFrame {
    pub frame_id: i64,
    pub wake_ns: u64,
    pub predicted_display_ns: u64,
    pub predicted_period_ns: u64,
}

/// The downstream compositor's own session/frame lifecycle, driven by the
/// broker main loop as an aggregate of all client session states. A type
/// implementing this is expected to forward to a real display backend;
/// errors from it are logged and the current cycle is skipped, never
/// propagated up to a client.
pub trait NativeCompositor: Send {
    fn begin_session(&mut self) -> anyhow::Result<()>;
    fn end_session(&mut self) -> anyhow::Result<()>;

    fn predict_frame(&mut self) -> anyhow::Result<PredictedNativeFrame>;
    fn mark_frame(&mut self, point: PacerPoint, when_ns: u64);
    fn begin_frame(&mut self, frame_id: i64) -> anyhow::Result<()>;

    fn layer_begin(&mut self, frame_data: FrameData) -> anyhow::Result<()>;
    fn layer(&mut self, layer: &Layer) -> anyhow::Result<()>;
    fn layer_commit(&mut self, sync: SyncHandle) -> anyhow::Result<()>;

    /// Whether the native compositor exposes per-client session control.
    /// If not, `set_main_app_visibility` and friends return
    /// `SessionError::NotImplemented` without mutating any state.
    fn supports_multi_session(&self) -> bool {
        true
    }
}

/// The resource-import half of the native compositor, split out from
/// [`NativeCompositor`] because it's called directly from client threads
/// (at any time, concurrently), while `NativeCompositor` is only ever
/// driven from the broker's single main-loop thread one call at a time.
/// A real backend (e.g. a Vulkan device) is thread-safe for resource
/// creation even though its per-frame submission is sequential.
pub trait NativeResourceBackend: Send + Sync {
    fn create_swapchain(&self, info: SwapchainInfo) -> Result<SwapchainRef, ResourceError>;
    fn import_swapchain(&self, info: SwapchainInfo, native_images: Vec<u64>) -> Result<SwapchainRef, ResourceError>;
    fn import_fence(&self, sync_handle: u64) -> Result<FenceRef, ResourceError>;
    fn create_semaphore(&self) -> Result<SemaphoreRef, ResourceError>;

    fn get_display_refresh_rate(&self) -> f32;
    fn request_display_refresh_rate(&self, hz: f32);
}

/// A resource backend that hands out freshly-minted ids and never fails.
/// Used by the standalone binary (which has no real GPU-API backend to
/// import from) and by tests that only care about the handle bookkeeping,
/// not what's behind it.
pub struct InMemoryResourceBackend {
    next_id: std::sync::atomic::AtomicU64,
    refresh_hz: parking_lot::Mutex<f32>,
}

impl InMemoryResourceBackend {
    pub fn new(default_refresh_hz: f32) -> Self {
        Self {
            next_id: std::sync::atomic::AtomicU64::new(1),
            refresh_hz: parking_lot::Mutex::new(default_refresh_hz),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

impl NativeResourceBackend for InMemoryResourceBackend {
    fn create_swapchain(&self, _info: SwapchainInfo) -> Result<SwapchainRef, ResourceError> {
        Ok(SwapchainRef::new(self.alloc_id()))
    }

    fn import_swapchain(&self, _info: SwapchainInfo, native_images: Vec<u64>) -> Result<SwapchainRef, ResourceError> {
        if native_images.is_empty() {
            return Err(ResourceError::SwapchainImportFailed("no native images supplied".into()));
        }
        Ok(SwapchainRef::new(self.alloc_id()))
    }

    fn import_fence(&self, _sync_handle: u64) -> Result<FenceRef, ResourceError> {
        Ok(FenceRef::new(self.alloc_id()))
    }

    fn create_semaphore(&self) -> Result<SemaphoreRef, ResourceError> {
        Ok(SemaphoreRef::new(self.alloc_id()))
    }

    fn get_display_refresh_rate(&self) -> f32 {
        *self.refresh_hz.lock()
    }

    fn request_display_refresh_rate(&self, hz: f32) {
        *self.refresh_hz.lock() = hz;
    }
}
