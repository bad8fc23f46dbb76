// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The data side of the resource-import calls (`create_swapchain`,
//! `import_swapchain`, `import_fence`, `create_semaphore`,
//! `set_thread_hint`) -- everything except the actual GPU-API work, which
//! belongs to the client shim and the native compositor on the other side
//! of the broker.

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SwapchainUsage: u32 {
        const COLOR_ATTACHMENT   = 1 << 0;
        const DEPTH_STENCIL      = 1 << 1;
        const TRANSFER_SRC       = 1 << 2;
        const TRANSFER_DST       = 1 << 3;
        const SAMPLED            = 1 << 4;
        const UNORDERED_ACCESS   = 1 << 5;
        const MUTABLE_FORMAT     = 1 << 6;
    }
}

/// The client-supplied description of a swapchain to create or import.
/// Opaque to the broker beyond its size/format/usage -- those are only
/// ever forwarded to the native compositor, never interpreted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub width: u32,
    pub height: u32,
    pub format: i64,
    pub face_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
    pub sample_count: u32,
    pub usage: SwapchainUsage,
}

/// A no-op hint in the core; kept only so the client-facing API surface
/// matches the source's `set_thread_hint`, which some platform backends
/// use to set scheduler priorities on the render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadHint {
    Application,
    Render,
}
