// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The broker's error taxonomy. Each variant maps to one of the categories
//! in the design doc: protocol errors never mutate state and aren't
//! retried, resource errors clear whatever was partially built, and
//! session-lifetime errors leave broker state untouched. Fatal errors
//! (native compositor lost) are handled out of band via `SessionEvent::Lost`
//! rather than through this type.

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("layer_count already at the per-frame cap ({0})")]
    TooManyLayers(usize),
    #[error("layer_begin called while a frame was already open")]
    FrameAlreadyOpen,
    #[error("layer_* called without an open frame")]
    NoFrameOpen,
    #[error("invalid frame data")]
    InvalidFrameData,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceError {
    #[error("failed to import swapchain: {0}")]
    SwapchainImportFailed(String),
    #[error("failed to import fence: {0}")]
    FenceImportFailed(String),
    #[error("out of memory")]
    OutOfMemory,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("session is not active")]
    NotActive,
    #[error("session is already active")]
    AlreadyActive,
    #[error("multi-session control is not supported by the native compositor")]
    NotImplemented,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("client table is already at its configured cap ({0})")]
    TooManyClients(usize),
}
