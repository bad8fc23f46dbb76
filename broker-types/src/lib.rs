// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Pure data types shared between the compositor broker and its external
//! collaborators (the native compositor, GPU-API client shims, and the IPC
//! transport). Nothing in this crate touches threads, locks, or time; it's
//! just the shapes that cross those boundaries.

pub mod error;
pub mod events;
pub mod handles;
pub mod layer;
pub mod pacer;
pub mod resource;

pub use error::*;
pub use events::*;
pub use handles::*;
pub use layer::*;
pub use pacer::*;
pub use resource::*;
