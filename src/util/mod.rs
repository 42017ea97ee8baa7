// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: padding masks and mode-aware dropout.

pub mod dropout;
pub mod masks;
