//! # bforest Configuration Module
//!
//! This module centralizes all configuration constants for the engine.
//! Constants are grouped by their functional area and interdependencies are
//! documented and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! Scattered constants across multiple files lead to bugs where interdependent
//! values become mismatched. For example, a journal reservation must always be
//! able to absorb the parent-pointer updates produced by a leaf split, or a
//! commit could stall after the point of no return. By co-locating these
//! constants and adding compile-time checks, we prevent such issues.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
