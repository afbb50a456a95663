//! Hijack SDK - Interception Data Model
//!
//! This crate contains the fixed-layout types shared between the generated
//! stubs, the interception engine and whatever consumes its records.
//! It has no dependencies and compiles quickly, allowing parallel compilation
//! of dependent crates.
//!
//! # Modules
//!
//! - [`registers`] - Register snapshot layout captured by prolog/epilog stubs
//! - [`timer`] - The enter/exit record emitted for every intercepted call
//! - [`args`] - Argument layout descriptors and captured argument payloads

pub mod args;
pub mod registers;
pub mod timer;

pub use args::{ArgLayout, ArgSlot, ArgumentCapture};
pub use registers::{IntegerRegisters, RegisterSnapshot, Xmm, XmmRegisters};
pub use timer::{Timer, TimerKind};
