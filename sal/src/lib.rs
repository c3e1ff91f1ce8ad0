//! Stack Abstraction Layer (SAL) boundary.
//!
//! This crate defines the downward call surface into a vendor Bluetooth
//! stack and the upward event surface back out of it, independent of any
//! concrete stack. The framework service crate consumes the traits and
//! re-posts every upward event onto its dispatch loop.
//!
//! Events are plain-data enums paired with a `*CallbacksDispatcher` holding
//! a boxed `dispatch` closure. A stack binding calls `dispatch` from
//! whatever thread it likes; the framework points the closure at its
//! message channel so ordering is preserved per dispatcher.

pub mod adapter;
pub mod gatt;
pub mod le;
pub mod spp;
pub mod types;

pub use types::{BtStatus, DisplayAddress, RawAddress, Uuid};
