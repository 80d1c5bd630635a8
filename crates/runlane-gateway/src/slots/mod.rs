//! Concurrency slot pools for sub-agent spawning.
//!
//! - [`SlotPool`]: keyed counting pool with single-use [`Reservation`]s.
//! - [`SpawnSlots`]: the per-requester child pool plus the per-provider pool,
//!   reserved together in a fixed order.

pub mod pool;
pub mod spawn;

pub use pool::{Reservation, SlotPool, SlotUsage};
pub use spawn::{SlotDenied, SpawnReservations, SpawnSlots};
