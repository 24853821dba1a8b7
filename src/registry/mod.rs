//! In-memory attendance registry: sessions, device cooldowns, the redemption
//! validator and per-session event fan-out.
//!
//! Lock order, outermost first: session map, one session, device slot,
//! broadcaster channel. No code path takes the session map while holding a
//! session lock.

pub mod broadcaster;
pub mod device_ledger;
pub mod service;
pub mod session_store;
pub mod validator;

pub use broadcaster::SubscriberId;
pub use service::AttendanceCore;

#[cfg(test)]
#[path = "tests/concurrent_tests.rs"]
mod concurrent_tests;
