//! Ambient, domain-free utilities shared by the `wardgate` library and the
//! `wardgate-app` binary: clock abstraction, ID generation, shutdown
//! signaling, telemetry init, and build metadata.

pub mod clock;
pub mod ids;
pub mod signal;
pub mod telemetry;
pub mod version;

pub use clock::{Clock, SystemClock, TestClock};
