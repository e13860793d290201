//! Core timing types for lazily synchronised emulation.
//!
//! Everything is measured in master clock cycles. Devices that run on a
//! divided clock are not stepped in lock-step with the CPU; they keep a
//! [`DeviceClock`] and catch up in one batch whenever they are observed.

mod bus;
mod clock;
mod observable;
mod prediction;
mod ticks;

pub use bus::Bus;
pub use clock::{CatchUp, DeviceClock, MasterClock};
pub use observable::{Observable, Value};
pub use prediction::PredictionWindow;
pub use ticks::Ticks;
