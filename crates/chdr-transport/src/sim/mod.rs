//! Simulated device for tests and dry runs.
//!
//! - [`SimulatedRegisters`]: register bank with firmware claim behaviour.
//! - [`SimulatedProxy`]: kernel proxy for DMA links.
//! - [`SimulatedDevice`]: a networked device on loopback UDP answering
//!   firmware control, MTU probes and CHDR stream traffic.

mod device;
mod proxy;
mod registers;

pub use device::{SimulatedDevice, SimulatedDeviceConfig};
pub use proxy::{BusyMode, ProxyCall, SimulatedProxy};
pub use registers::{SimulatedRegisters, FW_CLAIM_EXPIRY};
