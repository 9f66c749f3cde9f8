pub mod device;
pub mod memory;
pub mod regs;
pub mod sim;

pub use device::{Device, RawMmuFault, RegisterSpace};
pub use memory::{DmaBuffer, HostMemory, PhysMemory};
pub use sim::{HangMode, SimRegisters};
