#![warn(clippy::pedantic)]
#![warn(clippy::all)]

pub mod ccd;
pub mod device_manager;
pub mod link;
pub mod mock;
pub mod monochromator;
pub mod protocol;

pub use ccd::ChargeCoupledDevice;
pub use device_manager::{DeviceManager, IclConfig};
pub use link::IclLink;
pub use monochromator::Monochromator;
pub use protocol::{IclError, IclResult};
