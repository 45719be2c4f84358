//! Control layer for a single-shot waveform digitizer used in detector
//! data acquisition.
//!
//! The crate drives one DRS4-class evaluation board for triggered pulse
//! capture: exclusive device ownership via an advisory lock, trigger and
//! rate configuration, single-shot arm/ready-wait, waveform and time-array
//! readout, pedestal-subtracted charge integration, and the timing/voltage
//! calibration sequence. The vendor SDK sits behind the traits in
//! [`board`]; [`sim`] provides a software board for tests and dry runs, and
//! the `drs_hardware` feature links the real backend.

pub mod board;
pub mod config;
pub mod drs;
pub mod error;
pub mod fd;
#[cfg(feature = "drs_hardware")]
pub mod hw;
pub mod sim;

pub use board::{DigitizerBoard, DigitizerSdk, TriggerEdge, RAW_LEN};
pub use config::Conf;
pub use drs::{provision_lockfile, Drs, TRIGGER_CHANNEL_EXTERNAL};
pub use error::{DeviceError, Result};
pub use fd::{wait_path_accessible, AccessMode, FdAccessor};
pub use sim::{SimSdk, SimStats};
