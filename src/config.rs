use confique::Config;

use crate::board::TriggerEdge;

/// Run configuration for the readout binary, loaded from TOML with
/// environment overrides.
#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run: RunSettings,
    #[config(nested)]
    pub trigger: TriggerSettings,
    #[config(nested)]
    pub acquisition: AcquisitionSettings,
    #[config(nested)]
    pub integration: IntegrationSettings,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    /// Number of single-shot events to acquire.
    #[config(default = 1)]
    pub events: usize,
    /// Run the timing and voltage calibration before acquiring. All inputs
    /// must be disconnected.
    #[config(default = false)]
    pub calibrate: bool,
    /// Logical channel to read out and integrate.
    #[config(default = 0)]
    pub channel: u32,
}

#[derive(Config, Debug, Clone)]
pub struct TriggerSettings {
    /// 0-3 for the physical inputs, 4 for the external line.
    #[config(default = 4)]
    pub channel: u32,
    /// Threshold in volts; only used for channels 0-3.
    #[config(default = 0.05)]
    pub level: f64,
    #[config(default = "Rise")]
    pub edge: TriggerEdge,
    /// Trigger delay in nanoseconds.
    #[config(default = 0.0)]
    pub delay_ns: f64,
}

#[derive(Config, Debug, Clone)]
pub struct AcquisitionSettings {
    /// Target sampling rate in GHz; the board rounds to the nearest
    /// supported value.
    #[config(default = 2.0)]
    pub rate: f64,
    /// Requested samples per capture, clamped to the channel depth.
    #[config(default = 1024)]
    pub samples: usize,
}

#[derive(Config, Debug, Clone)]
pub struct IntegrationSettings {
    #[config(default = 0)]
    pub int_start: usize,
    #[config(default = 1024)]
    pub int_stop: usize,
    /// Equal pedestal bounds disable the subtraction.
    #[config(default = 0)]
    pub ped_start: usize,
    #[config(default = 0)]
    pub ped_stop: usize,
}
