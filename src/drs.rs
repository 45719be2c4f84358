//! Acquisition controller for the single-shot waveform digitizer.
//!
//! [`Drs`] drives one DRS4-class evaluation board in single-shot mode for
//! pulse-like waveform capture: trigger/rate/sample-count configuration,
//! arm and ready-wait, raw and truncated readout, pedestal-subtracted
//! charge integration, and the timing/voltage calibration sequence.
//!
//! The board itself is enumerated over USB by the vendor SDK, so there is
//! no device node to own; process exclusivity is enforced instead by an
//! exclusive advisory lock on a fixed marker file in the system temporary
//! directory, taken at construction and held for the controller's lifetime.
//!
//! Once armed there is no capture timeout: the caller alone ensures that a
//! trigger eventually arrives, and absent one the next ready-wait blocks
//! indefinitely. [`Drs::force_stop`] aborts a hung arm with a software
//! trigger.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::board::{DigitizerBoard, DigitizerSdk, TriggerEdge, RAW_LEN};
use crate::error::{DeviceError, Result};
use crate::fd::{AccessMode, FdAccessor};

/// Trigger-source index of the dedicated external input; 0-3 select the
/// physical readout channels.
pub const TRIGGER_CHANNEL_EXTERNAL: u32 = 4;

/// Operating frequency re-applied for calibration, in GHz.
const OPERATING_GHZ: f64 = 2.0;

/// Settling pause after board-level configuration writes.
const CONFIG_SETTLE: Duration = Duration::from_micros(5);

/// Settling pause after trigger programming; trigger-status reads are
/// unreliable until the internal state settles.
const TRIGGER_SETTLE: Duration = Duration::from_micros(500);

/// Cadence of the busy poll in [`Drs::wait_ready`].
const READY_POLL: Duration = Duration::from_micros(5);

/// Device name used for lock ownership and log targets.
const DEVICE_NAME: &str = "DRS";

/// Locate the advisory-lock marker for the digitizer, creating it if
/// absent and leaving it untouched otherwise.
pub fn provision_lockfile() -> Result<PathBuf> {
    let path = std::env::temp_dir().join("drs.lock");
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .map_err(|e| DeviceError::Open {
            path: path.clone(),
            source: e,
        })?;
    Ok(path)
}

/// Controller for one digitizer board in single-shot mode.
///
/// Construction claims the cross-process lock, enumerates the first board
/// and applies the standing configuration (2 GHz, ±0.5 V input window,
/// external trigger). Dropping the controller releases the board and the
/// lock.
pub struct Drs {
    // Held for process exclusivity only; never read or written after open.
    fd: FdAccessor,
    sdk: Option<Box<dyn DigitizerSdk>>,
    depth: usize,

    trigger_channel: u32,
    trigger_level: f64,
    trigger_edge: TriggerEdge,
    trigger_delay_ns: f64,
    samples: usize,
}

impl std::fmt::Debug for Drs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drs")
            .field("fd", &self.fd)
            .field("sdk", &self.sdk.as_ref().map(|_| "<dyn DigitizerSdk>"))
            .field("depth", &self.depth)
            .field("trigger_channel", &self.trigger_channel)
            .field("trigger_level", &self.trigger_level)
            .field("trigger_edge", &self.trigger_edge)
            .field("trigger_delay_ns", &self.trigger_delay_ns)
            .field("samples", &self.samples)
            .finish()
    }
}

impl Drs {
    /// Open the controller against the fixed lock marker from
    /// [`provision_lockfile`].
    pub fn open(sdk: Box<dyn DigitizerSdk>) -> Result<Self> {
        let lock_path = provision_lockfile()?;
        Self::with_sdk(sdk, &lock_path)
    }

    /// Open the controller with an explicit lock-marker path.
    ///
    /// Fails with [`DeviceError::Lock`] if another process holds the
    /// marker, and with [`DeviceError::Unavailable`] if the manager found
    /// no boards. Either way nothing stays claimed on the error path.
    pub fn with_sdk(sdk: Box<dyn DigitizerSdk>, lock_path: &Path) -> Result<Self> {
        let fd = FdAccessor::open(DEVICE_NAME, lock_path, AccessMode::ReadWrite, true)?;

        debug!(target: DEVICE_NAME, "setting up digitizer board");
        if sdk.board_count() == 0 {
            return Err(DeviceError::Unavailable(
                "no digitizer boards found".to_string(),
            ));
        }

        let mut drs = Self {
            fd,
            sdk: Some(sdk),
            depth: 0,
            trigger_channel: TRIGGER_CHANNEL_EXTERNAL,
            trigger_level: 0.05,
            trigger_edge: TriggerEdge::Rise,
            trigger_delay_ns: 0.0,
            samples: 0,
        };

        {
            let board = drs.board_mut()?;
            board.init()?;
            info!(
                target: DEVICE_NAME,
                "found DRS{} board on USB, serial [{:04}], firmware [{:5}]",
                board.board_type(),
                board.serial_number(),
                board.firmware_version()
            );
        }
        let depth = drs.board_mut()?.channel_depth();
        drs.depth = depth;
        drs.samples = depth;
        thread::sleep(CONFIG_SETTLE);

        // Standing configuration for pulse capture. Transparent mode and
        // the internal clock calibration are deliberately left untouched.
        drs.board_mut()?.set_frequency(OPERATING_GHZ, true)?;
        drs.board_mut()?.set_input_range(0.0)?;
        drs.set_trigger(TRIGGER_CHANNEL_EXTERNAL, 0.05, TriggerEdge::Rise, 0.0)?;
        thread::sleep(CONFIG_SETTLE);

        debug!(target: DEVICE_NAME, "completed digitizer setup");
        Ok(drs)
    }

    /// Whether the SDK manager and the board are both present.
    pub fn is_available(&self) -> bool {
        self.sdk.as_ref().is_some_and(|sdk| sdk.board_count() > 0)
    }

    pub fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(DeviceError::Unavailable(
                "digitizer board is not available".to_string(),
            ))
        }
    }

    fn board_mut(&mut self) -> Result<&mut dyn DigitizerBoard> {
        self.sdk
            .as_mut()
            .and_then(|sdk| sdk.board_mut(0))
            .ok_or_else(|| {
                DeviceError::Unavailable("digitizer board is not available".to_string())
            })
    }

    /// Program the trigger.
    ///
    /// Channel 4 selects the dedicated external input; level and edge are
    /// only programmed for the physical channels 0-3, but the stored values
    /// survive an external-trigger interlude so reselecting a physical
    /// channel restores them. Delay is in nanoseconds and always applies.
    pub fn set_trigger(
        &mut self,
        channel: u32,
        level: f64,
        edge: TriggerEdge,
        delay_ns: f64,
    ) -> Result<()> {
        {
            let board = self.board_mut()?;
            board.enable_trigger(true)?;
            board.set_trigger_source(1 << channel)?;
            if channel < TRIGGER_CHANNEL_EXTERNAL {
                board.set_trigger_level(level)?;
                board.set_trigger_polarity(edge)?;
            }
            board.set_trigger_delay_ns(delay_ns)?;
        }

        self.trigger_channel = channel;
        if channel < TRIGGER_CHANNEL_EXTERNAL {
            self.trigger_level = level;
            self.trigger_edge = edge;
        }
        self.trigger_delay_ns = delay_ns;

        thread::sleep(TRIGGER_SETTLE);
        Ok(())
    }

    /// Last-configured trigger channel.
    pub fn trigger_channel(&self) -> u32 {
        self.trigger_channel
    }

    /// Last-configured trigger level in volts.
    pub fn trigger_level(&self) -> f64 {
        self.trigger_level
    }

    /// Last-configured trigger edge.
    pub fn trigger_edge(&self) -> TriggerEdge {
        self.trigger_edge
    }

    /// Last-configured trigger delay in nanoseconds.
    pub fn trigger_delay(&self) -> f64 {
        self.trigger_delay_ns
    }

    /// Request a sampling rate in GHz; the hardware rounds to the nearest
    /// supported frequency without reporting the adjustment.
    pub fn set_rate(&mut self, ghz: f64) -> Result<()> {
        self.board_mut()?.set_frequency(ghz, true)
    }

    /// The true programmed sampling rate in GHz, read from hardware.
    pub fn rate(&mut self) -> Result<f64> {
        self.board_mut()?.read_frequency()
    }

    /// Store the requested sample count.
    pub fn set_samples(&mut self, n: usize) {
        self.samples = n;
    }

    /// Effective sample count: the requested count clamped to the channel
    /// depth. This drives all truncated retrieval.
    pub fn samples(&self) -> usize {
        self.samples.min(self.depth)
    }

    /// Arm a single-shot capture. No timeout applies; the caller ensures a
    /// trigger eventually arrives.
    pub fn start_collect(&mut self) -> Result<()> {
        self.board_mut()?.start_domino()
    }

    /// Force a hung capture to stop with a software trigger.
    pub fn force_stop(&mut self) -> Result<()> {
        self.board_mut()?.soft_trigger()
    }

    /// Suspend until the board finishes digitizing, then flush every
    /// channel into the readable buffer.
    ///
    /// Polls busy at 5 µs cadence with no timeout. Retrieval methods call
    /// this themselves; call it directly only to block without reading.
    pub fn wait_ready(&mut self) -> Result<()> {
        let board = self.board_mut()?;
        while board.is_busy() {
            thread::sleep(READY_POLL);
        }
        board.transfer_waves(0, 8)
    }

    /// Whether digitization has finished, without blocking.
    pub fn is_ready(&mut self) -> Result<bool> {
        Ok(!self.board_mut()?.is_busy())
    }

    /// The last captured waveform of a logical channel, untruncated, in
    /// volts. Blocks until the board is ready.
    pub fn raw_waveform(&mut self, channel: u32) -> Result<Vec<f32>> {
        self.wait_ready()?;
        // Logical channels 0/1 both read the paired storage of physical
        // input 1, and so on: the hardware index is twice the logical one.
        let mut wave = vec![0.0f32; RAW_LEN];
        self.board_mut()?
            .get_wave(0, (channel * 2) as usize, &mut wave)?;
        Ok(wave)
    }

    /// The last captured waveform truncated to [`samples`](Drs::samples).
    pub fn waveform(&mut self, channel: u32) -> Result<Vec<f32>> {
        let mut wave = self.raw_waveform(channel)?;
        wave.truncate(self.samples());
        Ok(wave)
    }

    /// Per-sample timestamps of a logical channel in nanoseconds,
    /// untruncated. Valid until the next timing calibration, independent
    /// of capture.
    pub fn raw_time_array(&mut self, channel: u32) -> Result<Vec<f32>> {
        self.wait_ready()?;
        let board = self.board_mut()?;
        let cell = board.trigger_cell(0)?;
        let mut time = vec![0.0f32; RAW_LEN];
        board.get_time(0, (channel * 2) as usize, cell, &mut time)?;
        Ok(time)
    }

    /// Per-sample timestamps truncated to [`samples`](Drs::samples).
    pub fn time_array(&mut self, channel: u32) -> Result<Vec<f32>> {
        let mut time = self.raw_time_array(channel)?;
        time.truncate(self.samples());
        Ok(time)
    }

    /// Integrate the last waveform over `[int_start, int_stop)` with the
    /// pedestal estimated over `[ped_start, ped_stop)`, in units of
    /// amplitude x time (V·ns).
    ///
    /// Window bounds are sample indices and clamp silently to the channel
    /// depth, so `usize::MAX` runs to the buffer end. Equal pedestal bounds
    /// disable the subtraction. The sign flip corrects the instrument's
    /// negative pulse polarity, and sample spacing is assumed uniform at
    /// the programmed rate; the measured time array is deliberately not
    /// consulted.
    pub fn integrate(
        &mut self,
        channel: u32,
        int_start: usize,
        int_stop: usize,
        ped_start: usize,
        ped_stop: usize,
    ) -> Result<f64> {
        let wave = self.raw_waveform(channel)?;
        let depth = self.depth;

        let mut pedestal = 0.0f64;
        if ped_start != ped_stop {
            let lo = ped_start.min(depth);
            let hi = ped_stop.min(depth);
            if lo < hi {
                let sum: f64 = wave[lo..hi].iter().map(|&v| v as f64).sum();
                pedestal = sum / (hi - lo) as f64;
            }
        }

        let lo = int_start.min(depth);
        let hi = int_stop.min(depth);
        let mut area = 0.0f64;
        if lo < hi {
            area = wave[lo..hi].iter().map(|&v| v as f64).sum::<f64>();
            area -= pedestal * (hi - lo) as f64;
        }

        let timeslice = 1.0 / self.rate()?;
        Ok(-area * timeslice)
    }

    /// Run the timing and voltage calibration sequence.
    ///
    /// All inputs must be disconnected first; that precondition is
    /// operational and not checked here. Progress reporting from the SDK is
    /// intentionally discarded. The trigger configuration is clobbered by
    /// the sequence and replayed from the stored values afterwards, so
    /// read-backs are unchanged by a calibration run.
    pub fn run_calibration(&mut self) -> Result<()> {
        info!(target: DEVICE_NAME, "running timing and voltage calibration");
        {
            let board = self.board_mut()?;
            board.set_frequency(OPERATING_GHZ, true)?;
            board.calibrate_timing(&mut |_| {})?;
            board.set_refclk(false)?;
            board.calibrate_voltage(&mut |_| {})?;
        }

        let (channel, level, edge, delay) = (
            self.trigger_channel,
            self.trigger_level,
            self.trigger_edge,
            self.trigger_delay_ns,
        );
        self.set_trigger(channel, level, edge, delay)
    }

    /// Log the truncated buffer of a channel at debug level.
    pub fn dump_buffer(&mut self, channel: u32) -> Result<()> {
        let wave = self.waveform(channel)?;
        debug!(target: DEVICE_NAME, "channel {} buffer: {:?}", channel, wave);
        Ok(())
    }

    /// Path of the lock marker this controller holds.
    pub fn lock_path(&self) -> &Path {
        self.fd.path()
    }
}

impl Drop for Drs {
    fn drop(&mut self) {
        debug!(target: DEVICE_NAME, "deallocating the digitizer controller");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimSdk;
    use serial_test::serial;
    use tempfile::TempDir;

    const EPS: f64 = 1e-9;

    fn lock_path(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("drs.lock");
        std::fs::File::create(&path).unwrap();
        path
    }

    fn sim_drs() -> (Drs, TempDir) {
        let dir = TempDir::new().unwrap();
        let drs = Drs::with_sdk(Box::new(SimSdk::new()), &lock_path(&dir)).unwrap();
        (drs, dir)
    }

    fn window_sum(wave: &[f32], lo: usize, hi: usize) -> f64 {
        wave[lo..hi].iter().map(|&v| v as f64).sum()
    }

    #[test]
    fn construction_applies_standing_configuration() {
        let (mut drs, _dir) = sim_drs();
        assert!(drs.is_available());
        assert_eq!(drs.trigger_channel(), TRIGGER_CHANNEL_EXTERNAL);
        assert_eq!(drs.trigger_level(), 0.05);
        assert_eq!(drs.trigger_edge(), TriggerEdge::Rise);
        assert_eq!(drs.trigger_delay(), 0.0);
        assert_eq!(drs.rate().unwrap(), 2.0);
    }

    #[test]
    fn no_boards_is_a_construction_error() {
        let dir = TempDir::new().unwrap();
        let err = Drs::with_sdk(Box::new(SimSdk::empty()), &lock_path(&dir)).unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(_)), "got {err:?}");
    }

    #[test]
    fn samples_clamp_to_channel_depth() {
        let (mut drs, _dir) = sim_drs();
        drs.set_samples(4096);
        assert_eq!(drs.samples(), 1024);
        drs.set_samples(256);
        assert_eq!(drs.samples(), 256);
    }

    #[test]
    fn rate_reads_back_the_snapped_frequency() {
        let (mut drs, _dir) = sim_drs();
        drs.set_rate(1.9).unwrap();
        assert_eq!(drs.rate().unwrap(), 2.0);
    }

    #[test]
    fn external_trigger_retains_level_and_edge() {
        let (mut drs, _dir) = sim_drs();
        drs.set_trigger(0, 0.1, TriggerEdge::Fall, 5.0).unwrap();

        // Level/edge arguments are ignored while the external line is
        // selected, but the stored values survive.
        drs.set_trigger(TRIGGER_CHANNEL_EXTERNAL, 0.9, TriggerEdge::Rise, 0.0)
            .unwrap();
        assert_eq!(drs.trigger_channel(), TRIGGER_CHANNEL_EXTERNAL);
        assert_eq!(drs.trigger_level(), 0.1);
        assert_eq!(drs.trigger_edge(), TriggerEdge::Fall);
        assert_eq!(drs.trigger_delay(), 0.0);

        drs.set_trigger(0, drs.trigger_level(), drs.trigger_edge(), 5.0)
            .unwrap();
        assert_eq!(drs.trigger_level(), 0.1);
        assert_eq!(drs.trigger_edge(), TriggerEdge::Fall);
    }

    #[test]
    fn calibration_restores_trigger_configuration() {
        let (mut drs, _dir) = sim_drs();
        drs.set_trigger(2, 0.08, TriggerEdge::Fall, 12.5).unwrap();

        drs.run_calibration().unwrap();

        assert_eq!(drs.trigger_channel(), 2);
        assert_eq!(drs.trigger_level(), 0.08);
        assert_eq!(drs.trigger_edge(), TriggerEdge::Fall);
        assert_eq!(drs.trigger_delay(), 12.5);
    }

    #[test]
    fn second_controller_fails_to_lock_until_first_drops() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);

        let first = Drs::with_sdk(Box::new(SimSdk::new()), &path).unwrap();
        let err = Drs::with_sdk(Box::new(SimSdk::new()), &path).unwrap_err();
        assert!(matches!(err, DeviceError::Lock { .. }), "got {err:?}");

        drop(first);
        Drs::with_sdk(Box::new(SimSdk::new()), &path).unwrap();
    }

    #[test]
    fn wait_ready_when_idle_returns_and_still_flushes() {
        let dir = TempDir::new().unwrap();
        let mut sdk = SimSdk::new();
        let stats = sdk.sim_board_mut(0).unwrap().stats();
        let mut drs = Drs::with_sdk(Box::new(sdk), &lock_path(&dir)).unwrap();

        let before = stats.lock().unwrap().flushes;
        drs.wait_ready().unwrap();
        assert_eq!(stats.lock().unwrap().flushes, before + 1);
    }

    #[test]
    fn force_stop_ends_a_manual_arm() {
        let dir = TempDir::new().unwrap();
        let sdk = SimSdk::new().manual_trigger();
        let mut drs = Drs::with_sdk(Box::new(sdk), &lock_path(&dir)).unwrap();

        drs.start_collect().unwrap();
        assert!(!drs.is_ready().unwrap());

        drs.force_stop().unwrap();
        assert!(drs.is_ready().unwrap());
        assert_eq!(drs.waveform(0).unwrap().len(), 1024);
    }

    #[test]
    fn readout_failure_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let mut sdk = SimSdk::new();
        sdk.sim_board_mut(0).unwrap().set_fail_reads(true);
        let mut drs = Drs::with_sdk(Box::new(sdk), &lock_path(&dir)).unwrap();

        drs.start_collect().unwrap();
        let err = drs.raw_waveform(0).unwrap_err();
        assert!(matches!(err, DeviceError::Io { .. }), "got {err:?}");
    }

    #[test]
    fn integrate_without_pedestal_is_the_scaled_window_sum() {
        let (mut drs, _dir) = sim_drs();
        drs.start_collect().unwrap();

        let wave = drs.raw_waveform(0).unwrap();
        let rate = drs.rate().unwrap();
        let expected = -window_sum(&wave, 100, 200) / rate;

        // Equal pedestal bounds disable the subtraction.
        let got = drs.integrate(0, 100, 200, 7, 7).unwrap();
        assert!((got - expected).abs() < EPS, "{got} vs {expected}");
    }

    #[test]
    fn integrate_subtracts_the_mean_pedestal() {
        let (mut drs, _dir) = sim_drs();
        drs.start_collect().unwrap();

        let wave = drs.raw_waveform(0).unwrap();
        let rate = drs.rate().unwrap();
        let pedestal = window_sum(&wave, 0, 50) / 50.0;
        let expected = -(window_sum(&wave, 100, 200) - pedestal * 100.0) / rate;

        let got = drs.integrate(0, 100, 200, 0, 50).unwrap();
        assert!((got - expected).abs() < EPS, "{got} vs {expected}");
    }

    #[test]
    fn out_of_range_windows_clamp_to_depth() {
        let (mut drs, _dir) = sim_drs();
        drs.start_collect().unwrap();

        let wave = drs.raw_waveform(0).unwrap();
        let rate = drs.rate().unwrap();

        // usize::MAX clamps to the buffer end; the clamped-empty pedestal
        // window contributes nothing.
        let expected = -window_sum(&wave, 0, 1024) / rate;
        let got = drs
            .integrate(0, 0, usize::MAX, usize::MAX, usize::MAX - 1)
            .unwrap();
        assert!((got - expected).abs() < EPS, "{got} vs {expected}");

        // An inverted window integrates to zero.
        let got = drs.integrate(0, 500, 100, 7, 7).unwrap();
        assert_eq!(got, 0.0);
    }

    #[test]
    fn single_shot_capture_scenario() {
        let (mut drs, _dir) = sim_drs();
        drs.set_trigger(TRIGGER_CHANNEL_EXTERNAL, 0.05, TriggerEdge::Rise, 0.0)
            .unwrap();
        drs.set_rate(2.0).unwrap();
        drs.set_samples(1024);
        assert_eq!(drs.samples(), 1024);

        drs.start_collect().unwrap();

        let wave = drs.waveform(0).unwrap();
        assert_eq!(wave.len(), 1024);

        let raw = drs.raw_waveform(0).unwrap();
        assert_eq!(raw.len(), RAW_LEN);
        let pedestal = window_sum(&raw, 0, 50) / 50.0;
        let expected = -(window_sum(&raw, 100, 200) - pedestal * 100.0) / drs.rate().unwrap();
        let got = drs.integrate(0, 100, 200, 0, 50).unwrap();
        assert!((got - expected).abs() < EPS, "{got} vs {expected}");

        let time = drs.time_array(0).unwrap();
        assert_eq!(time.len(), 1024);
        assert!(time.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    #[serial]
    fn fixed_marker_provisioning_round_trip() {
        let path = provision_lockfile().unwrap();
        assert!(path.exists());

        let drs = Drs::open(Box::new(SimSdk::new())).unwrap();
        assert_eq!(drs.lock_path(), path);
        drop(drs);

        // Marker outlives the controller; only the lock is released.
        assert!(path.exists());
        Drs::open(Box::new(SimSdk::new())).unwrap();
    }
}
