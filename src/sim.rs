//! Software digitizer backend.
//!
//! [`SimSdk`] and [`SimBoard`] implement the [`board`](crate::board) traits
//! without hardware: SiPM-like negative pulses on a noisy baseline, the
//! single-shot busy/armed state machine, frequency snapping to the supported
//! table, and calibration bookkeeping. The simulated board captures on arm
//! by default so a single-process run never blocks forever waiting for an
//! external trigger; [`SimSdk::manual_trigger`] disables that for exercising
//! the forced-stop path.

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::board::{DigitizerBoard, DigitizerSdk, TriggerEdge, RAW_LEN};
use crate::error::{DeviceError, Result};

/// Hardware readout channels per chip (8 inputs plus the clock channel).
const N_HW_CHANNELS: usize = 9;

/// Sampling frequencies the PLL locks to, in GHz.
const SUPPORTED_GHZ: &[f64] = &[0.5, 1.0, 2.0, 2.5, 4.0, 5.0];

/// Counters observable from tests while the board itself is boxed away
/// inside the controller.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimStats {
    pub captures: u32,
    pub flushes: u32,
    pub soft_triggers: u32,
    pub timing_calibrations: u32,
    pub voltage_calibrations: u32,
}

/// A simulated digitizer board.
#[derive(Debug)]
pub struct SimBoard {
    serial: i32,
    depth: usize,
    freq_ghz: f64,
    input_center: f64,
    timing_calibrated: bool,
    voltage_calibrated: bool,

    trigger_enabled: bool,
    trigger_source: u32,
    trigger_level: f64,
    trigger_edge: TriggerEdge,
    trigger_delay_ns: f64,

    armed: bool,
    busy: bool,
    auto_trigger: bool,
    fail_reads: bool,
    last_trigger_cell: usize,

    time_base: Vec<f32>,
    captured: Vec<Vec<f32>>,
    readout: Vec<Vec<f32>>,

    rng: StdRng,
    stats: Arc<Mutex<SimStats>>,
}

impl SimBoard {
    fn new(index: usize) -> Self {
        let mut board = Self {
            serial: 2780 + index as i32,
            depth: 1024,
            freq_ghz: 1.0,
            input_center: 0.0,
            timing_calibrated: false,
            voltage_calibrated: false,
            trigger_enabled: false,
            trigger_source: 0,
            trigger_level: 0.0,
            trigger_edge: TriggerEdge::Rise,
            trigger_delay_ns: 0.0,
            armed: false,
            busy: false,
            auto_trigger: true,
            fail_reads: false,
            last_trigger_cell: 0,
            time_base: Vec::new(),
            captured: vec![vec![0.0; RAW_LEN]; N_HW_CHANNELS],
            readout: vec![vec![0.0; RAW_LEN]; N_HW_CHANNELS],
            rng: StdRng::seed_from_u64(0x0d45 + index as u64),
            stats: Arc::new(Mutex::new(SimStats::default())),
        };
        board.regen_time_base();
        board
    }

    /// Fail the next waveform/time reads with an I/O error.
    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    pub fn stats(&self) -> Arc<Mutex<SimStats>> {
        Arc::clone(&self.stats)
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn trigger_enabled(&self) -> bool {
        self.trigger_enabled
    }

    pub fn trigger_source(&self) -> u32 {
        self.trigger_source
    }

    pub fn trigger_level(&self) -> f64 {
        self.trigger_level
    }

    pub fn trigger_edge(&self) -> TriggerEdge {
        self.trigger_edge
    }

    pub fn trigger_delay_ns(&self) -> f64 {
        self.trigger_delay_ns
    }

    pub fn input_center(&self) -> f64 {
        self.input_center
    }

    /// (timing, voltage) calibration flags.
    pub fn calibration_state(&self) -> (bool, bool) {
        (self.timing_calibrated, self.voltage_calibrated)
    }

    /// Simulate a trigger: digitize a fresh pulse on every channel and
    /// leave the busy state.
    fn fire(&mut self) {
        let baseline: f64 = self.rng.random_range(-0.003..0.003);
        for ch in 0..N_HW_CHANNELS {
            let amplitude: f64 = self.rng.random_range(0.05..0.15);
            let center: f64 = self.rng.random_range(200.0..600.0);
            let width: f64 = self.rng.random_range(8.0..20.0);
            for i in 0..RAW_LEN {
                let noise: f64 = self.rng.random_range(-0.001..0.001);
                let arg = (i as f64 - center) / width;
                let pulse = -amplitude * (-0.5 * arg * arg).exp();
                self.captured[ch][i] = (baseline + noise + pulse) as f32;
            }
        }
        self.last_trigger_cell = self.rng.random_range(0..self.depth);
        self.busy = false;
        self.armed = false;
        self.stats.lock().unwrap().captures += 1;
    }

    fn regen_time_base(&mut self) {
        // An uncalibrated domino chain shows a per-cell ripple around the
        // nominal spacing; timing calibration flattens it.
        let dt = 1.0 / self.freq_ghz;
        let ripple = if self.timing_calibrated { 0.0 } else { 0.02 };
        self.time_base = (0..RAW_LEN)
            .map(|i| {
                let t = i as f64 * dt;
                (t + ripple * dt * (i as f64 * 0.7).sin()) as f32
            })
            .collect();
    }

    fn read_guard(&self) -> Result<()> {
        if self.fail_reads {
            return Err(DeviceError::io("SimBoard", "simulated readout failure"));
        }
        Ok(())
    }
}

impl DigitizerBoard for SimBoard {
    fn init(&mut self) -> Result<()> {
        self.busy = false;
        self.armed = false;
        for buf in self.captured.iter_mut().chain(self.readout.iter_mut()) {
            buf.fill(0.0);
        }
        Ok(())
    }

    fn board_type(&self) -> i32 {
        9
    }

    fn serial_number(&self) -> i32 {
        self.serial
    }

    fn firmware_version(&self) -> i32 {
        30000
    }

    fn channel_depth(&self) -> usize {
        self.depth
    }

    fn set_frequency(&mut self, ghz: f64, _wait: bool) -> Result<()> {
        let snapped = SUPPORTED_GHZ
            .iter()
            .copied()
            .min_by(|a, b| (a - ghz).abs().partial_cmp(&(b - ghz).abs()).unwrap())
            .unwrap_or(ghz);
        self.freq_ghz = snapped;
        self.regen_time_base();
        Ok(())
    }

    fn read_frequency(&mut self) -> Result<f64> {
        Ok(self.freq_ghz)
    }

    fn set_input_range(&mut self, center_volts: f64) -> Result<()> {
        self.input_center = center_volts;
        Ok(())
    }

    fn enable_trigger(&mut self, enabled: bool) -> Result<()> {
        self.trigger_enabled = enabled;
        Ok(())
    }

    fn set_trigger_source(&mut self, mask: u32) -> Result<()> {
        self.trigger_source = mask;
        Ok(())
    }

    fn set_trigger_level(&mut self, volts: f64) -> Result<()> {
        self.trigger_level = volts;
        Ok(())
    }

    fn set_trigger_polarity(&mut self, edge: TriggerEdge) -> Result<()> {
        self.trigger_edge = edge;
        Ok(())
    }

    fn set_trigger_delay_ns(&mut self, ns: f64) -> Result<()> {
        self.trigger_delay_ns = ns;
        Ok(())
    }

    fn start_domino(&mut self) -> Result<()> {
        self.armed = true;
        self.busy = true;
        if self.auto_trigger {
            self.fire();
        }
        Ok(())
    }

    fn soft_trigger(&mut self) -> Result<()> {
        self.stats.lock().unwrap().soft_triggers += 1;
        if self.busy {
            self.fire();
        }
        Ok(())
    }

    fn is_busy(&mut self) -> bool {
        self.busy
    }

    fn transfer_waves(&mut self, first: usize, last: usize) -> Result<()> {
        for ch in first..=last.min(N_HW_CHANNELS - 1) {
            self.readout[ch].copy_from_slice(&self.captured[ch]);
        }
        self.stats.lock().unwrap().flushes += 1;
        Ok(())
    }

    fn trigger_cell(&mut self, _chip: usize) -> Result<usize> {
        Ok(self.last_trigger_cell)
    }

    fn get_wave(&mut self, _chip: usize, hw_channel: usize, out: &mut [f32]) -> Result<()> {
        self.read_guard()?;
        let src = self
            .readout
            .get(hw_channel)
            .ok_or_else(|| DeviceError::io("SimBoard", format!("no channel {hw_channel}")))?;
        let n = out.len().min(RAW_LEN);
        out[..n].copy_from_slice(&src[..n]);
        Ok(())
    }

    fn get_time(
        &mut self,
        _chip: usize,
        _hw_channel: usize,
        _trigger_cell: usize,
        out: &mut [f32],
    ) -> Result<()> {
        self.read_guard()?;
        let n = out.len().min(RAW_LEN);
        out[..n].copy_from_slice(&self.time_base[..n]);
        Ok(())
    }

    fn calibrate_timing(&mut self, progress: &mut dyn FnMut(i32)) -> Result<()> {
        for pct in [0, 25, 50, 75, 100] {
            progress(pct);
        }
        self.timing_calibrated = true;
        self.regen_time_base();
        self.stats.lock().unwrap().timing_calibrations += 1;
        Ok(())
    }

    fn set_refclk(&mut self, _remote: bool) -> Result<()> {
        Ok(())
    }

    fn calibrate_voltage(&mut self, progress: &mut dyn FnMut(i32)) -> Result<()> {
        for pct in [0, 50, 100] {
            progress(pct);
        }
        self.voltage_calibrated = true;
        self.stats.lock().unwrap().voltage_calibrations += 1;
        Ok(())
    }
}

/// Simulated device manager.
#[derive(Debug)]
pub struct SimSdk {
    boards: Vec<SimBoard>,
}

impl SimSdk {
    /// One simulated board, auto-triggering on arm.
    pub fn new() -> Self {
        Self::with_boards(1)
    }

    pub fn with_boards(n: usize) -> Self {
        Self {
            boards: (0..n).map(SimBoard::new).collect(),
        }
    }

    /// A manager that found no boards.
    pub fn empty() -> Self {
        Self::with_boards(0)
    }

    /// Disable auto-triggering: captures then end only via a software
    /// trigger.
    pub fn manual_trigger(mut self) -> Self {
        for board in &mut self.boards {
            board.auto_trigger = false;
        }
        self
    }

    pub fn sim_board_mut(&mut self, index: usize) -> Option<&mut SimBoard> {
        self.boards.get_mut(index)
    }
}

impl Default for SimSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitizerSdk for SimSdk {
    fn board_count(&self) -> usize {
        self.boards.len()
    }

    fn board_mut(&mut self, index: usize) -> Option<&mut dyn DigitizerBoard> {
        self.boards
            .get_mut(index)
            .map(|b| b as &mut dyn DigitizerBoard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_snaps_to_supported_table() {
        let mut board = SimBoard::new(0);
        board.set_frequency(1.9, true).unwrap();
        assert_eq!(board.read_frequency().unwrap(), 2.0);
        board.set_frequency(0.1, true).unwrap();
        assert_eq!(board.read_frequency().unwrap(), 0.5);
    }

    #[test]
    fn trigger_programming_is_recorded() {
        let mut board = SimBoard::new(0);
        board.enable_trigger(true).unwrap();
        board.set_trigger_source(1 << 4).unwrap();
        board.set_trigger_level(0.05).unwrap();
        board.set_trigger_polarity(TriggerEdge::Fall).unwrap();
        board.set_trigger_delay_ns(30.0).unwrap();
        board.set_input_range(0.0).unwrap();

        assert!(board.trigger_enabled());
        assert_eq!(board.trigger_source(), 0x10);
        assert_eq!(board.trigger_level(), 0.05);
        assert_eq!(board.trigger_edge(), TriggerEdge::Fall);
        assert_eq!(board.trigger_delay_ns(), 30.0);
        assert_eq!(board.input_center(), 0.0);
    }

    #[test]
    fn calibration_flags_progress_through_the_sequence() {
        let mut board = SimBoard::new(0);
        assert_eq!(board.calibration_state(), (false, false));

        board.calibrate_timing(&mut |_| {}).unwrap();
        board.set_refclk(false).unwrap();
        board.calibrate_voltage(&mut |_| {}).unwrap();

        assert_eq!(board.calibration_state(), (true, true));
        let stats = board.stats();
        let stats = stats.lock().unwrap();
        assert_eq!(stats.timing_calibrations, 1);
        assert_eq!(stats.voltage_calibrations, 1);
    }

    #[test]
    fn soft_trigger_ends_a_manual_capture() {
        let mut board = SimBoard::new(0);
        board.auto_trigger = false;

        board.start_domino().unwrap();
        assert!(board.is_armed());
        assert!(board.is_busy());

        board.soft_trigger().unwrap();
        assert!(!board.is_armed());
        assert!(!board.is_busy());
        assert_eq!(board.stats().lock().unwrap().captures, 1);
    }

    #[test]
    fn readout_holds_stale_data_until_transfer() {
        let mut board = SimBoard::new(0);
        board.start_domino().unwrap();

        let mut wave = vec![0.0f32; RAW_LEN];
        board.get_wave(0, 0, &mut wave).unwrap();
        assert!(wave.iter().all(|&v| v == 0.0));

        board.transfer_waves(0, 8).unwrap();
        board.get_wave(0, 0, &mut wave).unwrap();
        assert!(wave.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn timing_calibration_changes_the_time_base() {
        let mut board = SimBoard::new(0);
        let mut before = vec![0.0f32; RAW_LEN];
        board.get_time(0, 0, 0, &mut before).unwrap();

        let mut reported = Vec::new();
        board.calibrate_timing(&mut |pct| reported.push(pct)).unwrap();
        assert_eq!(reported.last(), Some(&100));

        let mut after = vec![0.0f32; RAW_LEN];
        board.get_time(0, 0, 0, &mut after).unwrap();
        assert_ne!(before, after);
        // Calibrated spacing is uniform at the programmed frequency.
        let dt = after[1] - after[0];
        assert!((dt - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_manager_reports_no_boards() {
        let mut sdk = SimSdk::empty();
        assert_eq!(sdk.board_count(), 0);
        assert!(sdk.board_mut(0).is_none());
    }
}
