//! Hardware backend over the vendor DRS library.
//!
//! The vendor distribution exposes C++ classes; these bindings target the
//! thin C-linkage wrapper (`libdrs4shim`) built alongside it, one flat
//! function per board operation with an `int` status return (0 on
//! success). Board pointers are owned by the manager handle and stay valid
//! until `drs_free`.

#![allow(non_camel_case_types)]

use std::os::raw::{c_double, c_int, c_uint, c_void};

use crate::board::{DigitizerBoard, DigitizerSdk, TriggerEdge};
use crate::error::{DeviceError, Result};

type drs_handle = *mut c_void;
type drs_board = *mut c_void;

type drs_progress_fn = extern "C" fn(pct: c_int, ctx: *mut c_void);

#[link(name = "drs4shim")]
extern "C" {
    fn drs_create(err: *mut u8, err_len: usize) -> drs_handle;
    fn drs_free(handle: drs_handle);
    fn drs_num_boards(handle: drs_handle) -> c_int;
    fn drs_get_board(handle: drs_handle, index: c_int) -> drs_board;

    fn drs_board_init(board: drs_board) -> c_int;
    fn drs_board_type(board: drs_board) -> c_int;
    fn drs_board_serial(board: drs_board) -> c_int;
    fn drs_board_firmware(board: drs_board) -> c_int;
    fn drs_channel_depth(board: drs_board) -> c_int;

    fn drs_set_frequency(board: drs_board, ghz: c_double, wait: c_int) -> c_int;
    fn drs_read_frequency(board: drs_board, chip: c_int, out: *mut c_double) -> c_int;
    fn drs_set_input_range(board: drs_board, center: c_double) -> c_int;

    fn drs_enable_trigger(board: drs_board, flag1: c_int, flag2: c_int) -> c_int;
    fn drs_set_trigger_source(board: drs_board, mask: c_uint) -> c_int;
    fn drs_set_trigger_level(board: drs_board, volts: c_double) -> c_int;
    fn drs_set_trigger_polarity(board: drs_board, negative: c_int) -> c_int;
    fn drs_set_trigger_delay_ns(board: drs_board, ns: c_double) -> c_int;

    fn drs_start_domino(board: drs_board) -> c_int;
    fn drs_soft_trigger(board: drs_board) -> c_int;
    fn drs_is_busy(board: drs_board) -> c_int;
    fn drs_transfer_waves(board: drs_board, first: c_int, last: c_int) -> c_int;
    fn drs_trigger_cell(board: drs_board, chip: c_int, out: *mut c_int) -> c_int;
    fn drs_get_wave(board: drs_board, chip: c_int, channel: c_int, out: *mut f32) -> c_int;
    fn drs_get_time(
        board: drs_board,
        chip: c_int,
        channel: c_int,
        trigger_cell: c_int,
        out: *mut f32,
    ) -> c_int;

    fn drs_calibrate_timing(board: drs_board, cb: drs_progress_fn, ctx: *mut c_void) -> c_int;
    fn drs_set_refclk(board: drs_board, remote: c_int) -> c_int;
    fn drs_calibrate_volt(board: drs_board, cb: drs_progress_fn, ctx: *mut c_void) -> c_int;
}

fn check(op: &str, rc: c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(DeviceError::io("DRS", format!("{op} failed with status {rc}")))
    }
}

extern "C" fn progress_trampoline(pct: c_int, ctx: *mut c_void) {
    let cb = unsafe { &mut *(ctx as *mut &mut dyn FnMut(i32)) };
    cb(pct);
}

/// One board owned by [`HwSdk`].
pub struct HwBoard {
    ptr: drs_board,
}

impl DigitizerBoard for HwBoard {
    fn init(&mut self) -> Result<()> {
        check("init", unsafe { drs_board_init(self.ptr) })
    }

    fn board_type(&self) -> i32 {
        unsafe { drs_board_type(self.ptr) }
    }

    fn serial_number(&self) -> i32 {
        unsafe { drs_board_serial(self.ptr) }
    }

    fn firmware_version(&self) -> i32 {
        unsafe { drs_board_firmware(self.ptr) }
    }

    fn channel_depth(&self) -> usize {
        unsafe { drs_channel_depth(self.ptr) as usize }
    }

    fn set_frequency(&mut self, ghz: f64, wait: bool) -> Result<()> {
        check("set_frequency", unsafe {
            drs_set_frequency(self.ptr, ghz, wait as c_int)
        })
    }

    fn read_frequency(&mut self) -> Result<f64> {
        let mut ghz = 0.0;
        check("read_frequency", unsafe {
            drs_read_frequency(self.ptr, 0, &mut ghz)
        })?;
        Ok(ghz)
    }

    fn set_input_range(&mut self, center_volts: f64) -> Result<()> {
        check("set_input_range", unsafe {
            drs_set_input_range(self.ptr, center_volts)
        })
    }

    fn enable_trigger(&mut self, enabled: bool) -> Result<()> {
        check("enable_trigger", unsafe {
            drs_enable_trigger(self.ptr, enabled as c_int, 0)
        })
    }

    fn set_trigger_source(&mut self, mask: u32) -> Result<()> {
        check("set_trigger_source", unsafe {
            drs_set_trigger_source(self.ptr, mask)
        })
    }

    fn set_trigger_level(&mut self, volts: f64) -> Result<()> {
        check("set_trigger_level", unsafe {
            drs_set_trigger_level(self.ptr, volts)
        })
    }

    fn set_trigger_polarity(&mut self, edge: TriggerEdge) -> Result<()> {
        check("set_trigger_polarity", unsafe {
            drs_set_trigger_polarity(self.ptr, edge.is_falling() as c_int)
        })
    }

    fn set_trigger_delay_ns(&mut self, ns: f64) -> Result<()> {
        check("set_trigger_delay_ns", unsafe {
            drs_set_trigger_delay_ns(self.ptr, ns)
        })
    }

    fn start_domino(&mut self) -> Result<()> {
        check("start_domino", unsafe { drs_start_domino(self.ptr) })
    }

    fn soft_trigger(&mut self) -> Result<()> {
        check("soft_trigger", unsafe { drs_soft_trigger(self.ptr) })
    }

    fn is_busy(&mut self) -> bool {
        unsafe { drs_is_busy(self.ptr) != 0 }
    }

    fn transfer_waves(&mut self, first: usize, last: usize) -> Result<()> {
        check("transfer_waves", unsafe {
            drs_transfer_waves(self.ptr, first as c_int, last as c_int)
        })
    }

    fn trigger_cell(&mut self, chip: usize) -> Result<usize> {
        let mut cell = 0;
        check("trigger_cell", unsafe {
            drs_trigger_cell(self.ptr, chip as c_int, &mut cell)
        })?;
        Ok(cell as usize)
    }

    fn get_wave(&mut self, chip: usize, hw_channel: usize, out: &mut [f32]) -> Result<()> {
        check("get_wave", unsafe {
            drs_get_wave(self.ptr, chip as c_int, hw_channel as c_int, out.as_mut_ptr())
        })
    }

    fn get_time(
        &mut self,
        chip: usize,
        hw_channel: usize,
        trigger_cell: usize,
        out: &mut [f32],
    ) -> Result<()> {
        check("get_time", unsafe {
            drs_get_time(
                self.ptr,
                chip as c_int,
                hw_channel as c_int,
                trigger_cell as c_int,
                out.as_mut_ptr(),
            )
        })
    }

    fn calibrate_timing(&mut self, progress: &mut dyn FnMut(i32)) -> Result<()> {
        let mut cb: &mut dyn FnMut(i32) = progress;
        check("calibrate_timing", unsafe {
            drs_calibrate_timing(
                self.ptr,
                progress_trampoline,
                &mut cb as *mut _ as *mut c_void,
            )
        })
    }

    fn set_refclk(&mut self, remote: bool) -> Result<()> {
        check("set_refclk", unsafe {
            drs_set_refclk(self.ptr, remote as c_int)
        })
    }

    fn calibrate_voltage(&mut self, progress: &mut dyn FnMut(i32)) -> Result<()> {
        let mut cb: &mut dyn FnMut(i32) = progress;
        check("calibrate_volt", unsafe {
            drs_calibrate_volt(
                self.ptr,
                progress_trampoline,
                &mut cb as *mut _ as *mut c_void,
            )
        })
    }
}

/// The vendor device manager. Owns the enumerated boards; dropping it
/// frees them all.
pub struct HwSdk {
    handle: drs_handle,
    boards: Vec<HwBoard>,
}

impl HwSdk {
    /// Create the SDK instance and enumerate boards over USB.
    pub fn create() -> Result<Self> {
        let mut err = vec![0u8; 256];
        let handle = unsafe { drs_create(err.as_mut_ptr(), err.len()) };
        if handle.is_null() {
            err.retain(|&b| b != 0);
            return Err(DeviceError::Unavailable(format!(
                "error creating DRS instance: [{}]",
                String::from_utf8_lossy(&err)
            )));
        }

        let count = unsafe { drs_num_boards(handle) }.max(0) as usize;
        let boards = (0..count)
            .map(|i| HwBoard {
                ptr: unsafe { drs_get_board(handle, i as c_int) },
            })
            .filter(|b| !b.ptr.is_null())
            .collect();

        Ok(Self { handle, boards })
    }
}

impl DigitizerSdk for HwSdk {
    fn board_count(&self) -> usize {
        self.boards.len()
    }

    fn board_mut(&mut self, index: usize) -> Option<&mut dyn DigitizerBoard> {
        self.boards
            .get_mut(index)
            .map(|b| b as &mut dyn DigitizerBoard)
    }
}

impl Drop for HwSdk {
    fn drop(&mut self) {
        unsafe { drs_free(self.handle) };
    }
}
