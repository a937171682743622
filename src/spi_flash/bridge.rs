//! Bit-banged SPI over the SPIPROG JTAG instruction.
//!
//! SPIPROG exposes a 6-bit DR: enable, data-out, slave-select, a two-bit
//! clock mode and the sample edge. The hardware emits one SPI clock whenever
//! the TAP traverses Update-DR with the clock mode set to pulse, so every
//! register write is followed by a move to Run-Test/Idle.

use super::SpiFlashEngine;
use crate::error::Error;
use crate::jtag::TapState;
use crate::probe::JtagIo;

/// The SPIPROG instruction.
pub(crate) const SPIPROG: u8 = 0xb0;
const SPIPROG_REGISTER_BIT_LENGTH: u32 = 6;

const ENABLE_INSTRUCTION: u8 = 0x01;
const DATA_OUT: u8 = 0x02;
const SLAVE_SELECT_HIGH: u8 = 0x04;
const CLOCK_INACTIVE_LOW: u8 = 0x00;
const CLOCK_PULSE_AFTER_UPDATE: u8 = 0x10;
const SAMPLE_ON_POSITIVE_EDGE: u8 = 0x00;

impl<P: JtagIo> SpiFlashEngine<'_, P> {
    /// Bring the SPIPROG port up: write the register once disabled, then
    /// enabled, with the slave deselected and the clock idle low.
    pub(super) fn init_spiprog_port(&mut self) -> Result<(), Error> {
        let disabled = [SLAVE_SELECT_HIGH | CLOCK_INACTIVE_LOW | SAMPLE_ON_POSITIVE_EDGE];
        self.jtag.ir_scan(SPIPROG)?;
        self.jtag
            .dr_scan_in(0, SPIPROG_REGISTER_BIT_LENGTH, Some(&disabled))?;

        let enabled = [disabled[0] | ENABLE_INSTRUCTION];
        self.jtag
            .dr_scan_in(0, SPIPROG_REGISTER_BIT_LENGTH, Some(&enabled))
            .map_err(Error::from)
    }

    /// Assert the flash chip select.
    pub(super) fn enable_cs(&mut self) -> Result<(), Error> {
        let reg = [ENABLE_INSTRUCTION | CLOCK_INACTIVE_LOW | SAMPLE_ON_POSITIVE_EDGE];
        self.jtag.ir_scan(SPIPROG)?;
        self.jtag
            .dr_scan_in(0, SPIPROG_REGISTER_BIT_LENGTH, Some(&reg))
            .map_err(Error::from)
    }

    /// Deassert the flash chip select.
    pub(super) fn disable_cs(&mut self) -> Result<(), Error> {
        let reg = [ENABLE_INSTRUCTION | SLAVE_SELECT_HIGH | CLOCK_INACTIVE_LOW];
        self.jtag.ir_scan(SPIPROG)?;
        self.jtag
            .dr_scan_in(0, SPIPROG_REGISTER_BIT_LENGTH, Some(&reg))
            .map_err(Error::from)
    }

    /// Toggle the SPI clock once without driving data.
    pub(super) fn shift_dummy_bit(&mut self) -> Result<(), Error> {
        let reg = [ENABLE_INSTRUCTION | CLOCK_PULSE_AFTER_UPDATE];
        self.jtag
            .dr_scan_in(0, SPIPROG_REGISTER_BIT_LENGTH, Some(&reg))?;
        self.jtag.goto_state(TapState::RunTestIdle, 0)?;
        Ok(())
    }

    /// Shift one byte out to the flash, MSB first.
    pub(super) fn shift_byte_in(&mut self, byte: u8) -> Result<(), Error> {
        for bit in (0..8).rev() {
            let mut reg = ENABLE_INSTRUCTION | CLOCK_PULSE_AFTER_UPDATE;
            if byte & (1 << bit) != 0 {
                reg |= DATA_OUT;
            }
            self.jtag
                .dr_scan_in(0, SPIPROG_REGISTER_BIT_LENGTH, Some(&[reg]))?;
            self.jtag.goto_state(TapState::RunTestIdle, 0)?;
        }
        Ok(())
    }

    /// Capture one byte from the flash, MSB first. Bit 0 of the captured
    /// register carries the incoming data line.
    pub(super) fn shift_byte_out(&mut self) -> Result<u8, Error> {
        let reg = [ENABLE_INSTRUCTION | CLOCK_PULSE_AFTER_UPDATE];
        let mut byte = 0u8;
        let mut captured = [0u8; 1];
        for bit in (0..8).rev() {
            self.jtag
                .dr_scan_out(SPIPROG_REGISTER_BIT_LENGTH, Some(&reg), &mut captured)?;
            self.jtag.goto_state(TapState::RunTestIdle, 0)?;
            if captured[0] & 0x01 != 0 {
                byte |= 1 << bit;
            }
        }
        Ok(byte)
    }

    /// One complete SPI transaction: command, optional write data, optional
    /// read-back after a dummy clock.
    pub(super) fn spi_scan(
        &mut self,
        command: u8,
        data_in: Option<&[u8]>,
        mut data_out: Option<&mut [u8]>,
    ) -> Result<(), Error> {
        self.enable_cs()?;
        self.shift_byte_in(command)?;
        if let Some(data) = data_in {
            for &byte in data {
                self.shift_byte_in(byte)?;
            }
        }
        if let Some(out) = data_out.as_deref_mut() {
            self.shift_dummy_bit()?;
            for byte in out.iter_mut() {
                *byte = self.shift_byte_out()?;
            }
        }
        self.disable_cs()
    }
}
