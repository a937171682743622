//! JTAG TAP state machine and bit shifter.
//!
//! [`JtagDriver`] walks the TAP state machine through a fixed transition
//! table and clocks IR/DR payloads LSB-first. Every IR or DR scan is atomic
//! in the TAP sense: on completion the TAP sits in Pause-IR or Pause-DR.
//! Optional chain padding shifts configured pre/post bit strings around every
//! payload; the zero-length case costs nothing.

use crate::image::{Block, DatImage};
use crate::probe::{JtagIo, ProbeError};

/// The TAP states tracked by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    /// Test-Logic-Reset.
    TestLogicReset,
    /// Run-Test/Idle.
    RunTestIdle,
    /// Shift-DR.
    ShiftDr,
    /// Shift-IR.
    ShiftIr,
    /// Exit1-DR.
    Exit1Dr,
    /// Exit1-IR.
    Exit1Ir,
    /// Pause-DR.
    PauseDr,
    /// Pause-IR.
    PauseIr,
    /// Update-DR.
    UpdateDr,
    /// Update-IR.
    UpdateIr,
    /// Capture-DR.
    CaptureDr,
}

/// Errors produced by the JTAG layer.
#[derive(Debug, thiserror::Error)]
pub enum JtagError {
    /// A probe line operation failed.
    #[error("probe error")]
    Probe(#[from] ProbeError),

    /// The transition table has no entry for the requested state change.
    #[error("unhandled TAP transition {from:?} -> {to:?}")]
    StateNotHandled {
        /// State the driver was in (`None` before the first reset).
        from: Option<TapState>,
        /// Requested target state.
        to: TapState,
    },
}

/// A pre/post padding bit string for scan chains with other devices on them.
#[derive(Debug, Clone, Default)]
pub struct Padding {
    data: Vec<u8>,
    bits: u32,
}

impl Padding {
    /// A padding of `bits` bits taken LSB-first from `data`.
    pub fn new(data: Vec<u8>, bits: u32) -> Self {
        assert!(data.len() * 8 >= bits as usize);
        Padding { data, bits }
    }

    fn get(&self) -> Option<(Vec<u8>, u32)> {
        (self.bits > 0).then(|| (self.data.clone(), self.bits))
    }
}

/// Scan-chain padding configuration, applied around every IR/DR payload.
#[derive(Debug, Clone, Default)]
pub struct ChainConfig {
    /// Bits shifted before every IR payload.
    pub pre_ir: Padding,
    /// Bits shifted after every IR payload.
    pub post_ir: Padding,
    /// Bits shifted before every DR payload.
    pub pre_dr: Padding,
    /// Bits shifted after every DR payload.
    pub post_dr: Padding,
}

/// TAP driver over a raw [`JtagIo`] probe.
pub struct JtagDriver<P: JtagIo> {
    probe: P,
    state: Option<TapState>,
    chain: ChainConfig,
}

/// Width of the instruction register.
pub const IR_BIT_LENGTH: u32 = 8;

impl<P: JtagIo> JtagDriver<P> {
    /// Create a driver for a single-device chain.
    pub fn new(probe: P) -> Self {
        Self::with_chain(probe, ChainConfig::default())
    }

    /// Create a driver with scan-chain padding.
    pub fn with_chain(probe: P, chain: ChainConfig) -> Self {
        JtagDriver {
            probe,
            state: None,
            chain,
        }
    }

    /// The state the driver believes the TAP is in.
    pub fn state(&self) -> Option<TapState> {
        self.state
    }

    /// Best-effort wall-clock delay.
    pub fn delay_us(&mut self, micros: u32) {
        self.probe.delay_us(micros);
    }

    /// Consume the driver, returning the probe.
    pub fn into_probe(self) -> P {
        self.probe
    }

    fn clock_tms(&mut self, tms: bool) -> Result<(), ProbeError> {
        self.probe.set_tms(tms)?;
        self.probe.set_tck(false)?;
        self.probe.set_tck(true)
    }

    fn clock_tms_tdi(&mut self, tms: bool, tdi: bool) -> Result<(), ProbeError> {
        self.probe.set_tdi(tdi)?;
        self.probe.set_tms(tms)?;
        self.probe.set_tck(false)?;
        self.probe.set_tck(true)
    }

    fn clock_tms_tdi_tdo(&mut self, tms: bool, tdi: bool) -> Result<bool, ProbeError> {
        self.probe.set_tdi(tdi)?;
        self.probe.set_tms(tms)?;
        self.probe.set_tck(false)?;
        let tdo = self.probe.read_tdo()?;
        self.probe.set_tck(true)?;
        Ok(tdo)
    }

    /// Drive TCK and TRST high before clocking a TAP reset.
    fn reset_lines(&mut self) -> Result<(), ProbeError> {
        self.probe.set_tck(true)?;
        self.probe.set_trst(true)
    }

    /// Walk the TAP to `target`, then clock `cycles` extra TCK pulses with
    /// TMS low. The extra cycles are only meaningful in Run-Test/Idle or the
    /// Pause states.
    pub fn goto_state(&mut self, target: TapState, cycles: u32) -> Result<(), JtagError> {
        use TapState::*;

        if self.state != Some(target) {
            let (count, tms_bits) = match (target, self.state) {
                (TestLogicReset, _) => {
                    self.reset_lines()?;
                    (5, 0x1f)
                }
                (ShiftDr, Some(TestLogicReset | RunTestIdle)) => (4, 0x02),
                (ShiftDr, Some(PauseIr | PauseDr)) => (5, 0x07),
                (ShiftIr, Some(TestLogicReset | RunTestIdle)) => (5, 0x06),
                (ShiftIr, Some(PauseDr | PauseIr)) => (6, 0x0f),
                (ShiftIr, Some(UpdateDr)) => (4, 0x03),
                (RunTestIdle, Some(TestLogicReset)) => (1, 0x00),
                (RunTestIdle, Some(Exit1Ir | Exit1Dr)) => (2, 0x01),
                (RunTestIdle, Some(PauseDr | PauseIr | CaptureDr)) => (3, 0x03),
                (PauseIr, Some(Exit1Ir)) => (1, 0x00),
                (PauseDr, Some(Exit1Dr)) => (1, 0x00),
                (PauseDr, Some(RunTestIdle)) => (4, 0x05),
                (UpdateDr, Some(Exit1Dr | Exit1Ir)) => (1, 0x01),
                (UpdateDr, Some(PauseDr)) => (2, 0x03),
                (CaptureDr, Some(PauseIr)) => (5, 0x0e),
                (to, from) => return Err(JtagError::StateNotHandled { from, to }),
            };
            let mut tms_bits: u32 = tms_bits;
            for _ in 0..count {
                self.clock_tms(tms_bits & 1 != 0)?;
                tms_bits >>= 1;
            }
            self.state = Some(target);
        }
        for _ in 0..cycles {
            self.clock_tms(false)?;
        }
        Ok(())
    }

    /// Clock `cycles` TCK pulses with TMS low without a state change.
    pub fn wait_cycles(&mut self, cycles: u32) -> Result<(), JtagError> {
        for _ in 0..cycles {
            self.clock_tms(false)?;
        }
        Ok(())
    }

    /// Clock `num_bits` bits into the device, LSB-first, starting at
    /// `start_bit` within `data`. Missing data clocks zeros. With
    /// `terminate` the last bit is shifted under TMS=1, moving
    /// Shift-IR/DR to Exit1-IR/DR.
    fn shift_in(
        &mut self,
        start_bit: u64,
        num_bits: u32,
        data: Option<&[u8]>,
        terminate: bool,
    ) -> Result<(), JtagError> {
        if num_bits == 0 {
            return Ok(());
        }
        let byte_at = |idx: usize| data.map_or(0, |d| d.get(idx).copied().unwrap_or(0));

        let mut idx = (start_bit >> 3) as usize;
        let offset = (start_bit & 7) as u32;
        let mut bit_mask: u32 = 1 << offset;
        let mut data_buf = byte_at(idx) >> offset;
        let mut remaining = num_bits;
        loop {
            let last = remaining == 1;
            if last && terminate {
                self.clock_tms_tdi(true, data_buf & 1 != 0)?;
                self.leave_shift_state();
            } else {
                self.clock_tms_tdi(false, data_buf & 1 != 0)?;
            }
            remaining -= 1;
            if remaining == 0 {
                break;
            }
            data_buf >>= 1;
            bit_mask <<= 1;
            if bit_mask & 0xff == 0 {
                bit_mask = 1;
                idx += 1;
                data_buf = byte_at(idx);
            }
        }
        Ok(())
    }

    /// As [`Self::shift_in`] starting at bit 0, capturing TDO into `out`
    /// LSB-first. The captured bytes are zeroed first.
    fn shift_in_out(
        &mut self,
        num_bits: u32,
        data: Option<&[u8]>,
        out: &mut [u8],
        terminate: bool,
    ) -> Result<(), JtagError> {
        if num_bits == 0 {
            return Ok(());
        }
        let byte_len = ((num_bits + 7) / 8) as usize;
        for byte in &mut out[..byte_len] {
            *byte = 0;
        }
        let byte_at = |idx: usize| data.map_or(0, |d| d.get(idx).copied().unwrap_or(0));

        let mut idx = 0;
        let mut bit_mask: u32 = 1;
        let mut data_buf = byte_at(0);
        let mut remaining = num_bits;
        loop {
            let last = remaining == 1;
            let tms = last && terminate;
            if self.clock_tms_tdi_tdo(tms, data_buf & 1 != 0)? {
                out[idx] |= bit_mask as u8;
            }
            if tms {
                self.leave_shift_state();
            }
            remaining -= 1;
            if remaining == 0 {
                break;
            }
            data_buf >>= 1;
            bit_mask <<= 1;
            if bit_mask & 0xff == 0 {
                bit_mask = 1;
                idx += 1;
                data_buf = byte_at(idx);
            }
        }
        Ok(())
    }

    fn leave_shift_state(&mut self) {
        self.state = match self.state {
            Some(TapState::ShiftIr) => Some(TapState::Exit1Ir),
            Some(TapState::ShiftDr) => Some(TapState::Exit1Dr),
            other => other,
        };
    }

    /// The pads that apply to the current shift state.
    fn pads(&self) -> (Option<(Vec<u8>, u32)>, Option<(Vec<u8>, u32)>) {
        match self.state {
            Some(TapState::ShiftIr) => (self.chain.pre_ir.get(), self.chain.post_ir.get()),
            Some(TapState::ShiftDr) => (self.chain.pre_dr.get(), self.chain.post_dr.get()),
            _ => (None, None),
        }
    }

    /// Shift a payload with any configured padding; exit the shift state
    /// only after the post-pad.
    fn scan_in(
        &mut self,
        start_bit: u64,
        num_bits: u32,
        data: Option<&[u8]>,
    ) -> Result<(), JtagError> {
        let (pre, post) = self.pads();
        if let Some((pad, bits)) = pre {
            self.shift_in(0, bits, Some(&pad), false)?;
        }
        match post {
            Some((pad, bits)) => {
                self.shift_in(start_bit, num_bits, data, false)?;
                self.shift_in(0, bits, Some(&pad), true)
            }
            None => self.shift_in(start_bit, num_bits, data, true),
        }
    }

    /// Shift a payload and capture TDO, with any configured padding.
    fn scan_in_out(
        &mut self,
        num_bits: u32,
        data: Option<&[u8]>,
        out: &mut [u8],
    ) -> Result<(), JtagError> {
        let (pre, post) = self.pads();
        if let Some((pad, bits)) = pre {
            self.shift_in(0, bits, Some(&pad), false)?;
        }
        match post {
            Some((pad, bits)) => {
                self.shift_in_out(num_bits, data, out, false)?;
                self.shift_in(0, bits, Some(&pad), true)
            }
            None => self.shift_in_out(num_bits, data, out, true),
        }
    }

    /// Load `opcode` into the instruction register; ends in Pause-IR.
    pub fn ir_scan(&mut self, opcode: u8) -> Result<(), JtagError> {
        self.goto_state(TapState::ShiftIr, 0)?;
        self.scan_in(0, IR_BIT_LENGTH, Some(&[opcode]))?;
        self.goto_state(TapState::PauseIr, 0)
    }

    /// Load `opcode` into the instruction register and capture the eight
    /// bits shifted out; ends in Pause-IR.
    pub fn ir_scan_out(&mut self, opcode: u8) -> Result<u8, JtagError> {
        let mut out = [0u8; 1];
        self.goto_state(TapState::ShiftIr, 0)?;
        self.scan_in_out(IR_BIT_LENGTH, Some(&[opcode]), &mut out)?;
        self.goto_state(TapState::PauseIr, 0)?;
        Ok(out[0])
    }

    /// Shift `num_bits` of `data` into the data register, LSB-first from
    /// `start_bit`; ends in Pause-DR. Missing data shifts zeros.
    pub fn dr_scan_in(
        &mut self,
        start_bit: u64,
        num_bits: u32,
        data: Option<&[u8]>,
    ) -> Result<(), JtagError> {
        self.goto_state(TapState::ShiftDr, 0)?;
        self.scan_in(start_bit, num_bits, data)?;
        self.goto_state(TapState::PauseDr, 0)
    }

    /// Shift `num_bits` into the data register while capturing TDO into
    /// `out`; ends in Pause-DR.
    pub fn dr_scan_out(
        &mut self,
        num_bits: u32,
        data: Option<&[u8]>,
        out: &mut [u8],
    ) -> Result<(), JtagError> {
        self.goto_state(TapState::ShiftDr, 0)?;
        self.scan_in_out(num_bits, data, out)?;
        self.goto_state(TapState::PauseDr, 0)
    }

    /// Shift `total_bits` of image data from `block` into the data register,
    /// paging through the image cache; ends in Pause-DR. TMS is asserted only
    /// on the final bit of the final page slice.
    pub fn dr_scan_in_paged(
        &mut self,
        image: &mut DatImage,
        block: Block,
        total_bits: u32,
        start_bit_index: u64,
    ) -> Result<(), crate::Error> {
        self.goto_state(TapState::ShiftDr, 0)?;

        let (pre, post) = self.pads();
        if let Some((pad, bits)) = pre {
            self.shift_in(0, bits, Some(&pad), false)?;
        }

        let mut start_bit = start_bit_index;
        let mut remaining_bits = total_bits;
        let mut page_start_bit = (start_bit & 7) as u32;
        let mut requested = (page_start_bit as u64 + total_bits as u64 + 7) >> 3;
        while requested > 0 {
            let (slice, available) = image.get_data(block, start_bit)?;
            if available == 0 {
                return Err(crate::image::ImageError::BlockNotFound { block: block.id() }.into());
            }
            let (bits, terminate) = if available as u64 >= requested {
                (remaining_bits, post.is_none())
            } else {
                (available as u32 * 8 - page_start_bit, false)
            };
            let consumed = requested.min(available as u64);
            self.shift_in(page_start_bit as u64, bits, Some(slice), terminate)?;

            requested -= consumed;
            remaining_bits -= bits;
            start_bit += bits as u64;
            page_start_bit = (start_bit & 7) as u32;
        }

        if let Some((pad, bits)) = post {
            self.shift_in(0, bits, Some(&pad), true)?;
        }
        self.goto_state(TapState::PauseDr, 0)?;
        Ok(())
    }

    /// Shift `num_bits` of image data while capturing TDO into `out`. The
    /// span must fit in one page window; ends in Pause-DR.
    pub fn dr_scan_out_paged(
        &mut self,
        image: &mut DatImage,
        block: Block,
        num_bits: u32,
        start_bit_index: u64,
        out: &mut [u8],
    ) -> Result<(), crate::Error> {
        self.goto_state(TapState::ShiftDr, 0)?;
        let requested = ((num_bits as u64) + 7) >> 3;
        let (slice, available) = image.get_data(block, start_bit_index)?;
        if (available as u64) < requested {
            return Err(crate::image::ImageError::PageTooSmall {
                requested: requested as usize,
                available,
            }
            .into());
        }
        // get_data returns the byte containing the start bit; shifting
        // starts at its in-byte offset.
        let offset = (start_bit_index & 7) as u32;
        debug_assert_eq!(offset, 0, "capture scans start on byte boundaries");
        let slice = slice.to_vec();
        self.scan_in_out(num_bits, Some(&slice), out)?;
        self.goto_state(TapState::PauseDr, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every clocked bit; TDO loops back the TDI level.
    struct LoopbackProbe {
        tms: Vec<bool>,
        tdi: Vec<bool>,
        tck: bool,
        cur_tms: bool,
        cur_tdi: bool,
    }

    impl LoopbackProbe {
        fn new() -> Self {
            LoopbackProbe {
                tms: vec![],
                tdi: vec![],
                tck: true,
                cur_tms: false,
                cur_tdi: false,
            }
        }
    }

    impl JtagIo for LoopbackProbe {
        fn set_tck(&mut self, level: bool) -> Result<(), ProbeError> {
            if level && !self.tck {
                self.tms.push(self.cur_tms);
                self.tdi.push(self.cur_tdi);
            }
            self.tck = level;
            Ok(())
        }
        fn set_tms(&mut self, level: bool) -> Result<(), ProbeError> {
            self.cur_tms = level;
            Ok(())
        }
        fn set_tdi(&mut self, level: bool) -> Result<(), ProbeError> {
            self.cur_tdi = level;
            Ok(())
        }
        fn set_trst(&mut self, _level: bool) -> Result<(), ProbeError> {
            Ok(())
        }
        fn read_tdo(&mut self) -> Result<bool, ProbeError> {
            Ok(self.cur_tdi)
        }
        fn delay_us(&mut self, _micros: u32) {}
    }

    fn driver() -> JtagDriver<LoopbackProbe> {
        JtagDriver::new(LoopbackProbe::new())
    }

    #[test]
    fn reset_clocks_five_tms_high() {
        let mut jtag = driver();
        jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
        assert_eq!(jtag.probe.tms, vec![true; 5]);
        assert_eq!(jtag.state(), Some(TapState::TestLogicReset));
    }

    #[test]
    fn goto_appends_exact_idle_cycles() {
        let mut jtag = driver();
        jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
        jtag.goto_state(TapState::RunTestIdle, 3).unwrap();
        // one TMS=0 for the transition plus three idle cycles
        assert_eq!(jtag.probe.tms[5..], [false, false, false, false]);
    }

    #[test]
    fn transition_table_is_deterministic() {
        // (from, to, expected TMS bits LSB-first)
        let cases: &[(TapState, TapState, &[bool])] = &[
            (
                TapState::RunTestIdle,
                TapState::ShiftDr,
                &[false, true, false, false],
            ),
            (
                TapState::RunTestIdle,
                TapState::ShiftIr,
                &[false, true, true, false, false],
            ),
            (
                TapState::PauseDr,
                TapState::ShiftDr,
                &[true, true, true, false, false],
            ),
            (
                TapState::PauseIr,
                TapState::ShiftIr,
                &[true, true, true, true, false, false],
            ),
            (TapState::Exit1Dr, TapState::RunTestIdle, &[true, false]),
            (
                TapState::PauseIr,
                TapState::CaptureDr,
                &[false, true, true, true, false],
            ),
            (
                TapState::RunTestIdle,
                TapState::PauseDr,
                &[true, false, true, false],
            ),
        ];
        for (from, to, expected) in cases {
            let mut jtag = driver();
            jtag.state = Some(*from);
            jtag.goto_state(*to, 0).unwrap();
            assert_eq!(jtag.probe.tms, *expected, "{from:?} -> {to:?}");
            assert_eq!(jtag.state(), Some(*to));
        }
    }

    #[test]
    fn unknown_transition_is_rejected() {
        let mut jtag = driver();
        jtag.state = Some(TapState::UpdateIr);
        let err = jtag.goto_state(TapState::ShiftDr, 0).unwrap_err();
        assert!(matches!(err, JtagError::StateNotHandled { .. }));
    }

    #[test]
    fn ir_scan_shifts_opcode_lsb_first_and_parks_in_pause_ir() {
        let mut jtag = driver();
        jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
        jtag.ir_scan(0xb8).unwrap();

        let n = jtag.probe.tdi.len();
        let payload = &jtag.probe.tdi[n - 9..n - 1];
        let expected: Vec<bool> = (0..8).map(|i| 0xb8 & (1 << i) != 0).collect();
        assert_eq!(payload, expected);
        // TMS high only on the last payload bit (entering Exit1-IR), low
        // again for the Exit1-IR -> Pause-IR step
        let tms = &jtag.probe.tms[n - 9..];
        assert_eq!(tms[..7], [false; 7][..]);
        assert!(tms[7]);
        assert!(!tms[8]);
        assert_eq!(jtag.state(), Some(TapState::PauseIr));
    }

    #[test]
    fn dr_scan_round_trips_through_loopback() {
        let mut jtag = driver();
        jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
        let data = [0xde, 0xad, 0xbe, 0xef];
        let mut out = [0u8; 4];
        jtag.dr_scan_out(32, Some(&data), &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(jtag.state(), Some(TapState::PauseDr));
    }

    #[test]
    fn dr_scan_with_odd_bit_count_zeroes_the_tail() {
        let mut jtag = driver();
        jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
        let mut out = [0xff; 2];
        jtag.dr_scan_out(13, Some(&[0xff, 0xff]), &mut out).unwrap();
        assert_eq!(out, [0xff, 0x1f]);
    }

    #[test]
    fn shift_from_unaligned_start_bit() {
        let mut jtag = driver();
        jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
        // bits 3..11 of 0x0F_F8 are 0b1111_1111
        jtag.dr_scan_in(3, 8, Some(&[0xf8, 0x0f])).unwrap();
        let n = jtag.probe.tdi.len();
        // eight payload bits, then the Exit1->Pause cycle
        assert_eq!(jtag.probe.tdi[n - 9..n - 1], [true; 8][..]);
    }

    #[test]
    fn chain_padding_wraps_payload_and_parks_after_post_pad() {
        let chain = ChainConfig {
            pre_dr: Padding::new(vec![0x00], 2),
            post_dr: Padding::new(vec![0x03], 2),
            ..Default::default()
        };
        let mut jtag = JtagDriver::with_chain(LoopbackProbe::new(), chain);
        jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
        jtag.dr_scan_in(0, 4, Some(&[0x0f])).unwrap();

        let n = jtag.probe.tdi.len();
        // 2 pre + 4 payload + 2 post, then Exit1->Pause
        let bits = &jtag.probe.tdi[n - 9..n - 1];
        assert_eq!(
            bits,
            [false, false, true, true, true, true, true, true]
        );
        // TMS asserted only on the last post-pad bit
        let tms = &jtag.probe.tms[n - 9..n - 1];
        assert_eq!(tms[..7], [false; 7][..]);
        assert!(tms[7]);
        assert_eq!(jtag.state(), Some(TapState::PauseDr));
    }
}
