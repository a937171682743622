//! A scriptable G5 device model behind [`JtagIo`].
//!
//! The mock tracks the full sixteen-state TAP from the TMS bits it is
//! clocked with, so a wrong TMS sequence lands it in the wrong state and the
//! test fails for the same reason real silicon would misbehave. Device
//! registers answer with configurable canned responses, and an optional
//! SPI-flash model decodes SPIPROG traffic into byte-level transactions.

use std::collections::{HashMap, VecDeque};

use bitvec::prelude::*;

use super::{JtagIo, ProbeError};

/// The complete IEEE-1149.1 TAP state set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimState {
    TestLogicReset,
    RunTestIdle,
    SelectDrScan,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIrScan,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

fn next_state(state: SimState, tms: bool) -> SimState {
    use SimState::*;
    match (state, tms) {
        (TestLogicReset, false) => RunTestIdle,
        (TestLogicReset, true) => TestLogicReset,
        (RunTestIdle, false) => RunTestIdle,
        (RunTestIdle, true) => SelectDrScan,
        (SelectDrScan, false) => CaptureDr,
        (SelectDrScan, true) => SelectIrScan,
        (CaptureDr, false) => ShiftDr,
        (CaptureDr, true) => Exit1Dr,
        (ShiftDr, false) => ShiftDr,
        (ShiftDr, true) => Exit1Dr,
        (Exit1Dr, false) => PauseDr,
        (Exit1Dr, true) => UpdateDr,
        (PauseDr, false) => PauseDr,
        (PauseDr, true) => Exit2Dr,
        (Exit2Dr, false) => ShiftDr,
        (Exit2Dr, true) => UpdateDr,
        (UpdateDr, false) => RunTestIdle,
        (UpdateDr, true) => SelectDrScan,
        (SelectIrScan, false) => CaptureIr,
        (SelectIrScan, true) => TestLogicReset,
        (CaptureIr, false) => ShiftIr,
        (CaptureIr, true) => Exit1Ir,
        (ShiftIr, false) => ShiftIr,
        (ShiftIr, true) => Exit1Ir,
        (Exit1Ir, false) => PauseIr,
        (Exit1Ir, true) => UpdateIr,
        (PauseIr, false) => PauseIr,
        (PauseIr, true) => Exit2Ir,
        (Exit2Ir, false) => ShiftIr,
        (Exit2Ir, true) => UpdateIr,
        (UpdateIr, false) => RunTestIdle,
        (UpdateIr, true) => SelectDrScan,
    }
}

fn pack_lsb(bits: &[bool]) -> Vec<u8> {
    let mut packed: BitVec<u8, Lsb0> = BitVec::with_capacity(bits.len());
    packed.extend(bits.iter().copied());
    packed.set_uninitialized(false);
    packed.into_vec()
}

fn unpack_lsb(bytes: &[u8], bits: usize) -> VecDeque<bool> {
    bytes.view_bits::<Lsb0>()[..bits.min(bytes.len() * 8)]
        .iter()
        .by_vals()
        .collect()
}

/// One recorded DR scan, tagged with the instruction it addressed.
#[derive(Debug, Clone)]
pub struct Scan {
    /// IR value at the time of the scan.
    pub ir: u8,
    /// Number of bits shifted.
    pub bits: usize,
    /// The shifted-in data, LSB-first packed.
    pub data: Vec<u8>,
}

/// A decoded SPI transaction observed on the SPIPROG bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiCommand {
    /// Command byte.
    pub cmd: u8,
    /// Address, for commands that carry one.
    pub addr: Option<u64>,
    /// Payload bytes following command (and address).
    pub data: Vec<u8>,
}

/// A small SPI-NOR flash model wired to the SPIPROG bridge.
pub struct SpiFlashSim {
    /// JEDEC id returned for RDID.
    pub id: [u8; 3],
    /// Address width the model decodes for 02/03/D8.
    pub address_bytes: usize,
    /// Status-register-1 value (bit 0 managed by `busy_reads`).
    pub status: u8,
    /// Status-register-2 value.
    pub status2: u8,
    /// RDSR reports busy this many times before going ready.
    pub busy_reads: u32,
    /// Byte overlay over an otherwise erased (0xFF) array.
    pub memory: HashMap<u64, u8>,
    /// Every completed transaction in order.
    pub commands: Vec<SpiCommand>,

    selected: bool,
    bit_count: u32,
    shift_in: u8,
    bytes: Vec<u8>,
    miso: VecDeque<bool>,
    read_ptr: Option<u64>,
}

impl SpiFlashSim {
    /// A 128 Mb Cypress part with 3-byte addressing.
    pub fn s25f_128mb() -> Self {
        SpiFlashSim::new([0x01, 0x20, 0x18], 3)
    }

    /// Create a model with the given JEDEC id and address width.
    pub fn new(id: [u8; 3], address_bytes: usize) -> Self {
        SpiFlashSim {
            id,
            address_bytes,
            status: 0,
            status2: 0,
            busy_reads: 0,
            memory: HashMap::new(),
            commands: vec![],
            selected: false,
            bit_count: 0,
            shift_in: 0,
            bytes: vec![],
            miso: VecDeque::new(),
            read_ptr: None,
        }
    }

    /// Byte visible at `addr` (erased flash reads 0xFF).
    pub fn read_byte(&self, addr: u64) -> u8 {
        self.memory.get(&addr).copied().unwrap_or(0xff)
    }

    fn miso_bit(&self) -> bool {
        self.miso.front().copied().unwrap_or(false)
    }

    fn prime(&mut self, bytes: &[u8]) {
        // One filler bit absorbs the host's dummy clock between the command
        // phase and the first captured data bit.
        self.miso.clear();
        self.miso.push_back(false);
        for &byte in bytes {
            for bit in (0..8).rev() {
                self.miso.push_back(byte & (1 << bit) != 0);
            }
        }
    }

    fn refill(&mut self) {
        while self.read_ptr.is_some() && self.miso.len() < 64 {
            let ptr = self.read_ptr.unwrap();
            let byte = self.read_byte(ptr);
            for bit in (0..8).rev() {
                self.miso.push_back(byte & (1 << bit) != 0);
            }
            self.read_ptr = Some(ptr + 1);
        }
    }

    fn clock(&mut self, mosi: bool) {
        self.shift_in = (self.shift_in << 1) | mosi as u8;
        self.bit_count += 1;
        self.miso.pop_front();
        if self.bit_count % 8 == 0 {
            let byte = self.shift_in;
            self.shift_in = 0;
            self.byte_received(byte);
        }
        self.refill();
    }

    fn byte_received(&mut self, byte: u8) {
        self.bytes.push(byte);
        let cmd = self.bytes[0];
        if self.bytes.len() == 1 {
            match cmd {
                0x9f => {
                    let id = self.id;
                    self.prime(&id);
                }
                0x05 => {
                    let status = if self.busy_reads > 0 {
                        self.busy_reads -= 1;
                        self.status | 0x01
                    } else {
                        self.status & !0x01
                    };
                    self.prime(&[status]);
                }
                0x07 => {
                    let status2 = self.status2;
                    self.prime(&[status2]);
                }
                0x35 => self.prime(&[0x00]),
                _ => {}
            }
        } else if cmd == 0x03 && self.bytes.len() == 1 + self.address_bytes {
            let addr = self.parse_addr();
            self.read_ptr = addr;
            self.prime(&[]);
        }
    }

    fn parse_addr(&self) -> Option<u64> {
        if self.bytes.len() < 1 + self.address_bytes {
            return None;
        }
        let mut addr = 0u64;
        for &byte in &self.bytes[1..1 + self.address_bytes] {
            addr = (addr << 8) | byte as u64;
        }
        Some(addr)
    }

    fn deselect(&mut self) {
        if !self.selected {
            return;
        }
        self.selected = false;
        if let Some(&cmd) = self.bytes.first() {
            let addr = match cmd {
                0x02 | 0x03 | 0xd8 => self.parse_addr(),
                _ => None,
            };
            let data = match cmd {
                0x02 if self.bytes.len() > 1 + self.address_bytes => {
                    self.bytes[1 + self.address_bytes..].to_vec()
                }
                0x01 | 0x17 => self.bytes[1..].to_vec(),
                _ => vec![],
            };
            if cmd == 0x02 {
                if let Some(base) = addr {
                    for (i, &byte) in data.iter().enumerate() {
                        self.memory.insert(base + i as u64, byte);
                    }
                }
            }
            self.commands.push(SpiCommand { cmd, addr, data });
        }
        self.bytes.clear();
        self.bit_count = 0;
        self.shift_in = 0;
        self.read_ptr = None;
        self.miso.clear();
    }

    fn select(&mut self) {
        if !self.selected {
            self.selected = true;
            self.bytes.clear();
            self.bit_count = 0;
            self.shift_in = 0;
            self.read_ptr = None;
            self.miso.clear();
        }
    }
}

/// A simulated G5 device.
pub struct MockDevice {
    tck: bool,
    tms: bool,
    tdi: bool,
    state: SimState,
    ir_bits: Vec<bool>,
    dr_bits: Vec<bool>,
    out_bits: VecDeque<bool>,
    ir: u8,

    /// IDCODE served on the 0x0F instruction.
    pub idcode: u32,
    /// Byte captured into the IR on Capture-IR (bit 7 = core enabled).
    pub ir_capture: u8,
    /// Shared-buffer blocks loaded by QUERY_SECURITY.
    pub security: Vec<[u8; 16]>,
    /// Respond busy to this many poll captures before going ready.
    pub busy_polls: u32,
    /// FRAME_DATA poll responses, consumed front-first (default: ready).
    pub frame_data: VecDeque<[u8; 16]>,
    /// FRAME_STATUS responses, consumed front-first.
    pub frame_status: VecDeque<[u8; 8]>,
    /// CHECK_DIGESTS result register.
    pub digest_check: [u8; 2],
    /// Low byte of the UNLOCK_* result register.
    pub unlock_result: u8,
    /// ISC_ENABLE / ISC_DISABLE result register.
    pub isc_enable_result: [u8; 4],
    /// ZEROIZE result frame.
    pub zeroize_result: [u8; 16],
    /// READ_ZEROIZATION_RESULT frame.
    pub zeroization_read_result: [u8; 16],
    /// Shared-buffer blocks served after READ_ZEROIZATION_RESULT.
    pub zeroize_certificate: Vec<[u8; 16]>,
    /// Device serial number served by READ_FSN.
    pub fsn: [u8; 16],
    /// Optional SPI flash on the SPIPROG bridge.
    pub spi: Option<SpiFlashSim>,

    /// Every DR scan observed, tagged with its IR value.
    pub scans: Vec<Scan>,
    /// Every IR value in the order it was loaded.
    pub ir_trace: Vec<u8>,
    /// Total rising TCK edges.
    pub tck_rises: u64,
    /// Accumulated delay requests in microseconds.
    pub delay_total_us: u64,

    shared_loaded: Vec<[u8; 16]>,
    selected_buffer_block: usize,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A ready, unlocked device with a G5 IDCODE.
    pub fn new() -> Self {
        MockDevice {
            tck: true,
            tms: false,
            tdi: false,
            state: SimState::TestLogicReset,
            ir_bits: vec![],
            dr_bits: vec![],
            out_bits: VecDeque::new(),
            ir: 0x0f,
            idcode: 0x0f81_11cf,
            ir_capture: 0x01,
            security: vec![[0; 16]; 3],
            busy_polls: 0,
            frame_data: VecDeque::new(),
            frame_status: VecDeque::new(),
            digest_check: [0xff, 0x17],
            unlock_result: 0x01,
            isc_enable_result: [0; 4],
            zeroize_result: [0; 16],
            zeroization_read_result: [0; 16],
            zeroize_certificate: vec![[0x5a; 16]; 9],
            fsn: [0x11; 16],
            spi: None,
            scans: vec![],
            ir_trace: vec![],
            tck_rises: 0,
            delay_total_us: 0,
            shared_loaded: vec![[0; 16]; 64],
            selected_buffer_block: 0,
        }
    }

    /// Loaded IR values with consecutive repeats (poll loops) collapsed.
    pub fn instruction_trace(&self) -> Vec<u8> {
        let mut trace = vec![];
        for &ir in &self.ir_trace {
            if trace.last() != Some(&ir) {
                trace.push(ir);
            }
        }
        trace
    }

    fn register_width(&self, ir: u8) -> usize {
        match ir {
            0x0f => 32,             // IDCODE
            0x0b | 0x0c => 32,      // ISC_ENABLE / ISC_DISABLE
            0xcd => 32,             // UDV
            0xb8 | 0xbc => 16,      // QUERY_SECURITY / CHECK_DIGESTS
            0xee | 0xeb | 0xec => 128, // FRAME_DATA / KEYLO / KEYHI
            0xe6 | 0xe2 | 0xe3 | 0xe1 => 128, // ZEROIZE / zeroization / TVS / DIBS
            0xf2 | 0xf0 => 129,     // READ_BUFFER / READ_FSN
            0xd8 => 64,             // FRAME_STATUS
            0xb0 => 6,              // SPIPROG
            _ => 8,
        }
    }

    fn respond(&mut self, ir: u8) -> Vec<u8> {
        let width = self.register_width(ir);
        let mut bytes = match ir {
            0x0f => self.idcode.to_le_bytes().to_vec(),
            0xee => self
                .frame_data
                .pop_front()
                .map(|f| f.to_vec())
                .unwrap_or_else(|| vec![0; 16]),
            0xd8 => self
                .frame_status
                .pop_front()
                .map(|f| f.to_vec())
                .unwrap_or_else(|| vec![0; 8]),
            0xf2 => {
                let mut block = self
                    .shared_loaded
                    .get(self.selected_buffer_block)
                    .copied()
                    .unwrap_or([0; 16])
                    .to_vec();
                block.push(0);
                block
            }
            0xf0 => {
                let mut bytes = self.fsn.to_vec();
                bytes.push(0);
                bytes
            }
            0xbc => self.digest_check.to_vec(),
            0xa8 | 0xa9 | 0xaa => vec![self.unlock_result],
            0x0b | 0x0c => self.isc_enable_result.to_vec(),
            0xe6 => self.zeroize_result.to_vec(),
            0xe2 => self.zeroization_read_result.to_vec(),
            0xb0 => vec![self
                .spi
                .as_ref()
                .map_or(false, |spi| spi.miso_bit()) as u8],
            _ => vec![0; (width + 7) / 8],
        };
        bytes.resize((width + 7) / 8, 0);
        if self.busy_polls > 0 && ir != 0x0f && ir != 0xb0 {
            self.busy_polls -= 1;
            let busy_bit = width - 1;
            bytes[busy_bit / 8] |= 1 << (busy_bit % 8);
        }
        bytes
    }

    fn handle_dr_update(&mut self) {
        let data = pack_lsb(&self.dr_bits);
        let bits = self.dr_bits.len();
        self.scans.push(Scan {
            ir: self.ir,
            bits,
            data: data.clone(),
        });
        match self.ir {
            0xb8 => {
                // QUERY_SECURITY loads the shared buffer with lock state.
                let mut blocks = self.security.clone();
                blocks.resize(64, [0; 16]);
                self.shared_loaded = blocks;
            }
            0xe2 => {
                let mut blocks = self.zeroize_certificate.clone();
                blocks.resize(64, [0; 16]);
                self.shared_loaded = blocks;
            }
            0xa6 | 0xa3 | 0xe7 | 0xa2 | 0xe1 | 0xee => {
                // Commands whose results are fetched through READ_BUFFER get
                // a recognizable fill pattern.
                self.shared_loaded = (0..64).map(|i| [i as u8; 16]).collect();
            }
            0xf2 => {
                self.selected_buffer_block = (data.first().copied().unwrap_or(0) >> 1) as usize;
            }
            0xb0 => {
                let reg = data.first().copied().unwrap_or(0) & 0x3f;
                self.spi_update(reg);
            }
            _ => {}
        }
    }

    fn spi_update(&mut self, reg: u8) {
        let Some(spi) = self.spi.as_mut() else {
            return;
        };
        let enable = reg & 0x01 != 0;
        let mosi = reg & 0x02 != 0;
        let ss_high = reg & 0x04 != 0;
        let clock_pulse = (reg >> 3) & 0x3 == 0b10;
        if !enable || ss_high {
            spi.deselect();
            return;
        }
        spi.select();
        if clock_pulse {
            spi.clock(mosi);
        }
    }

    fn rising_edge(&mut self) {
        self.tck_rises += 1;
        match self.state {
            SimState::ShiftDr => {
                self.dr_bits.push(self.tdi);
                self.out_bits.pop_front();
            }
            SimState::ShiftIr => {
                self.ir_bits.push(self.tdi);
                self.out_bits.pop_front();
            }
            _ => {}
        }
        let next = next_state(self.state, self.tms);
        if next != self.state {
            self.state = next;
            match next {
                SimState::TestLogicReset => self.ir = 0x0f,
                SimState::CaptureDr => {
                    self.dr_bits.clear();
                    let response = self.respond(self.ir);
                    self.out_bits = unpack_lsb(&response, response.len() * 8);
                }
                SimState::CaptureIr => {
                    self.ir_bits.clear();
                    self.out_bits = unpack_lsb(&[self.ir_capture], 8);
                }
                SimState::UpdateDr => self.handle_dr_update(),
                SimState::UpdateIr => {
                    self.ir = pack_lsb(&self.ir_bits).first().copied().unwrap_or(0);
                    self.ir_trace.push(self.ir);
                }
                _ => {}
            }
        }
    }
}

impl JtagIo for MockDevice {
    fn set_tck(&mut self, level: bool) -> Result<(), ProbeError> {
        if level && !self.tck {
            self.tck = true;
            self.rising_edge();
        } else {
            self.tck = level;
        }
        Ok(())
    }

    fn set_tms(&mut self, level: bool) -> Result<(), ProbeError> {
        self.tms = level;
        Ok(())
    }

    fn set_tdi(&mut self, level: bool) -> Result<(), ProbeError> {
        self.tdi = level;
        Ok(())
    }

    fn set_trst(&mut self, level: bool) -> Result<(), ProbeError> {
        if !level {
            self.state = SimState::TestLogicReset;
        }
        Ok(())
    }

    fn read_tdo(&mut self) -> Result<bool, ProbeError> {
        Ok(self.out_bits.front().copied().unwrap_or(false))
    }

    fn delay_us(&mut self, micros: u32) {
        self.delay_total_us += micros as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jtag::JtagDriver;
    use crate::jtag::TapState;

    #[test]
    fn idcode_scan_against_the_model() {
        let mut jtag = JtagDriver::new(MockDevice::new());
        jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
        jtag.ir_scan(0x0f).unwrap();
        jtag.goto_state(TapState::RunTestIdle, 0).unwrap();
        let mut out = [0u8; 4];
        jtag.dr_scan_out(32, None, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 0x0f81_11cf);
    }

    #[test]
    fn spi_model_decodes_bytes_msb_first() {
        let mut spi = SpiFlashSim::s25f_128mb();
        spi.select();
        for bit in [false, true, false, true, false, true, false, true] {
            spi.clock(bit);
        }
        spi.deselect();
        assert_eq!(spi.commands, vec![SpiCommand { cmd: 0x55, addr: None, data: vec![] }]);
    }
}
