//! The G5 device-action engine.
//!
//! Drives the programming protocol over a [`JtagDriver`]: mode selection,
//! ISC enable/disable, security unlocks, the frame-data loop, digest and
//! certificate flows, and zeroization. All protocol buffers are owned by the
//! engine and live for one top-level action.

mod frame;
mod info;
mod security;

pub use info::{
    DesignInfo, DeviceCertificate, DeviceDigests, DeviceInfo, DigestCheckReport, SecuritySettings,
    ZeroizationCertificate,
};
pub use security::Passkey;

use crate::error::Error;
use crate::idcode::MICROSEMI_JEDEC;
use crate::image::{Block, DatImage};
use crate::jtag::{JtagDriver, TapState};
use crate::probe::JtagIo;
use crate::progress::{Operation, Progress};
use crate::Action;

// Instruction set.
pub(crate) const ISC_ENABLE: u8 = 0x0b;
pub(crate) const ISC_DISABLE: u8 = 0x0c;
pub(crate) const ISC_NOOP: u8 = 0x0d;
pub(crate) const ISC_SAMPLE: u8 = 0x01;
pub(crate) const EXTEST2: u8 = 0x09;
pub(crate) const IDCODE: u8 = 0x0f;
pub(crate) const FRAME_INIT: u8 = 0xae;
pub(crate) const MODE: u8 = 0xaf;
pub(crate) const FRAME_DATA: u8 = 0xee;
pub(crate) const FRAME_STATUS: u8 = 0xd8;
pub(crate) const READ_DESIGN_INFO: u8 = 0xa6;
pub(crate) const READ_DIGEST: u8 = 0xa3;
pub(crate) const READ_DEBUG_INFO: u8 = 0xe7;
pub(crate) const TVS_MONITOR: u8 = 0xe3;
pub(crate) const READ_BUFFER: u8 = 0xf2;
pub(crate) const READ_FSN: u8 = 0xf0;
pub(crate) const QUERY_SECURITY: u8 = 0xb8;
pub(crate) const KEYLO: u8 = 0xeb;
pub(crate) const KEYHI: u8 = 0xec;
pub(crate) const UNLOCK_DEBUG_PASSCODE: u8 = 0xa9;
pub(crate) const UNLOCK_USER_PASSCODE: u8 = 0xa8;
pub(crate) const UNLOCK_VENDOR_PASSCODE: u8 = 0xaa;
pub(crate) const READ_DEVICE_CERT: u8 = 0xa2;
pub(crate) const CHECK_DIGESTS: u8 = 0xbc;
pub(crate) const UDV: u8 = 0xcd;
pub(crate) const READ_DEVICE_INTEGRITY: u8 = 0xe1;
pub(crate) const ZEROIZE: u8 = 0xe6;
pub(crate) const READ_ZEROIZATION_RESULT: u8 = 0xe2;

// Versions encoded into the ISC_ENABLE payload.
const ALGO_VERSION: u32 = 1;
const DIRECTC_VERSION: u32 = 0;
const PROGRAMMING_METHOD: u32 = 2;
const JTAG_PROGRAMMING_PROTOCOL: u32 = 3;

// Timing and iteration bounds.
pub(crate) const MAX_CONTROLLER_POLL: u32 = 1_000_000;
pub(crate) const MAX_EXIT_POLL: u32 = 10_000;
pub(crate) const STANDARD_CYCLES: u32 = 3;
pub(crate) const STANDARD_DELAY_US: u32 = 10;
pub(crate) const EXIT_POLL_DELAY_US: u32 = 1000;
pub(crate) const EXTEST2_DELAY_US: u32 = 1000;
pub(crate) const IO_CALIBRATION_DELAY_US: u32 = 1_000_000;

/// Frame width of the programming data stream.
pub(crate) const FRAME_BIT_LENGTH: u32 = 128;
/// Width of the READ_BUFFER select/response register.
pub(crate) const FRAME_STATUS_BIT_LENGTH: u32 = 129;

// Maximum boundary-scan register size the engine maintains state for.
pub(crate) const MAX_BSR_BIT_SIZE: u32 = 16384;
pub(crate) const MAX_BSR_BYTE_SIZE: usize = 2048;

// Security-lock bits in the query response.
pub(crate) const UL_USER_KEY1: u8 = 0x02;
pub(crate) const UL_USER_KEY2: u8 = 0x04;
pub(crate) const UL_EXTERNAL_DIGEST_CHECK: u8 = 0x04;

/// Family codes as stored in the image header.
pub const G5_FAMILY_ID: u8 = 0x07;
/// G5 SoC family code.
pub const G5SOC_FAMILY_ID: u8 = 0x08;

// Device exception codes distinguishing ES from production silicon.
const ES_DEVICE_CODES: [u8; 3] = [10, 11, 12];
const PRODUCTION_DEVICE_CODES: [u8; 4] = [13, 14, 15, 16];

/// Identity of the attached device, checked against the image header.
#[derive(Debug, Clone, Copy)]
pub struct DeviceIdentity {
    /// Raw 32-bit IDCODE as captured.
    pub idcode: u32,
    /// Silicon revision (IDCODE bits 31:28).
    pub revision: u8,
    /// Family code from the image header.
    pub family: u8,
    /// Device exception code from the image header.
    pub exception: u8,
}

/// Compare the captured IDCODE against the image's expectation.
///
/// Both sides are masked with the header mask. ES programming files are
/// rejected on production silicon and vice versa, keyed off the device
/// exception code and the silicon revision.
pub fn check_device_id(image: &mut DatImage, raw_idcode: u32) -> Result<DeviceIdentity, Error> {
    let mask = image.device_id_mask()?;
    let expected = image.expected_device_id()? & mask;
    let actual = raw_idcode & mask;
    let exception = image.device_exception()?;
    let revision = (raw_idcode >> 28) as u8;

    if expected & 0xfff != MICROSEMI_JEDEC {
        return Err(Error::Idcode {
            reason: "programming file does not target a Microsemi device",
            unique_exit_code: None,
        });
    }
    if actual != expected {
        tracing::error!(
            actual = format_args!("{actual:#010x}"),
            expected = format_args!("{expected:#010x}"),
            "IDCODE mismatch"
        );
        return Err(Error::Idcode {
            reason: "device does not match the programming file",
            unique_exit_code: Some(32772),
        });
    }
    if ES_DEVICE_CODES.contains(&exception) && revision > 4 {
        return Err(Error::Idcode {
            reason: "ES programming file is not compatible with production silicon",
            unique_exit_code: Some(32857),
        });
    }
    if PRODUCTION_DEVICE_CODES.contains(&exception) && revision < 5 {
        return Err(Error::Idcode {
            reason: "production programming file is not compatible with ES silicon",
            unique_exit_code: Some(32858),
        });
    }
    let family = image.device_family()?;
    tracing::info!(
        idcode = format_args!("{raw_idcode:#010x}"),
        revision,
        family,
        "device identity verified"
    );
    Ok(DeviceIdentity {
        idcode: raw_idcode,
        revision,
        family,
        exception,
    })
}

/// What a completed G5 action hands back to the caller.
#[derive(Debug)]
pub enum G5Report {
    /// Nothing beyond success.
    None,
    /// The captured IDCODE.
    Idcode(crate::IdCode),
    /// Aggregated device information.
    DeviceInfo(Box<DeviceInfo>),
    /// The device certificate.
    DeviceCertificate(DeviceCertificate),
    /// Per-segment digest check results.
    DigestCheck(DigestCheckReport),
    /// The zeroization certificate.
    Zeroization(ZeroizationCertificate),
}

/// The G5 protocol engine. Owns every protocol buffer for one action.
pub struct G5Engine<'a, P: JtagIo> {
    pub(crate) jtag: &'a mut JtagDriver<P>,
    pub(crate) image: &'a mut DatImage,
    pub(crate) progress: &'a Progress,
    pub(crate) action: Action,
    pub(crate) device: DeviceIdentity,
    pub(crate) pgmmode: u8,
    pub(crate) pgmmode_flag: bool,
    pub(crate) poll_buf: [u8; 17],
    pub(crate) shared_buf: [u8; 1024],
    pub(crate) component_digest: [u8; 32],
    pub(crate) core_enabled: Option<bool>,
    bsr: [u8; MAX_BSR_BYTE_SIZE],
    bsr_sample: [u8; MAX_BSR_BYTE_SIZE],
    pub(crate) poll_limit: u32,
    pub(crate) exit_poll_limit: u32,
}

impl<'a, P: JtagIo> G5Engine<'a, P> {
    /// Create an engine for one action against an identified device.
    pub fn new(
        jtag: &'a mut JtagDriver<P>,
        image: &'a mut DatImage,
        progress: &'a Progress,
        action: Action,
        device: DeviceIdentity,
    ) -> Self {
        G5Engine {
            jtag,
            image,
            progress,
            action,
            device,
            pgmmode: 0,
            pgmmode_flag: false,
            poll_buf: [0; 17],
            shared_buf: [0; 1024],
            component_digest: [0; 32],
            core_enabled: None,
            bsr: [0; MAX_BSR_BYTE_SIZE],
            bsr_sample: [0; MAX_BSR_BYTE_SIZE],
            poll_limit: MAX_CONTROLLER_POLL,
            exit_poll_limit: MAX_EXIT_POLL,
        }
    }

    /// Shrink the poll bounds so timeout paths finish quickly under test.
    #[cfg(any(test, feature = "test"))]
    pub fn set_poll_limits(&mut self, poll: u32, exit: u32) {
        self.poll_limit = poll;
        self.exit_poll_limit = exit;
    }

    /// Run the configured action to completion. The TAP ends in
    /// Test-Logic-Reset on every path.
    pub fn run(&mut self) -> Result<G5Report, Error> {
        self.jtag.goto_state(TapState::TestLogicReset, 0)?;
        self.check_action()?;

        let result = self.poll_device_ready().and_then(|()| self.dispatch());
        let exit_result = self.exit();
        let report = result?;
        exit_result?;
        Ok(report)
    }

    /// Gate the requested action against the device action set.
    fn check_action(&self) -> Result<(), Error> {
        use Action::*;
        match self.action {
            ReadIdcode | DeviceInfo | ReadDeviceCertificate if !cfg!(feature = "display") => {
                Err(Error::CodeNotEnabled {
                    action: self.action,
                })
            }
            Erase | Program | Verify | EncDataAuthentication | VerifyDigest | ReadIdcode
            | DeviceInfo | ReadDeviceCertificate | ZeroizeLikeNew | ZeroizeUnrecoverable => Ok(()),
            other => {
                tracing::error!("invalid action {:?}", other);
                Err(Error::ActionNotSupported { action: other })
            }
        }
    }

    fn dispatch(&mut self) -> Result<G5Report, Error> {
        match self.action {
            Action::ZeroizeLikeNew => self.zeroize_action(1).map(G5Report::Zeroization),
            Action::ZeroizeUnrecoverable => self.zeroize_action(3).map(G5Report::Zeroization),
            Action::ReadIdcode => Ok(G5Report::Idcode(crate::IdCode::new(self.device.idcode))),
            Action::DeviceInfo => self
                .device_info_action()
                .map(|info| G5Report::DeviceInfo(Box::new(info))),
            Action::ReadDeviceCertificate => {
                self.read_certificate().map(G5Report::DeviceCertificate)
            }
            _ => {
                self.display_bitstream_digest()?;
                self.image.check_crc(self.progress)?;
                self.device = check_device_id(self.image, self.device.idcode)?;
                match self.action {
                    Action::Erase => self.erase_action().map(|()| G5Report::None),
                    Action::Program => self.program_action().map(|()| G5Report::None),
                    Action::Verify => self.verify_action().map(|()| G5Report::None),
                    Action::EncDataAuthentication => {
                        self.authenticate_action().map(|()| G5Report::None)
                    }
                    Action::VerifyDigest => {
                        self.verify_digest_action().map(G5Report::DigestCheck)
                    }
                    _ => unreachable!("gated by check_action"),
                }
            }
        }
    }

    // Poll primitives.

    /// Repeat an IR load and DR capture until the busy bit clears.
    pub(crate) fn device_poll(
        &mut self,
        opcode: u8,
        bits: u32,
        busy_bit: u32,
    ) -> Result<(), Error> {
        for _ in 0..=self.poll_limit {
            self.jtag.ir_scan(opcode)?;
            self.jtag.dr_scan_out(bits, None, &mut self.poll_buf)?;
            self.jtag.delay_us(STANDARD_DELAY_US);
            if self.poll_buf[busy_bit as usize / 8] & (1 << (busy_bit % 8)) == 0 {
                return Ok(());
            }
        }
        tracing::error!("device polling failed: {:02x?}", &self.poll_buf[..16]);
        Err(Error::PollTimeout {
            unique_exit_code: 0,
        })
    }

    /// Shift the next image frame while capturing the status of the previous
    /// one, repeating until the busy bit clears. The overlap is the
    /// performance contract of the frame loop.
    pub(crate) fn device_shift_and_poll(
        &mut self,
        opcode: u8,
        bits: u32,
        busy_bit: u32,
        block: Block,
        start_bit_index: u64,
    ) -> Result<(), Error> {
        for _ in 0..=self.poll_limit {
            self.jtag.ir_scan(opcode)?;
            self.jtag
                .dr_scan_out_paged(self.image, block, bits, start_bit_index, &mut self.poll_buf)?;
            self.jtag.delay_us(STANDARD_DELAY_US);
            if self.poll_buf[busy_bit as usize / 8] & (1 << (busy_bit % 8)) == 0 {
                return Ok(());
            }
        }
        tracing::error!("device polling failed");
        Err(Error::PollTimeout {
            unique_exit_code: 0,
        })
    }

    /// Wait for the system controller to accept commands.
    pub(crate) fn poll_device_ready(&mut self) -> Result<(), Error> {
        for _ in 0..=self.poll_limit {
            self.jtag.ir_scan(ISC_NOOP)?;
            self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
            self.jtag.delay_us(STANDARD_DELAY_US);
            self.jtag.dr_scan_out(8, None, &mut self.poll_buf)?;
            if self.poll_buf[0] & 0x80 == 0 {
                return Ok(());
            }
        }
        tracing::error!("device is busy");
        Err(Error::PollTimeout {
            unique_exit_code: 32818,
        })
    }

    /// The exit-path variant of the ready poll, with a longer unit delay and
    /// the worst-case I/O calibration wait on success.
    fn poll_device_ready_during_exit(&mut self) -> Result<(), Error> {
        let mut ready = false;
        for _ in 0..=self.exit_poll_limit {
            self.jtag.ir_scan(ISC_NOOP)?;
            self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
            self.jtag.delay_us(EXIT_POLL_DELAY_US);
            self.jtag.dr_scan_out(8, None, &mut self.poll_buf)?;
            if self.poll_buf[0] & 0x80 == 0 {
                ready = true;
                break;
            }
        }
        if !ready {
            tracing::error!("device is busy");
            return Err(Error::PollTimeout {
                unique_exit_code: 32818,
            });
        }
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(IO_CALIBRATION_DELAY_US);
        Ok(())
    }

    /// Read `blocks` 16-byte chunks of the on-device shared buffer.
    pub(crate) fn read_shared_buffer(&mut self, blocks: u8) -> Result<(), Error> {
        for block in 0..blocks {
            let select = [block << 1];
            self.jtag.ir_scan(READ_BUFFER)?;
            self.jtag
                .dr_scan_in(0, FRAME_STATUS_BIT_LENGTH, Some(&select))?;
            self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
            self.jtag.delay_us(STANDARD_DELAY_US);
            self.device_poll(READ_BUFFER, FRAME_STATUS_BIT_LENGTH, 128)?;
            self.shared_buf[block as usize * 16..][..16].copy_from_slice(&self.poll_buf[..16]);
        }
        Ok(())
    }

    /// Select the frame-loop mode (authenticate / program / verify).
    pub(crate) fn set_mode(&mut self) -> Result<(), Error> {
        let mode = [self.pgmmode];
        self.jtag.ir_scan(FRAME_INIT)?;
        self.jtag.dr_scan_in(0, 8, Some(&mode))?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(FRAME_INIT, 8, 7).map_err(|_| {
            tracing::error!("failed to set programming mode");
            Error::PollTimeout {
                unique_exit_code: 32770,
            }
        })
    }

    /// Select the programming mode through the MODE register.
    pub(crate) fn set_pgm_mode(&mut self) -> Result<(), Error> {
        let mode = [self.pgmmode];
        self.jtag.ir_scan(MODE)?;
        self.jtag.dr_scan_in(0, 8, Some(&mode))?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(MODE, 8, 7)
    }

    /// Capture the NOOP IR status to learn whether the fabric is live.
    pub(crate) fn check_core_status(&mut self) -> Result<(), Error> {
        let captured = self.jtag.ir_scan_out(ISC_NOOP)?;
        self.jtag.goto_state(TapState::RunTestIdle, 1)?;
        self.core_enabled = Some(captured & 0x80 != 0);
        Ok(())
    }

    /// Load the boundary-scan register from the image. When the fabric is
    /// live and the image carries a BSR mask, the current I/O state is
    /// sampled first and preserved wherever the mask demands.
    fn load_bsr(&mut self) -> Result<(), Error> {
        self.check_core_status()?;
        let bsr_bits = self.image.bsr_bit_count()?;

        self.jtag.ir_scan(ISC_SAMPLE)?;
        let (_, present) = self.image.get_data(Block::BsrPattern, 0)?;
        if present > 0 {
            tracing::info!("loading boundary scan register ({bsr_bits} bits)");
            self.jtag
                .dr_scan_in_paged(self.image, Block::BsrPattern, bsr_bits, 0)?;
            self.jtag.goto_state(TapState::RunTestIdle, 0)?;
        }

        // Maintaining the live I/O state is only meaningful when the fabric
        // is already programmed and enabled.
        if self.core_enabled != Some(true) {
            return Ok(());
        }
        let bytes = ((bsr_bits + 7) / 8) as usize;
        let mut maintain = false;
        for index in 0..bytes {
            if self.image.get_bytes(Block::BsrMask, index as u64, 1)? != 0 {
                maintain = true;
                break;
            }
        }
        if !maintain {
            return Ok(());
        }
        if bsr_bits > MAX_BSR_BIT_SIZE {
            tracing::warn!(
                "boundary scan register ({bsr_bits} bits) exceeds the working buffer; \
                 skipping maintain-last-known-IO-state"
            );
            return Ok(());
        }

        self.jtag.dr_scan_out(bsr_bits, None, &mut self.bsr_sample)?;
        for index in 0..bytes {
            let pattern = self.image.get_bytes(Block::BsrPattern, index as u64, 1)? as u8;
            let mask = self.image.get_bytes(Block::BsrMask, index as u64, 1)? as u8;
            self.bsr[index] = if mask != 0 {
                (pattern & !mask) | (self.bsr_sample[index] & mask)
            } else {
                pattern
            };
        }
        self.jtag.ir_scan(ISC_SAMPLE)?;
        self.jtag.dr_scan_in(0, bsr_bits, Some(&self.bsr))?;
        self.jtag.goto_state(TapState::RunTestIdle, 0)?;
        Ok(())
    }

    /// Enter programming mode, announcing the algorithm and protocol
    /// versions.
    fn perform_isc_enable(&mut self) -> Result<(), Error> {
        self.pgmmode_flag = true;
        let payload: u32 = (ALGO_VERSION & 0x3f)
            | ((DIRECTC_VERSION & 0x3f) << 17)
            | ((PROGRAMMING_METHOD & 0x7) << 23)
            | ((JTAG_PROGRAMMING_PROTOCOL & 0x7) << 26);
        let payload = payload.to_le_bytes();

        self.jtag.ir_scan(ISC_ENABLE)?;
        self.jtag.dr_scan_in(0, 32, Some(&payload))?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);

        let polled = self.device_poll(ISC_ENABLE, 32, 31);
        if polled.is_err() || self.poll_buf[0] & 0x1 != 0 {
            tracing::error!("failed to enter programming mode");
            return Err(Error::InitFailure);
        }
        tracing::debug!("ISC_ENABLE result: {:02x?}", &self.poll_buf[..4]);
        Ok(())
    }

    /// Query security, unlock required passkeys, load the BSR and enable
    /// programming mode.
    pub(crate) fn initialize(&mut self) -> Result<(), Error> {
        self.query_security()?;
        if self.shared_buf[7] & UL_USER_KEY1 != 0 {
            self.unlock_passkey(Passkey::Upk1)?;
        }
        if self.shared_buf[7] & UL_USER_KEY2 != 0 {
            self.unlock_passkey(Passkey::Upk2)?;
        }
        self.load_bsr()?;
        self.perform_isc_enable()
    }

    fn disable_programming_mode(&mut self) -> Result<(), Error> {
        self.jtag.ir_scan(ISC_DISABLE)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(ISC_DISABLE, 32, 31).map_err(|err| {
            tracing::warn!("failed to disable programming mode");
            err
        })
    }

    /// Leave programming mode and return the device to Test-Logic-Reset.
    /// Runs on every action path, after success and failure alike.
    fn exit(&mut self) -> Result<(), Error> {
        let disable_result = if self.pgmmode_flag {
            self.disable_programming_mode()
        } else {
            Ok(())
        };

        self.jtag.ir_scan(EXTEST2)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(EXTEST2_DELAY_US);
        let ready_result = self.poll_device_ready_during_exit();
        self.jtag.goto_state(TapState::TestLogicReset, 5)?;
        disable_result.and(ready_result)
    }

    // Actions.

    fn erase_action(&mut self) -> Result<(), Error> {
        tracing::info!("performing ERASE action");
        self.initialize()?;
        self.pgmmode = 0x1;
        self.set_mode()?;

        let components = self.image.component_count()?;
        let erase_components = self.image.erase_data_size()?;
        let first = components.saturating_sub(erase_components.saturating_sub(1));
        self.process_data(Block::EraseDataStream, first, components, Operation::Erase)
            .map_err(|err| match err {
                Error::ProcessData {
                    unique_exit_code, ..
                } => Error::Erase { unique_exit_code },
                other => other,
            })
    }

    fn program_action(&mut self) -> Result<(), Error> {
        tracing::info!("performing PROGRAM action");
        self.initialize()?;
        self.check_cycle_count()?;
        self.pgmmode = 0x1;
        self.set_mode()?;

        let last = self.image.data_size()?;
        self.process_data(Block::DataStream, 1, last, Operation::Program)
            .map_err(|err| match err {
                Error::ProcessData {
                    unique_exit_code, ..
                } => Error::CoreProgram { unique_exit_code },
                other => other,
            })
    }

    fn verify_action(&mut self) -> Result<(), Error> {
        tracing::info!("performing VERIFY action");
        self.initialize()?;
        self.pgmmode = 0x2;
        self.set_mode()?;

        let last = self.image.data_size()?;
        self.process_data(Block::DataStream, 1, last, Operation::Verify)
            .map_err(|err| match err {
                Error::ProcessData {
                    unique_exit_code, ..
                } => Error::Verify { unique_exit_code },
                other => other,
            })
    }

    fn authenticate_action(&mut self) -> Result<(), Error> {
        tracing::info!("performing AUTHENTICATION action");
        self.initialize()?;
        self.pgmmode = 0x0;
        self.set_mode()?;

        let last = self.image.data_size()?;
        self.process_data(Block::DataStream, 1, last, Operation::Authenticate)
            .map_err(|err| match err {
                Error::ProcessData {
                    unique_exit_code, ..
                } => Error::Authentication { unique_exit_code },
                other => other,
            })
    }

    fn verify_digest_action(&mut self) -> Result<DigestCheckReport, Error> {
        tracing::info!("performing VERIFY_DIGEST action");
        self.initialize()?;
        self.query_security()?;
        if self.shared_buf[1] & UL_EXTERNAL_DIGEST_CHECK != 0 {
            return Err(Error::VerifyDigest {
                reason: "external digest check via JTAG/SPI slave is disabled",
            });
        }

        let request = [0x01u8];
        self.jtag.ir_scan(CHECK_DIGESTS)?;
        self.jtag.dr_scan_in(0, 16, Some(&request))?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(CHECK_DIGESTS, 16, 15)
            .map_err(|_| Error::VerifyDigest {
                reason: "device did not complete the digest check",
            })?;
        if self.poll_buf[1] == 0x40 {
            return Err(Error::VerifyDigest {
                reason: "digest check reported failure",
            });
        }
        Ok(DigestCheckReport::new([self.poll_buf[0], self.poll_buf[1]]))
    }

    fn zeroize_action(&mut self, mode: u8) -> Result<ZeroizationCertificate, Error> {
        tracing::info!(
            "performing {} action",
            if mode == 3 {
                "ZEROIZE_UNRECOVERABLE"
            } else {
                "ZEROIZE_LIKE_NEW"
            }
        );
        self.query_security()?;
        if self.shared_buf[7] & UL_USER_KEY1 != 0 {
            self.unlock_passkey(Passkey::Upk1)?;
        }
        if self.shared_buf[7] & UL_USER_KEY2 != 0 {
            self.unlock_passkey(Passkey::Upk2)?;
        }
        self.do_zeroize(mode)
    }

    fn do_zeroize(&mut self, mode: u8) -> Result<ZeroizationCertificate, Error> {
        // Fixed challenge; the first byte selects the zeroization mode.
        let mut challenge: [u8; 16] = [
            0x00, 0xb6, 0x16, 0x3b, 0x25, 0xc3, 0x0a, 0xe5, 0x7b, 0x5d, 0x19, 0x00, 0x45, 0x06,
            0x31, 0xa8,
        ];
        challenge[0] = mode;

        self.jtag.ir_scan(ZEROIZE)?;
        self.jtag.dr_scan_in(0, FRAME_BIT_LENGTH, Some(&challenge))?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.device_poll(ZEROIZE, FRAME_BIT_LENGTH, 127)
            .map_err(|_| {
                tracing::error!("failed to load zeroize instruction");
                Error::PollTimeout {
                    unique_exit_code: 32848,
                }
            })?;
        if self.poll_buf[0] & 0x1 != 0 {
            tracing::error!("failed to zeroize the device: {:02x?}", &self.poll_buf[..16]);
            return Err(Error::PollTimeout {
                unique_exit_code: 32849,
            });
        }

        self.jtag.ir_scan(READ_ZEROIZATION_RESULT)?;
        self.jtag.dr_scan_in(0, FRAME_BIT_LENGTH, None)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.device_poll(READ_ZEROIZATION_RESULT, FRAME_BIT_LENGTH, 127)
            .map_err(|_| {
                tracing::error!("failed to load read-zeroization instruction");
                Error::PollTimeout {
                    unique_exit_code: 32853,
                }
            })?;
        if self.poll_buf[0] & 0x3 != 0 {
            tracing::error!(
                "failed to read zeroization certificate: {:02x?}",
                &self.poll_buf[..16]
            );
            return Err(Error::PollTimeout {
                unique_exit_code: 32854,
            });
        }
        self.read_shared_buffer(9)?;
        Ok(ZeroizationCertificate(self.shared_buf[..131].to_vec()))
    }

    /// Log the authoritative bitstream digest carried by BITS components.
    fn display_bitstream_digest(&mut self) -> Result<(), Error> {
        const BSDIGEST_BYTE_OFFSET: u64 = 308;

        let mut data_index: u64 = 0;
        let components = self.image.data_size()?;
        for component in 1..=components {
            let blocks = self.image.block_count(component)?;
            let component_type = self
                .image
                .get_bytes(Block::DataStream, frame::COMPONENT_TYPE_BYTE + data_index / 8, 1)?
                as u8;
            if component_type == frame::COMP_BITS {
                let (slice, available) = self
                    .image
                    .get_data(Block::DataStream, BSDIGEST_BYTE_OFFSET * 8 + data_index)?;
                if available >= 32 {
                    tracing::info!("bitstream digest: {}", info::hex(&slice[..32]));
                }
            }
            data_index += FRAME_BIT_LENGTH as u64 * blocks as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testutil::ImageBuilder;
    use crate::probe::mock::MockDevice;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            idcode: 0x0f81_11cf,
            revision: 0,
            family: G5_FAMILY_ID,
            exception: 0,
        }
    }

    #[test]
    fn set_pgm_mode_writes_the_mode_register() {
        let mut jtag = JtagDriver::new(MockDevice::new());
        let mut image = DatImage::from_bytes(ImageBuilder::default().build());
        let progress = Progress::none();
        {
            let mut engine =
                G5Engine::new(&mut jtag, &mut image, &progress, Action::Program, identity());
            engine.jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
            engine.pgmmode = 0x1;
            engine.set_pgm_mode().unwrap();
        }
        let mock = jtag.into_probe();
        let mode_write = mock
            .scans
            .iter()
            .find(|scan| scan.ir == MODE && scan.bits == 8)
            .expect("MODE register write");
        assert_eq!(mode_write.data, [0x01]);
    }

    #[test]
    fn dpk_unlock_uses_the_debug_passcode_opcode() {
        let mut jtag = JtagDriver::new(MockDevice::new());
        let data = ImageBuilder::default()
            .block(Block::Dpk.id(), vec![0x44; 32])
            .build();
        let mut image = DatImage::from_bytes(data);
        let progress = Progress::none();
        {
            let mut engine =
                G5Engine::new(&mut jtag, &mut image, &progress, Action::Program, identity());
            engine.jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
            engine.unlock_passkey(Passkey::Dpk).unwrap();
        }
        let mock = jtag.into_probe();
        assert_subsequence_contains(&mock.instruction_trace(), &[KEYLO, KEYHI, UNLOCK_DEBUG_PASSCODE]);
    }

    #[test]
    fn missing_passkey_block_is_a_warning_not_an_error() {
        let mut jtag = JtagDriver::new(MockDevice::new());
        let mut image = DatImage::from_bytes(ImageBuilder::default().build());
        let progress = Progress::none();
        let mut engine =
            G5Engine::new(&mut jtag, &mut image, &progress, Action::Program, identity());
        engine.jtag.goto_state(TapState::TestLogicReset, 0).unwrap();
        engine.unlock_passkey(Passkey::Upk1).unwrap();
    }

    fn assert_subsequence_contains(trace: &[u8], expected: &[u8]) {
        let mut iter = trace.iter();
        for &wanted in expected {
            assert!(
                iter.any(|&ir| ir == wanted),
                "missing {wanted:#04x} in {trace:02x?}"
            );
        }
    }
}
