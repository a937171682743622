//! Top-level single-action entry point.

use crate::error::Error;
use crate::g5::{self, DeviceIdentity, G5Engine, G5Report};
use crate::idcode::IdCode;
use crate::image::DatImage;
use crate::jtag::{JtagDriver, TapState};
use crate::probe::JtagIo;
use crate::progress::Progress;
use crate::spi_flash::{SpiFlashEngine, SpiReport};
use crate::Action;

/// Caller-tunable knobs for a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Byte address in the SPI flash where the image lives.
    pub spi_target_address: u64,
}

/// What a completed action hands back to the caller.
#[derive(Debug)]
pub enum ActionReport {
    /// Nothing beyond success.
    None,
    /// The captured IDCODE.
    Idcode(IdCode),
    /// Aggregated device information.
    DeviceInfo(Box<g5::DeviceInfo>),
    /// The device certificate.
    DeviceCertificate(g5::DeviceCertificate),
    /// Per-segment digest check verdicts.
    DigestCheck(g5::DigestCheckReport),
    /// The zeroization certificate.
    Zeroization(g5::ZeroizationCertificate),
    /// The SPI-flash JEDEC id.
    SpiFlashId([u8; 3]),
    /// Data read from the SPI flash.
    SpiData(Vec<u8>),
}

impl From<G5Report> for ActionReport {
    fn from(report: G5Report) -> Self {
        match report {
            G5Report::None => ActionReport::None,
            G5Report::Idcode(id) => ActionReport::Idcode(id),
            G5Report::DeviceInfo(info) => ActionReport::DeviceInfo(info),
            G5Report::DeviceCertificate(cert) => ActionReport::DeviceCertificate(cert),
            G5Report::DigestCheck(report) => ActionReport::DigestCheck(report),
            G5Report::Zeroization(cert) => ActionReport::Zeroization(cert),
        }
    }
}

impl From<SpiReport> for ActionReport {
    fn from(report: SpiReport) -> Self {
        match report {
            SpiReport::None => ActionReport::None,
            SpiReport::JedecId(id) => ActionReport::SpiFlashId(id),
            SpiReport::Data(data) => ActionReport::SpiData(data),
        }
    }
}

/// Read the 32-bit IDCODE register.
fn read_idcode<P: JtagIo>(jtag: &mut JtagDriver<P>) -> Result<u32, Error> {
    jtag.ir_scan(g5::IDCODE)?;
    jtag.goto_state(TapState::RunTestIdle, 0)?;
    let mut out = [0u8; 4];
    jtag.dr_scan_out(32, None, &mut out)?;
    let idcode = u32::from_le_bytes(out);
    tracing::info!("IDCODE: {}", IdCode::new(idcode));
    Ok(idcode)
}

/// Run one device action over an already-constructed driver (use this when
/// the scan chain needs padding configuration).
pub fn run_with_driver<P: JtagIo>(
    jtag: &mut JtagDriver<P>,
    image: &mut DatImage,
    action: Action,
    options: &RunOptions,
    progress: &Progress,
) -> Result<ActionReport, Error> {
    image.flush();

    if action.is_spi_flash() {
        jtag.goto_state(TapState::TestLogicReset, 0)?;
        let idcode = read_idcode(jtag)?;
        if !IdCode::is_g5_family(idcode) {
            return Err(Error::Idcode {
                reason: "no G5 device found on the chain",
                unique_exit_code: None,
            });
        }
        let mut engine =
            SpiFlashEngine::new(jtag, image, progress, action, options.spi_target_address);
        return engine.run().map(ActionReport::from);
    }

    tracing::info!("identifying device...");
    jtag.goto_state(TapState::TestLogicReset, 0)?;
    let idcode = read_idcode(jtag)?;

    // Zeroize and the display-only actions run directly, without validating
    // the loaded image or holding the device against its header identity;
    // the engine re-checks identity for the actions that stream image data.
    let skips_validation = matches!(
        action,
        Action::ReadIdcode
            | Action::DeviceInfo
            | Action::ReadDeviceCertificate
            | Action::ZeroizeLikeNew
            | Action::ZeroizeUnrecoverable
    );
    let device = if skips_validation {
        DeviceIdentity {
            idcode,
            revision: (idcode >> 28) as u8,
            // Best-effort header reads; these only pick the register widths
            // used for interrogation and are not checked against the device.
            family: image.device_family().unwrap_or(0),
            exception: image.device_exception().unwrap_or(0),
        }
    } else {
        image.validate()?;
        let device = g5::check_device_id(image, idcode)?;
        if device.family != g5::G5_FAMILY_ID && device.family != g5::G5SOC_FAMILY_ID {
            return Err(Error::Idcode {
                reason: "programming file does not target a G5-family device",
                unique_exit_code: None,
            });
        }
        device
    };
    let mut engine = G5Engine::new(jtag, image, progress, action, device);
    engine.run().map(ActionReport::from)
}

/// Run one device action: identify the target, execute, and leave the TAP in
/// Test-Logic-Reset.
pub fn run<P: JtagIo>(
    probe: P,
    image: &mut DatImage,
    action: Action,
    options: &RunOptions,
    progress: &Progress,
) -> Result<ActionReport, Error> {
    let mut jtag = JtagDriver::new(probe);
    run_with_driver(&mut jtag, image, action, options, progress)
}
