//! JTAG programming engine for G5-family FPGAs.
//!
//! The crate programs, verifies, erases, authenticates, interrogates and
//! zeroizes G5 devices over a bit-banged JTAG test-access port, and drives an
//! attached SPI-NOR flash through the device's JTAG-hosted SPI bridge. Input
//! is a structured programming image ("DAT" file); output is a bit-accurate
//! JTAG stimulus stream plus operator progress and status reporting.
//!
//! The layering, bottom to top:
//!
//! - [`probe`]: the five-line GPIO contract ([`probe::JtagIo`]) and the Linux
//!   character-device backend.
//! - [`jtag`]: the TAP state machine and LSB-first shifter.
//! - [`image`]: paged random access into the DAT file, header parsing, CRC.
//! - [`g5`]: the device protocol engine.
//! - [`spi_flash`]: the SPIPROG-tunneled SPI-NOR subsystem.
//! - [`run`]: the top-level single-action entry point.

pub mod error;
pub mod g5;
pub mod idcode;
pub mod image;
pub mod jtag;
pub mod probe;
pub mod progress;
pub mod spi_flash;

mod dispatch;

pub use dispatch::{run, run_with_driver, ActionReport, RunOptions};
pub use error::{Error, FrameLocation};
pub use idcode::IdCode;
pub use image::{DatImage, MemoryStorage};
pub use jtag::{ChainConfig, JtagDriver, TapState};
pub use probe::{GpioProbe, JtagIo};
pub use progress::{Operation, Progress, ProgressEvent};

/// One device action per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    /// Dump design information, digests and security state.
    DeviceInfo = 1,
    /// Read and report the JTAG IDCODE.
    ReadIdcode = 2,
    /// Erase the blocks supported by the image.
    Erase = 3,
    /// Erase, program and verify the blocks supported by the image.
    Program = 5,
    /// Verify device contents against the image.
    Verify = 6,
    /// Authenticate the encrypted bitstream without programming.
    EncDataAuthentication = 7,
    /// Compare on-device digests against authoritative values.
    VerifyDigest = 28,
    /// Validate user encryption keys (not supported on this family).
    ValidateUserEncKeys = 29,
    /// Read and report the device certificate.
    ReadDeviceCertificate = 30,
    /// Zeroize; the device stays recoverable.
    ZeroizeLikeNew = 31,
    /// Zeroize; the device is unrecoverable afterwards.
    ZeroizeUnrecoverable = 32,
    /// Read the SPI-flash JEDEC id.
    SpiFlashReadId = 40,
    /// Read SPI-flash contents.
    SpiFlashRead = 41,
    /// Erase the whole SPI-flash die.
    SpiFlashErase = 43,
    /// Erase then program the image into the SPI flash.
    SpiFlashProgram = 45,
    /// Verify SPI-flash contents against the image.
    SpiFlashVerify = 46,
    /// Check that the whole SPI flash is erased.
    SpiFlashBlankCheck = 47,
    /// Erase only the sectors covered by the image.
    SpiFlashEraseImage = 48,
}

impl Action {
    /// Every recognized action with its operator-facing name.
    pub const ALL: [(&'static str, Action); 18] = [
        ("device_info", Action::DeviceInfo),
        ("read_idcode", Action::ReadIdcode),
        ("erase", Action::Erase),
        ("program", Action::Program),
        ("verify", Action::Verify),
        ("enc_data_authentication", Action::EncDataAuthentication),
        ("verify_digest", Action::VerifyDigest),
        ("validate_user_enc_keys", Action::ValidateUserEncKeys),
        ("read_device_certificate", Action::ReadDeviceCertificate),
        ("zeroize_like_new", Action::ZeroizeLikeNew),
        ("zeroize_unrecoverable", Action::ZeroizeUnrecoverable),
        ("spi_flash_read_idcode", Action::SpiFlashReadId),
        ("spi_flash_read", Action::SpiFlashRead),
        ("spi_flash_erase", Action::SpiFlashErase),
        ("spi_flash_program", Action::SpiFlashProgram),
        ("spi_flash_verify", Action::SpiFlashVerify),
        ("spi_flash_blank_check", Action::SpiFlashBlankCheck),
        ("spi_flash_erase_image", Action::SpiFlashEraseImage),
    ];

    /// The numeric action code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The operator-facing action name.
    pub fn name(self) -> &'static str {
        Action::ALL
            .iter()
            .find(|(_, action)| *action == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Whether the action targets the SPI-flash subsystem.
    pub fn is_spi_flash(self) -> bool {
        matches!(
            self,
            Action::SpiFlashReadId
                | Action::SpiFlashRead
                | Action::SpiFlashErase
                | Action::SpiFlashProgram
                | Action::SpiFlashVerify
                | Action::SpiFlashBlankCheck
                | Action::SpiFlashEraseImage
        )
    }
}

/// An action name that does not map to any action code.
#[derive(Debug, thiserror::Error)]
#[error("unknown action {0:?}")]
pub struct UnknownAction(pub String);

impl std::str::FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|(_, action)| *action)
            .ok_or_else(|| UnknownAction(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_round_trip_case_insensitively() {
        assert_eq!("program".parse::<Action>().unwrap(), Action::Program);
        assert_eq!(
            "ZEROIZE_LIKE_NEW".parse::<Action>().unwrap(),
            Action::ZeroizeLikeNew
        );
        assert_eq!(
            "Spi_Flash_Read_IdCode".parse::<Action>().unwrap(),
            Action::SpiFlashReadId
        );
        assert!("reboot".parse::<Action>().is_err());
        for (name, action) in Action::ALL {
            assert_eq!(action.name(), name);
        }
    }

    #[test]
    fn action_codes_are_stable() {
        assert_eq!(Action::Program.code(), 5);
        assert_eq!(Action::VerifyDigest.code(), 28);
        assert_eq!(Action::SpiFlashBlankCheck.code(), 47);
    }
}
