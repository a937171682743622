//! The error taxonomy of the programming engine.
//!
//! Every terminal outcome maps to a stable numeric process exit code, and
//! protocol-level failures additionally carry the device's unique exit code.
//! Operators and downstream tooling depend on both sets of numbers.

use crate::image::ImageError;
use crate::jtag::JtagError;
use crate::probe::ProbeError;

/// Where in the frame-data stream a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    /// 1-based component index within the image.
    pub component: u16,
    /// 1-based 128-bit block index within the component.
    pub block: u32,
}

/// The overarching error type; every variant knows its process exit code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The probe hardware could not be driven.
    #[error("probe error")]
    Probe(#[from] ProbeError),

    /// A JTAG state-machine transition was requested that the transition
    /// table does not cover.
    #[error("JTAG error")]
    Jtag(#[from] JtagError),

    /// The programming image could not be accessed or failed validation.
    #[error("image error")]
    Image(#[from] ImageError),

    /// A controller poll did not report ready within the iteration bound.
    #[error("device poll timed out (exit code {unique_exit_code})")]
    PollTimeout {
        /// Device-defined unique exit code for this poll site.
        unique_exit_code: u32,
    },

    /// The device reported a fault while consuming frame data.
    #[error("frame data fault in component {}, block {} (exit code {unique_exit_code}): {reason}", location.component, location.block)]
    ProcessData {
        /// Failing component and block.
        location: FrameLocation,
        /// Device-defined unique exit code from the data-status taxonomy.
        unique_exit_code: u32,
        /// Operator-facing one-line reason.
        reason: &'static str,
    },

    /// The JTAG IDCODE did not match the image's expectation.
    #[error("IDCODE verification failed: {reason}")]
    Idcode {
        /// Operator-facing one-line reason.
        reason: &'static str,
        /// Device-defined unique exit code, when one is assigned.
        unique_exit_code: Option<u32>,
    },

    /// The erase flow failed.
    #[error("erase failed (exit code {unique_exit_code})")]
    Erase {
        /// Device-defined unique exit code.
        unique_exit_code: u32,
    },

    /// A checksum comparison failed.
    #[error("checksum mismatch")]
    Checksum,

    /// The programming flow failed.
    #[error("programming failed (exit code {unique_exit_code})")]
    CoreProgram {
        /// Device-defined unique exit code.
        unique_exit_code: u32,
    },

    /// The verify flow failed.
    #[error("verification failed (exit code {unique_exit_code})")]
    Verify {
        /// Device-defined unique exit code.
        unique_exit_code: u32,
    },

    /// A security unlock could not be performed.
    #[error("security unlock failed")]
    Unlock,

    /// Bitstream authentication failed.
    #[error("authentication failed (exit code {unique_exit_code})")]
    Authentication {
        /// Device-defined unique exit code.
        unique_exit_code: u32,
    },

    /// Programming mode could not be entered.
    #[error("failed to enter programming mode")]
    InitFailure,

    /// A passkey did not match, or a protocol result register disagreed
    /// with the expected pattern.
    #[error("{reason}")]
    Match {
        /// Operator-facing one-line reason.
        reason: &'static str,
        /// Device-defined unique exit code, when one is assigned.
        unique_exit_code: Option<u32>,
    },

    /// Digest verification is disabled on the device or reported failure.
    #[error("digest verification failed: {reason}")]
    VerifyDigest {
        /// Operator-facing one-line reason.
        reason: &'static str,
    },

    /// The requested action is not part of the device action set.
    #[error("action {action:?} is not supported by this device family")]
    ActionNotSupported {
        /// The rejected action.
        action: crate::Action,
    },

    /// The requested action needs display support that this build lacks.
    #[error("action {action:?} is not enabled in this build")]
    CodeNotEnabled {
        /// The rejected action.
        action: crate::Action,
    },

    /// SPI-flash erase reported an error bit.
    #[error("SPI flash erase failed")]
    SpiFlashErase,

    /// SPI-flash page program reported an error bit.
    #[error("SPI flash program failed")]
    SpiFlashProgram,

    /// SPI-flash contents disagree with the image.
    #[error("SPI flash verify failed at address {address:#x}: expected {expected:#04x}, read {actual:#04x}")]
    SpiFlashVerify {
        /// First mismatching byte address.
        address: u64,
        /// Byte expected from the image.
        expected: u8,
        /// Byte read from the flash.
        actual: u8,
    },

    /// SPI-flash busy-wait exceeded the iteration bound.
    #[error("SPI flash poll timed out")]
    SpiFlashTimeout,

    /// The image does not fit the flash at the requested target address.
    #[error("image does not fit the SPI flash: target {target:#x} + {image_size:#x} exceeds device size {device_size:#x}")]
    ImageSize {
        /// Requested target byte address.
        target: u64,
        /// Image size in bytes.
        image_size: u64,
        /// Flash device size in bytes.
        device_size: u64,
    },

    /// A non-blank byte was found during blank check.
    #[error("SPI flash is not blank at address {address:#x}: read {value:#04x}")]
    SpiFlashBlankCheck {
        /// Address of the first non-blank byte.
        address: u64,
        /// The offending byte.
        value: u8,
    },
}

impl Error {
    /// The numeric process exit code of this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Probe(_) => 170,
            Error::Jtag(JtagError::StateNotHandled { .. }) => 110,
            Error::Jtag(JtagError::Probe(_)) => 170,
            Error::Image(ImageError::CrcMismatch { .. } | ImageError::NotValid(_)) => 100,
            Error::Image(_) => 180,
            Error::ProcessData { .. } => 2,
            Error::Idcode { .. } => 6,
            Error::PollTimeout { .. } => 7,
            Error::Erase { .. } => 8,
            Error::Checksum => 9,
            Error::CoreProgram { .. } => 10,
            Error::Verify { .. } => 12,
            Error::Unlock => 16,
            Error::Authentication { .. } => 18,
            Error::InitFailure => 25,
            Error::Match { .. } => 35,
            Error::VerifyDigest { .. } => 60,
            Error::ActionNotSupported { .. } => 151,
            Error::CodeNotEnabled { .. } => 152,
            Error::SpiFlashErase => 202,
            Error::SpiFlashProgram => 203,
            Error::SpiFlashVerify { .. } => 204,
            Error::SpiFlashTimeout => 206,
            Error::ImageSize { .. } => 209,
            Error::SpiFlashBlankCheck { .. } => 210,
        }
    }

    /// The device-defined unique exit code carried by this error, if any.
    pub fn unique_exit_code(&self) -> Option<u32> {
        match self {
            Error::PollTimeout { unique_exit_code }
            | Error::ProcessData {
                unique_exit_code, ..
            }
            | Error::Erase { unique_exit_code }
            | Error::CoreProgram { unique_exit_code }
            | Error::Verify { unique_exit_code }
            | Error::Authentication { unique_exit_code } => Some(*unique_exit_code),
            Error::Idcode {
                unique_exit_code, ..
            }
            | Error::Match {
                unique_exit_code, ..
            } => *unique_exit_code,
            _ => None,
        }
    }

    /// The failing frame location recorded during the frame-data loop.
    pub fn frame_location(&self) -> Option<FrameLocation> {
        match self {
            Error::ProcessData { location, .. } => Some(*location),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_published_taxonomy() {
        assert_eq!(
            Error::PollTimeout {
                unique_exit_code: 32818
            }
            .exit_code(),
            7
        );
        assert_eq!(
            Error::ProcessData {
                location: FrameLocation {
                    component: 1,
                    block: 1
                },
                unique_exit_code: 32773,
                reason: "",
            }
            .exit_code(),
            2
        );
        assert_eq!(Error::VerifyDigest { reason: "" }.exit_code(), 60);
        assert_eq!(
            Error::Image(ImageError::CrcMismatch {
                expected: 0,
                actual: 1
            })
            .exit_code(),
            100
        );
        assert_eq!(Error::SpiFlashTimeout.exit_code(), 206);
    }
}
