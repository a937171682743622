//! The frame-data loop: erase, program, verify and authenticate all push the
//! image through the device 128 bits at a time, overlapping each frame shift
//! with the status poll of the previous one.

use super::{G5Engine, FRAME_BIT_LENGTH, FRAME_DATA, FRAME_STATUS, STANDARD_CYCLES, STANDARD_DELAY_US};
use crate::error::{Error, FrameLocation};
use crate::image::Block;
use crate::jtag::TapState;
use crate::probe::JtagIo;
use crate::progress::Operation;
use crate::Action;

/// Byte of a component header carrying the component type.
pub(super) const COMPONENT_TYPE_BYTE: u64 = 50;
/// Byte of a component header carrying the OWP keymode.
pub(super) const OWP_KEY_MODE_BYTE: u64 = 51;
/// Byte of a component header whose bit 1 flags certificate support.
pub(super) const GEN_CERT_BYTE: u64 = 340;

/// Component types.
pub(super) const COMP_BITS: u8 = 0;
const COMP_FPGA: u8 = 1;
const COMP_KEYS: u8 = 2;
const COMP_SNVM: u8 = 3;
const COMP_ENVM: u8 = 6;
const COMP_OWP: u8 = 7;
const COMP_EOB: u8 = 127;

/// Certificate-of-conformance size: 928 bits, read as 8 shared-buffer blocks.
const COFC_BLOCKS: u8 = 8;
/// Byte offset of the component digest within the certificate.
const COFC_DIGEST_OFFSET: usize = 20;

fn component_type_name(component_type: u8) -> &'static str {
    match component_type {
        COMP_BITS => "BITS",
        COMP_FPGA => "Fabric",
        COMP_KEYS => "Security",
        COMP_SNVM => "sNVM",
        COMP_ENVM => "eNVM",
        COMP_OWP => "OWP",
        COMP_EOB => "EOB",
        _ => "unknown",
    }
}

/// Classify a FRAME_STATUS response into a unique exit code and an
/// operator-facing reason.
pub(crate) fn decode_data_status(poll_buf: &[u8; 17]) -> (u32, &'static str) {
    match poll_buf[1] {
        1 | 2 | 4 | 8 | 127 | 132 | 133 | 134 | 135 => {
            (32799, "bitstream or data is corrupted or noisy")
        }
        3 => (32801, "invalid or corrupted encryption key"),
        5 => (32803, "back level not satisfied"),
        6 => (32847, "bitstream programming action is disabled"),
        7 => (32805, "DSN binding mismatch"),
        9 => (32807, "insufficient device capabilities"),
        10 => (32809, "incorrect DEVICEID"),
        11 => (32811, "programming file is out of date, please regenerate"),
        12 => (32813, "programming file does not support verification"),
        13 => (32816, "invalid or inaccessible device certificate"),
        129 => (32797, "device security prevented operation"),
        128 => {
            if (poll_buf[4] >> 2) & 0x1f < 16 {
                (32773, "failed to verify FPGA array")
            } else {
                (32774, "failed to verify fabric configuration")
            }
        }
        131 => {
            let field = (poll_buf[4] >> 2) | poll_buf[5].wrapping_shl(6);
            let snvm_range = (2..=222).contains(&field);
            if poll_buf[4] & 0x3 == 1 && snvm_range && (poll_buf[6] >> 1) & 0x3 == 1 {
                (32776, "failed to verify sNVM")
            } else if poll_buf[4] & 0x3 == 1 && snvm_range && (poll_buf[6] >> 1) & 0x3 == 2 {
                (32857, "failed to verify pNVM")
            } else if poll_buf[4] & 0x3 == 3 {
                (32775, "failed to verify security")
            } else {
                (0, "unrecognized data status")
            }
        }
        _ => (0, "unrecognized data status"),
    }
}

impl<P: JtagIo> G5Engine<'_, P> {
    /// Stream components `first..=last` of `block` through the device,
    /// shift-and-polling frame by frame.
    pub(super) fn process_data(
        &mut self,
        block: Block,
        first: u16,
        last: u16,
        operation: Operation,
    ) -> Result<(), Error> {
        let mut data_index: u64 = 0;
        self.progress.started(operation);
        for component in first..=last {
            let block_count = self.image.block_count(component)?;
            // Component metadata always comes from the datastream block,
            // also while erasing over the erase stream.
            let component_type = self
                .image
                .get_bytes(Block::DataStream, COMPONENT_TYPE_BYTE + data_index / 8, 1)?
                as u8;
            let supports_cert = self
                .image
                .get_bytes(Block::DataStream, GEN_CERT_BYTE + data_index / 8, 1)?
                & 0x2
                != 0;

            self.progress.component(component, last);
            tracing::info!(
                "processing component {component} of {last} ({}, {block_count} blocks)",
                component_type_name(component_type)
            );

            self.jtag.ir_scan(FRAME_DATA)?;
            self.jtag
                .dr_scan_in_paged(self.image, block, FRAME_BIT_LENGTH, data_index)?;

            let mut last_percent = 0u8;
            for frame in 1..=block_count {
                let percent = (frame as u64 * 100 / block_count as u64) as u8;
                if percent != last_percent {
                    self.progress.percent(operation, percent);
                    last_percent = percent;
                }
                if frame == 1 && component_type == COMP_OWP {
                    let keymode = self
                        .image
                        .get_bytes(Block::DataStream, OWP_KEY_MODE_BYTE + data_index / 8, 1)?;
                    tracing::info!("OWP is in use, keymode {keymode}");
                }

                self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
                self.jtag.delay_us(STANDARD_DELAY_US);

                let polled = if frame == block_count {
                    self.device_poll(FRAME_DATA, FRAME_BIT_LENGTH, 127)
                } else {
                    self.device_shift_and_poll(
                        FRAME_DATA,
                        FRAME_BIT_LENGTH,
                        127,
                        block,
                        data_index + FRAME_BIT_LENGTH as u64,
                    )
                };

                let location = FrameLocation {
                    component,
                    block: frame,
                };
                if let Err(err) = polled {
                    if !matches!(err, Error::PollTimeout { .. }) {
                        return Err(err);
                    }
                    let unique_exit_code = self.timeout_exit_code();
                    tracing::error!(
                        "instruction timed out at component {component}, block {frame} \
                         (exit code {unique_exit_code})"
                    );
                    self.progress.finished(operation);
                    return Err(Error::ProcessData {
                        location,
                        unique_exit_code,
                        reason: "instruction timed out",
                    });
                }
                if self.poll_buf[0] & 0x8 != 0 {
                    tracing::error!(
                        "frame data fault at component {component}, block {frame}: {:02x?}",
                        &self.poll_buf[..2]
                    );
                    self.progress.finished(operation);
                    return Err(self.frame_fault(location));
                }
                data_index += FRAME_BIT_LENGTH as u64;
            }

            if self.action == Action::Program && supports_cert {
                self.report_certificate()?;
                tracing::info!(
                    "{} component bitstream digest: {}",
                    component_type_name(component_type),
                    super::info::hex(&self.component_digest)
                );
            }
        }
        self.progress.finished(operation);
        Ok(())
    }

    fn timeout_exit_code(&self) -> u32 {
        match self.action {
            Action::Program => 32824,
            Action::Verify => 32822,
            Action::Erase => 32820,
            _ => 32818,
        }
    }

    /// Fetch and classify the data status after the device flagged a fault.
    fn frame_fault(&mut self, location: FrameLocation) -> Error {
        match self.get_data_status() {
            Err(_) => Error::ProcessData {
                location,
                unique_exit_code: self.timeout_exit_code(),
                reason: "status readout timed out",
            },
            Ok(()) if self.poll_buf[0] & 0x4 != 0 => {
                tracing::error!("data status: {:02x?}", &self.poll_buf[..8]);
                let (unique_exit_code, reason) = decode_data_status(&self.poll_buf);
                if self.fetch_debug_info().is_ok() {
                    tracing::debug!("debug info: {:02x?}", &self.shared_buf[..84]);
                }
                Error::ProcessData {
                    location,
                    unique_exit_code,
                    reason,
                }
            }
            Ok(()) => Error::ProcessData {
                location,
                unique_exit_code: 0,
                reason: "device signalled a data fault",
            },
        }
    }

    /// Read the 64-bit frame status register.
    fn get_data_status(&mut self) -> Result<(), Error> {
        self.jtag.ir_scan(FRAME_STATUS)?;
        self.jtag.dr_scan_in(0, 64, None)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(FRAME_STATUS, 64, 63)
    }

    /// Read the certificate of conformance; the component digest sits at a
    /// fixed offset inside it.
    fn report_certificate(&mut self) -> Result<(), Error> {
        self.read_shared_buffer(COFC_BLOCKS)?;
        self.component_digest
            .copy_from_slice(&self.shared_buf[COFC_DIGEST_OFFSET..COFC_DIGEST_OFFSET + 32]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(byte1: u8, byte4: u8, byte5: u8, byte6: u8) -> [u8; 17] {
        let mut buf = [0u8; 17];
        buf[1] = byte1;
        buf[4] = byte4;
        buf[5] = byte5;
        buf[6] = byte6;
        buf
    }

    #[test]
    fn data_status_taxonomy() {
        for corrupted in [1, 2, 4, 8, 127, 132, 133, 134, 135] {
            assert_eq!(decode_data_status(&status(corrupted, 0, 0, 0)).0, 32799);
        }
        assert_eq!(decode_data_status(&status(3, 0, 0, 0)).0, 32801);
        assert_eq!(decode_data_status(&status(5, 0, 0, 0)).0, 32803);
        assert_eq!(decode_data_status(&status(6, 0, 0, 0)).0, 32847);
        assert_eq!(decode_data_status(&status(7, 0, 0, 0)).0, 32805);
        assert_eq!(decode_data_status(&status(9, 0, 0, 0)).0, 32807);
        assert_eq!(decode_data_status(&status(10, 0, 0, 0)).0, 32809);
        assert_eq!(decode_data_status(&status(11, 0, 0, 0)).0, 32811);
        assert_eq!(decode_data_status(&status(12, 0, 0, 0)).0, 32813);
        assert_eq!(decode_data_status(&status(13, 0, 0, 0)).0, 32816);
        assert_eq!(decode_data_status(&status(129, 0, 0, 0)).0, 32797);
    }

    #[test]
    fn fabric_subclassification() {
        // Field value below 16 is the FPGA array, above is configuration.
        assert_eq!(decode_data_status(&status(128, 0x00, 0, 0)).0, 32773);
        assert_eq!(decode_data_status(&status(128, 16 << 2, 0, 0)).0, 32774);
    }

    #[test]
    fn nvm_and_security_subclassification() {
        // byte4 low bits 01, composed field in 2..=222, byte6 selects sNVM
        // vs pNVM.
        let snvm = status(131, (2 << 2) | 0x1, 0, 1 << 1);
        assert_eq!(decode_data_status(&snvm).0, 32776);
        let pnvm = status(131, (2 << 2) | 0x1, 0, 2 << 1);
        assert_eq!(decode_data_status(&pnvm).0, 32857);
        let security = status(131, 0x3, 0, 0);
        assert_eq!(decode_data_status(&security).0, 32775);
    }
}
