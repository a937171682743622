//! Security interrogation and passkey unlocking.

use super::{
    G5Engine, FRAME_BIT_LENGTH, G5SOC_FAMILY_ID, KEYHI, KEYLO, QUERY_SECURITY, STANDARD_CYCLES,
    STANDARD_DELAY_US, UNLOCK_DEBUG_PASSCODE, UNLOCK_USER_PASSCODE, UNLOCK_VENDOR_PASSCODE,
};
use crate::error::Error;
use crate::image::Block;
use crate::jtag::TapState;
use crate::probe::JtagIo;

/// The 256-bit passkeys the device can demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Passkey {
    /// Debug passkey.
    Dpk,
    /// User passkey 1 (FlashLock).
    Upk1,
    /// User passkey 2.
    Upk2,
}

impl Passkey {
    fn block(self) -> Block {
        match self {
            Passkey::Dpk => Block::Dpk,
            Passkey::Upk1 => Block::Upk1,
            Passkey::Upk2 => Block::Upk2,
        }
    }

    fn unlock_opcode(self) -> u8 {
        match self {
            Passkey::Dpk => UNLOCK_DEBUG_PASSCODE,
            Passkey::Upk1 => UNLOCK_USER_PASSCODE,
            Passkey::Upk2 => UNLOCK_VENDOR_PASSCODE,
        }
    }

    fn unique_exit_code(self) -> Option<u32> {
        match self {
            Passkey::Dpk => None,
            Passkey::Upk1 => Some(32784),
            Passkey::Upk2 => Some(32785),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Passkey::Dpk => "DPK",
            Passkey::Upk1 => "UPK1",
            Passkey::Upk2 => "UPK2",
        }
    }

    fn fail_reason(self) -> &'static str {
        match self {
            Passkey::Dpk => "failed to unlock debug pass key",
            Passkey::Upk1 => "failed to unlock user pass key 1",
            Passkey::Upk2 => "failed to unlock user pass key 2",
        }
    }
}

impl<P: JtagIo> G5Engine<'_, P> {
    /// Read the security lock state into the shared buffer (one block on
    /// G5, three on G5 SoC).
    pub(crate) fn query_security(&mut self) -> Result<(), Error> {
        self.jtag.ir_scan(QUERY_SECURITY)?;
        self.jtag.dr_scan_in(0, 16, None)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.device_poll(QUERY_SECURITY, 16, 15).map_err(|err| {
            tracing::error!("failed to query security information");
            err
        })?;
        let blocks = if self.device.family == G5SOC_FAMILY_ID {
            3
        } else {
            1
        };
        self.read_shared_buffer(blocks)?;
        tracing::debug!(
            "security locks and configuration: {:02x?}",
            &self.shared_buf[..9]
        );
        Ok(())
    }

    /// Unlock one of the device passkeys with the key material from the
    /// image. A missing key block is reported as a warning and skipped, the
    /// device will reject the following operation itself if the key was
    /// really needed.
    pub(crate) fn unlock_passkey(&mut self, key: Passkey) -> Result<(), Error> {
        let (_, present) = self.image.get_data(key.block(), 0)?;
        if present == 0 {
            tracing::warn!("{} data is missing from the image", key.name());
            return Ok(());
        }
        self.load_passkey(key)?;

        self.jtag.ir_scan(key.unlock_opcode())?;
        self.jtag.dr_scan_in(0, 8, None)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        let polled = self.device_poll(key.unlock_opcode(), 8, 7);
        if polled.is_err() || self.poll_buf[0] & 0x3 != 0x1 {
            tracing::error!("{}", key.fail_reason());
            return Err(Error::Match {
                reason: key.fail_reason(),
                unique_exit_code: key.unique_exit_code(),
            });
        }
        tracing::info!("{} security unlocked", key.name());
        Ok(())
    }

    /// Shift the 256-bit key in as two 128-bit halves.
    fn load_passkey(&mut self, key: Passkey) -> Result<(), Error> {
        self.jtag.ir_scan(KEYLO)?;
        self.jtag
            .dr_scan_in_paged(self.image, key.block(), FRAME_BIT_LENGTH, 0)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(KEYLO, FRAME_BIT_LENGTH, 127)
            .map_err(|_| {
                tracing::error!("failed to load key low half: {:02x?}", &self.poll_buf[..16]);
                Error::Match {
                    reason: "failed to load passkey",
                    unique_exit_code: None,
                }
            })?;

        self.jtag.ir_scan(KEYHI)?;
        self.jtag.dr_scan_in_paged(
            self.image,
            key.block(),
            FRAME_BIT_LENGTH,
            FRAME_BIT_LENGTH as u64,
        )?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(KEYHI, FRAME_BIT_LENGTH, 127).map_err(|_| {
            tracing::error!("failed to load key high half: {:02x?}", &self.poll_buf[..16]);
            Error::Match {
                reason: "failed to load passkey",
                unique_exit_code: None,
            }
        })
    }
}
