//! Device interrogation: design info, digests, debug info, serial number,
//! security settings, certificates. The engine extracts bytes; the types
//! here are plain data with operator-facing `Display` impls.

use std::fmt;

use super::{
    G5Engine, FRAME_BIT_LENGTH, G5_FAMILY_ID, READ_DEBUG_INFO, READ_DESIGN_INFO, READ_DEVICE_CERT,
    READ_DEVICE_INTEGRITY, READ_DIGEST, READ_FSN, STANDARD_CYCLES, STANDARD_DELAY_US, TVS_MONITOR,
    UDV,
};
use crate::error::Error;
use crate::jtag::TapState;
use crate::probe::JtagIo;

const MAX_ALLOWED_PROGRAMMING_CYCLES: u16 = 500;

/// Format bytes the way the device documentation reads them, most
/// significant byte first.
pub(super) fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().rev().enumerate() {
        if i > 0 {
            out.push(if i % 16 == 0 { '\n' } else { ' ' });
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Design name and versioning from READ_DESIGN_INFO.
#[derive(Debug, Clone)]
pub struct DesignInfo {
    /// Design name, as stored (up to 30 characters).
    pub name: String,
    /// Design checksum.
    pub checksum: [u8; 2],
    /// Design version.
    pub version: [u8; 2],
    /// Back-level value.
    pub back_level: [u8; 2],
}

impl fmt::Display for DesignInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Design name: {}", self.name)?;
        writeln!(f, "Checksum: {}", hex(&self.checksum))?;
        writeln!(f, "Design version: {}", hex(&self.version))?;
        write!(f, "Back level: {}", hex(&self.back_level))
    }
}

/// The thirteen 32-byte segment digests from READ_DIGEST.
#[derive(Debug, Clone)]
pub struct DeviceDigests {
    digests: [[u8; 32]; 13],
}

impl DeviceDigests {
    const LABELS: [&'static str; 13] = [
        "Fabric digest",
        "UFS CC segment digest",
        "SNVM digest",
        "UFS UL digest",
        "User Key digest 0",
        "User Key digest 1",
        "User Key digest 2",
        "User Key digest 3",
        "User Key digest 4",
        "User Key digest 5",
        "User Key digest 6",
        "UFS UPERM segment digest",
        "Factory digest",
    ];

    /// Iterate over `(label, digest)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[u8; 32])> {
        Self::LABELS.iter().copied().zip(self.digests.iter())
    }
}

impl fmt::Display for DeviceDigests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (label, digest)) in self.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{label}: {}", hex(digest))?;
        }
        Ok(())
    }
}

/// Decoded READ_DEBUG_INFO contents.
#[derive(Debug, Clone)]
pub struct DebugInfo {
    /// Raw debug info bytes (84 on G5, 94 on G5 SoC).
    pub raw: Vec<u8>,
    /// Programming cycle count, 0xFFFF when not available.
    pub cycle_count: u16,
    /// Last programming interface, when recognized.
    pub programming_mode: Option<&'static str>,
    /// Programming algorithm version, when valid.
    pub algo_version: Option<u8>,
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cycle_count != 0xffff {
            write!(f, "Cycle count: {}", self.cycle_count)?;
        } else {
            write!(f, "Cycle count: not available")?;
        }
        if let Some(mode) = self.programming_mode {
            write!(f, "\nProgramming mode: {mode}")?;
        }
        if let Some(version) = self.algo_version {
            write!(f, "\nAlgorithm version: {version}")?;
        }
        Ok(())
    }
}

/// Security lock and configuration bits from QUERY_SECURITY.
#[derive(Debug, Clone)]
pub struct SecuritySettings {
    bytes: Vec<u8>,
}

impl SecuritySettings {
    /// `(byte, bit, message)` for every lock the device reports.
    const LOCKS: [(usize, u8, &'static str); 31] = [
        (0, 0x01, "SmartDebug user debug access and active probes are disabled"),
        (0, 0x02, "SmartDebug sNVM debug is disabled"),
        (0, 0x04, "SmartDebug Live probes are disabled"),
        (0, 0x08, "User JTAG interface is disabled"),
        (0, 0x10, "JTAG boundary scan is disabled"),
        (0, 0x20, "Reading of temperature and voltage via JTAG/SPI slave is disabled"),
        (1, 0x01, "Plaintext passcode unlock is disabled"),
        (1, 0x02, "Fabric erase/write is disabled"),
        (1, 0x04, "External digest check via JTAG/SPI slave is disabled"),
        (1, 0x08, "Back level protection is enabled"),
        (1, 0x10, "Factory test mode is disabled"),
        (1, 0x40, "External zeroization via JTAG/SPI slave is disabled"),
        (1, 0x80, "SPI slave port is disabled"),
        (2, 0x01, "User lock segment is locked; FlashLock/UPK1 is required to change security"),
        (2, 0x02, "Authenticate programming action for JTAG/SPI slave is disabled"),
        (2, 0x04, "Program action for JTAG/SPI slave is disabled"),
        (2, 0x08, "Verify action for JTAG/SPI slave is disabled"),
        (2, 0x40, "Bitstream default encryption key (KLK) is disabled"),
        (2, 0x80, "Bitstream user encryption key 1 is disabled"),
        (3, 0x01, "Bitstream user encryption key 2 is disabled"),
        (4, 0x40, "Default encryption key (KLK) is disabled"),
        (4, 0x80, "User encryption key 1 is disabled"),
        (5, 0x01, "User encryption key 2 is disabled"),
        (6, 0x10, "sNVM write is disabled"),
        (6, 0x20, "PUF emulation via JTAG/SPI slave is disabled"),
        (7, 0x02, "User key set 1 is locked; FlashLock/UPK1 is required to make changes"),
        (7, 0x04, "User key set 2 is locked; FlashLock/UPK2 is required to make changes"),
        (7, 0x08, "Factory test access is permanently disabled"),
        (7, 0x10, "SmartDebug debugging is permanently disabled"),
        (7, 0x20, "Fabric erase/write is permanently disabled"),
        (7, 0x40, "FlashLock/UPK1 unlocking is permanently disabled"),
    ];

    fn new(bytes: Vec<u8>) -> Self {
        SecuritySettings { bytes }
    }

    /// The raw lock bytes.
    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }

    /// Messages for every asserted lock bit.
    pub fn active_locks(&self) -> Vec<&'static str> {
        let mut locks: Vec<&'static str> = Self::LOCKS
            .iter()
            .filter(|(byte, bit, _)| self.bytes.get(*byte).is_some_and(|b| b & bit != 0))
            .map(|(_, _, message)| *message)
            .collect();
        if self.bytes.get(7).is_some_and(|b| b & 0x80 != 0) {
            locks.push("FlashLock/UPK2 unlocking is permanently disabled");
        }
        if self.bytes.get(8).is_some_and(|b| b & 0x01 != 0) {
            locks.push("FlashLock/DPK unlocking is permanently disabled");
        }
        if self.bytes.get(8).is_some_and(|b| b & 0x02 != 0) {
            locks.push("UPERM segment is permanently locked");
        }
        locks
    }
}

impl fmt::Display for SecuritySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Security locks and configuration: {}", hex(&self.bytes))?;
        for lock in self.active_locks() {
            write!(f, "\n{lock}")?;
        }
        Ok(())
    }
}

/// The device certificate as returned by READ_DEVICE_CERT.
#[derive(Debug, Clone)]
pub struct DeviceCertificate {
    /// Whether the device validated the certificate signature.
    pub validated: bool,
    /// Certificate bytes, absent when the device reports none.
    pub data: Option<Vec<u8>>,
}

impl fmt::Display for DeviceCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) if self.validated => {
                writeln!(f, "Device certificate signature has been verified.")?;
                write!(f, "DEVICE_CERTIFICATE(LSB->MSB):")?;
                for (i, byte) in data.iter().enumerate() {
                    if i % 16 == 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{byte:02X} ")?;
                }
                Ok(())
            }
            Some(_) => write!(f, "Device certificate signature is not validated."),
            None => write!(f, "Device certificate is not available."),
        }
    }
}

/// Per-segment digest check verdicts from CHECK_DIGESTS.
#[derive(Debug, Clone, Copy)]
pub struct DigestCheckReport {
    bytes: [u8; 2],
}

impl DigestCheckReport {
    const SEGMENTS: [(usize, u8, &'static str); 12] = [
        (0, 0x01, "FPGA Fabric"),
        (0, 0x02, "Fabric Configuration"),
        (0, 0x04, "sNVM"),
        (0, 0x08, "User security policies segment"),
        (0, 0x10, "SMK segment"),
        (0, 0x20, "User Public Key segment"),
        (0, 0x40, "UPK1 segment"),
        (0, 0x80, "UEK1 segment"),
        (1, 0x01, "DPK segment"),
        (1, 0x02, "UPK2 segment"),
        (1, 0x04, "UEK2 segment"),
        (1, 0x10, "Factory row and factory key segment"),
    ];

    pub(super) fn new(bytes: [u8; 2]) -> Self {
        DigestCheckReport { bytes }
    }

    /// Iterate over `(segment, passed)` verdicts.
    pub fn segments(&self) -> impl Iterator<Item = (&'static str, bool)> + '_ {
        Self::SEGMENTS
            .iter()
            .map(|(byte, bit, label)| (*label, self.bytes[*byte] & bit != 0))
    }

    /// Whether every segment passed.
    pub fn all_passed(&self) -> bool {
        self.segments().all(|(_, passed)| passed)
    }
}

impl fmt::Display for DigestCheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (segment, passed)) in self.segments().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            if passed {
                write!(f, " --- {segment} digest verification: PASS")?;
            } else {
                write!(f, "Warning: --- {segment} digest verification: FAIL")?;
            }
        }
        Ok(())
    }
}

/// The zeroization certificate read back after a successful zeroize.
#[derive(Debug, Clone)]
pub struct ZeroizationCertificate(pub Vec<u8>);

impl fmt::Display for ZeroizationCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zeroization certificate: {}", hex(&self.0))
    }
}

/// Everything the DEVICE_INFO action collects.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// User-defined value register.
    pub udv: [u8; 4],
    /// Whether the FPGA array is programmed and enabled.
    pub core_enabled: Option<bool>,
    /// Design information.
    pub design: DesignInfo,
    /// Segment digests.
    pub digests: DeviceDigests,
    /// Decoded debug information.
    pub debug: DebugInfo,
    /// Device serial number.
    pub serial_number: [u8; 16],
    /// Temperature and voltage sensor snapshot.
    pub tvs_monitor: [u8; 16],
    /// Security locks.
    pub security: SecuritySettings,
    /// Device integrity bits (G5 family only).
    pub integrity_bits: Option<[u8; 32]>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UDV: {}", hex(&self.udv))?;
        match self.core_enabled {
            Some(true) => writeln!(f, "FPGA array is programmed and enabled.")?,
            Some(false) => writeln!(f, "FPGA array is not enabled.")?,
            None => writeln!(f, "Warning: core enable bit was not inspected.")?,
        }
        writeln!(f, "{}", self.design)?;
        writeln!(f, "{}", self.digests)?;
        writeln!(f, "{}", self.debug)?;
        writeln!(f, "DSN: {}", hex(&self.serial_number))?;
        writeln!(f, "TVS monitor: {}", hex(&self.tvs_monitor))?;
        write!(f, "{}", self.security)?;
        if let Some(dibs) = &self.integrity_bits {
            write!(f, "\nDevice integrity bits: {}", hex(dibs))?;
        }
        Ok(())
    }
}

impl<P: JtagIo> G5Engine<'_, P> {
    /// Read the user-defined value register.
    fn read_udv(&mut self) -> Result<[u8; 4], Error> {
        self.jtag.ir_scan(UDV)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(UDV, 32, 31)?;
        Ok(self.poll_buf[..4].try_into().unwrap())
    }

    fn read_design_info(&mut self) -> Result<DesignInfo, Error> {
        self.jtag.ir_scan(READ_DESIGN_INFO)?;
        self.jtag.dr_scan_in(0, 8, None)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(READ_DESIGN_INFO, 8, 7)?;
        self.read_shared_buffer(3)?;

        let name: String = self.shared_buf[2..32]
            .iter()
            .take_while(|&&byte| byte != 0)
            .map(|&byte| byte as char)
            .collect();
        Ok(DesignInfo {
            name,
            checksum: self.shared_buf[0..2].try_into().unwrap(),
            version: self.shared_buf[32..34].try_into().unwrap(),
            back_level: self.shared_buf[34..36].try_into().unwrap(),
        })
    }

    fn read_digests(&mut self) -> Result<DeviceDigests, Error> {
        self.jtag.ir_scan(READ_DIGEST)?;
        self.jtag.dr_scan_in(0, 8, None)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(READ_DIGEST, 8, 7)?;
        self.read_shared_buffer(26)?;

        let mut digests = [[0u8; 32]; 13];
        for (i, digest) in digests.iter_mut().enumerate() {
            digest.copy_from_slice(&self.shared_buf[i * 32..(i + 1) * 32]);
        }
        Ok(DeviceDigests { digests })
    }

    /// Pull the raw debug info into the shared buffer.
    pub(super) fn fetch_debug_info(&mut self) -> Result<(), Error> {
        self.jtag.ir_scan(READ_DEBUG_INFO)?;
        self.jtag.dr_scan_in(0, 8, None)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(READ_DEBUG_INFO, FRAME_BIT_LENGTH, 127)?;
        self.read_shared_buffer(6)
    }

    fn read_debug_info(&mut self) -> Result<DebugInfo, Error> {
        self.fetch_debug_info()?;
        let raw_len = if self.device.family == super::G5SOC_FAMILY_ID {
            94
        } else {
            84
        };
        let cycle_count = u16::from_le_bytes([self.shared_buf[60], self.shared_buf[61]]);
        let programming_mode = match self.shared_buf[36] {
            1 => Some("JTAG"),
            3 => Some("SPI-Slave"),
            _ => None,
        };
        let algo = self.shared_buf[32] & 0x3f;
        Ok(DebugInfo {
            raw: self.shared_buf[..raw_len].to_vec(),
            cycle_count,
            programming_mode,
            algo_version: (algo != 0 && algo != 0x3f).then_some(algo),
        })
    }

    /// Warn when the device is close to its programming-cycle endurance.
    pub(super) fn check_cycle_count(&mut self) -> Result<(), Error> {
        self.fetch_debug_info()?;
        let cycle_count = u16::from_le_bytes([self.shared_buf[60], self.shared_buf[61]]);
        if cycle_count != 0xffff {
            tracing::info!("programming cycle count: {cycle_count}");
            if cycle_count > MAX_ALLOWED_PROGRAMMING_CYCLES {
                tracing::warn!("maximum allowed programming cycle count is reached");
            }
        } else {
            tracing::info!("programming cycle count: not available");
        }
        Ok(())
    }

    fn read_fsn(&mut self) -> Result<[u8; 16], Error> {
        self.jtag.ir_scan(READ_FSN)?;
        self.jtag.dr_scan_in(0, 8, None)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.device_poll(READ_FSN, 129, 128).map_err(|_| {
            tracing::error!("failed to read DSN");
            Error::PollTimeout {
                unique_exit_code: 32769,
            }
        })?;
        Ok(self.poll_buf[..16].try_into().unwrap())
    }

    fn read_tvs_monitor(&mut self) -> Result<[u8; 16], Error> {
        self.jtag.ir_scan(TVS_MONITOR)?;
        self.jtag.dr_scan_in(0, FRAME_BIT_LENGTH, None)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        self.device_poll(TVS_MONITOR, FRAME_BIT_LENGTH, 127)
            .map_err(|_| {
                tracing::error!("failed to read tvs monitor");
                Error::Match {
                    reason: "failed to read tvs monitor",
                    unique_exit_code: Some(32846),
                }
            })?;
        Ok(self.poll_buf[..16].try_into().unwrap())
    }

    /// Read the device integrity bits with the fixed challenge.
    fn read_dibs(&mut self) -> Result<[u8; 32], Error> {
        let challenge: [u8; 16] = [
            0xb4, 0x70, 0xd8, 0x05, 0x01, 0x4f, 0x1c, 0x77, 0xde, 0x47, 0x9e, 0xce, 0x6a, 0x31,
            0x72, 0x5c,
        ];
        self.jtag.ir_scan(READ_DEVICE_INTEGRITY)?;
        self.jtag.dr_scan_in(0, FRAME_BIT_LENGTH, Some(&challenge))?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.jtag.delay_us(STANDARD_DELAY_US);
        let polled = self.device_poll(READ_DEVICE_INTEGRITY, FRAME_BIT_LENGTH, 127);
        if polled.is_err() || self.poll_buf[0] & 0x1 != 0 {
            tracing::error!("failed to read device integrity bits");
            return Err(Error::PollTimeout {
                unique_exit_code: 33003,
            });
        }
        self.read_shared_buffer(11)?;
        Ok(self.shared_buf[..32].try_into().unwrap())
    }

    /// Read the device certificate.
    pub(super) fn read_certificate(&mut self) -> Result<DeviceCertificate, Error> {
        self.jtag.ir_scan(READ_DEVICE_CERT)?;
        self.jtag.dr_scan_in(0, 8, None)?;
        self.jtag.goto_state(TapState::RunTestIdle, STANDARD_CYCLES)?;
        self.device_poll(READ_DEVICE_CERT, 8, 7).map_err(|_| {
            tracing::error!("failed to read device certificate, device is busy");
            Error::PollTimeout {
                unique_exit_code: 33000,
            }
        })?;
        if self.poll_buf[0] & 0x2 != 0 {
            return Ok(DeviceCertificate {
                validated: false,
                data: None,
            });
        }
        let validated = self.poll_buf[0] & 0x1 != 0;
        self.read_shared_buffer(64)?;
        Ok(DeviceCertificate {
            validated,
            data: Some(self.shared_buf.to_vec()),
        })
    }

    /// Collect everything the DEVICE_INFO action reports.
    pub(super) fn device_info_action(&mut self) -> Result<DeviceInfo, Error> {
        let udv = self.read_udv()?;
        self.check_core_status()?;
        let design = self.read_design_info()?;
        let digests = self.read_digests()?;
        let debug = self.read_debug_info()?;
        let serial_number = self.read_fsn()?;
        let tvs_monitor = self.read_tvs_monitor()?;
        self.query_security()?;
        let security = SecuritySettings::new(self.shared_buf[..9].to_vec());
        let integrity_bits = if self.device.family == G5_FAMILY_ID {
            Some(self.read_dibs()?)
        } else {
            None
        };
        Ok(DeviceInfo {
            udv,
            core_enabled: self.core_enabled,
            design,
            digests,
            debug,
            serial_number,
            tvs_monitor,
            security,
            integrity_bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_report_segments() {
        // Everything passing except UEK2 and the factory row.
        let report = DigestCheckReport::new([0xff, 0x03]);
        assert!(!report.all_passed());
        let verdicts: Vec<_> = report.segments().collect();
        assert_eq!(verdicts.len(), 12);
        assert_eq!(verdicts[0], ("FPGA Fabric", true));
        assert_eq!(verdicts[10], ("UEK2 segment", false));
        assert_eq!(verdicts[11], ("Factory row and factory key segment", false));

        let all = DigestCheckReport::new([0xff, 0x17]);
        assert!(all.all_passed());
    }

    #[test]
    fn security_lock_messages() {
        let mut bytes = vec![0u8; 9];
        bytes[1] = 0x04;
        bytes[7] = 0x02;
        let settings = SecuritySettings::new(bytes);
        let locks = settings.active_locks();
        assert!(locks
            .iter()
            .any(|m| m.contains("External digest check")));
        assert!(locks.iter().any(|m| m.contains("User key set 1")));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn hex_is_msb_first() {
        assert_eq!(hex(&[0xcf, 0x11, 0x81, 0x0f]), "0F 81 11 CF");
    }
}
