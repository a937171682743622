//! The JTAG-tunneled SPI-NOR flash subsystem.
//!
//! Supports the Cypress S25F family identified by its 3-byte JEDEC id.
//! Addresses go out big-endian in three or four bytes depending on the
//! detected density; commands are the vendor-standard JEDEC set.

mod bridge;

use crate::error::Error;
use crate::image::{Block, DatImage, PAGE_BUFFER_SIZE};
use crate::jtag::{JtagDriver, TapState};
use crate::probe::JtagIo;
use crate::progress::{Operation, Progress};
use crate::Action;

// S25F command set.
const RESET_ENABLE: u8 = 0xf0;
const WRITE_ENABLE: u8 = 0x06;
const READ_STATUS_REGISTER: u8 = 0x05;
const WRITE_STATUS_REGISTER: u8 = 0x01;
const CLEAR_STATUS_REGISTER: u8 = 0x30;
const READ_STATUS_REGISTER2: u8 = 0x07;
const WRITE_BANK_ADDRESS_REGISTER: u8 = 0x17;
const PAGE_PROGRAM: u8 = 0x02;
const SECTOR_ERASE: u8 = 0xd8;
const DIE_ERASE: u8 = 0xc7;
const ENABLE_4BYTE_ADDRESS: u8 = 0xb7;
const READ: u8 = 0x03;
const READ_ID: u8 = 0x9f;

const CYPRESS_VENDOR_ID: u8 = 0x01;
/// 512 Mb sample device; switches to 4-byte addressing through the bank
/// address register rather than EN4B.
const CYPRESS_MEMORY_TYPE1_ID: u8 = 0x02;
/// 128 Mb sample device.
const CYPRESS_MEMORY_TYPE2_ID: u8 = 0x20;
/// 256 Mb sample device; reports program/erase faults in status register 2.
const CYPRESS_MEMORY_TYPE3_ID: u8 = 0x60;

const SR1_ERASE_ERROR: u8 = 0x20;
const SR1_PROGRAM_ERROR: u8 = 0x40;
const SR2_ERASE_ERROR: u8 = 0x40;
const SR2_PROGRAM_ERROR: u8 = 0x20;

/// Busy-wait iteration bound.
pub const TIMEOUT_MAX_VALUE: u32 = 0x0100_0000;

/// SPI address width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// 24-bit addressing.
    ThreeByte,
    /// 32-bit addressing.
    FourByte,
}

impl AddressMode {
    /// Number of address bytes on the wire.
    pub fn len(self) -> usize {
        match self {
            AddressMode::ThreeByte => 3,
            AddressMode::FourByte => 4,
        }
    }
}

/// Geometry of a recognized flash device.
///
/// Addressing matrix: the type-1 (0x02) part enters 4-byte mode by writing
/// 0x80 into the bank address register; types 0x20 and 0x60 use the EN4B
/// command. The type-3 (0x60) part reports program/erase faults in status
/// register 2 instead of status register 1.
#[derive(Debug, Clone, Copy)]
pub struct FlashGeometry {
    /// JEDEC vendor id.
    pub vendor_id: u8,
    /// JEDEC memory type.
    pub memory_type_id: u8,
    /// JEDEC density id.
    pub size_id: u8,
    /// Program page size in bytes.
    pub page_bytes: u64,
    /// Erase sector size in bytes.
    pub sector_bytes: u64,
    /// Total device size in bytes.
    pub total_bytes: u64,
    /// Address width.
    pub addressing: AddressMode,
}

impl FlashGeometry {
    /// Map a JEDEC id triple onto a known geometry.
    pub fn from_jedec_id(id: [u8; 3]) -> Result<Self, Error> {
        let (total_bytes, addressing, page_bytes, sector_bytes) = match id[2] {
            0x18 => (0x0100_0000, AddressMode::ThreeByte, 256, 65536),
            0x19 => (0x0200_0000, AddressMode::FourByte, 256, 65536),
            0x20 => (0x0400_0000, AddressMode::FourByte, 512, 262_144),
            _ => {
                tracing::error!("failed to recognize device density ({:#04x})", id[2]);
                return Err(Error::Idcode {
                    reason: "failed to recognize SPI flash density",
                    unique_exit_code: None,
                });
            }
        };
        Ok(FlashGeometry {
            vendor_id: id[0],
            memory_type_id: id[1],
            size_id: id[2],
            page_bytes,
            sector_bytes,
            total_bytes,
            addressing,
        })
    }
}

/// Encode `address` big-endian in as many bytes as `mode` requires.
pub fn encode_address(address: u64, mode: AddressMode) -> ([u8; 4], usize) {
    let len = mode.len();
    let mut bytes = [0u8; 4];
    for (i, byte) in bytes[..len].iter_mut().enumerate() {
        *byte = (address >> ((len - 1 - i) * 8)) as u8;
    }
    (bytes, len)
}

/// What a completed SPI-flash action hands back.
#[derive(Debug)]
pub enum SpiReport {
    /// Nothing beyond success.
    None,
    /// The JEDEC id triple.
    JedecId([u8; 3]),
    /// Data read from the flash.
    Data(Vec<u8>),
}

/// The SPI-flash action engine.
pub struct SpiFlashEngine<'a, P: JtagIo> {
    jtag: &'a mut JtagDriver<P>,
    image: &'a mut DatImage,
    progress: &'a Progress,
    action: Action,
    target_address: u64,
    geometry: Option<FlashGeometry>,
    bytes_processed: u64,
    timeout_limit: u32,
}

impl<'a, P: JtagIo> SpiFlashEngine<'a, P> {
    /// Create an engine for one SPI-flash action.
    pub fn new(
        jtag: &'a mut JtagDriver<P>,
        image: &'a mut DatImage,
        progress: &'a Progress,
        action: Action,
        target_address: u64,
    ) -> Self {
        SpiFlashEngine {
            jtag,
            image,
            progress,
            action,
            target_address,
            geometry: None,
            bytes_processed: 0,
            timeout_limit: TIMEOUT_MAX_VALUE,
        }
    }

    /// Shrink the busy-wait bound so timeout paths finish quickly in tests.
    #[cfg(any(test, feature = "test"))]
    pub fn set_timeout_limit(&mut self, limit: u32) {
        self.timeout_limit = limit;
    }

    fn geometry(&self) -> FlashGeometry {
        self.geometry.expect("geometry is set after id dispatch")
    }

    /// Identify the flash and run the configured action.
    pub fn run(&mut self) -> Result<SpiReport, Error> {
        self.init_spiprog_port()?;

        let mut id = [0u8; 3];
        self.spi_scan(READ_ID, None, Some(&mut id))?;
        let recognized = id[0] == CYPRESS_VENDOR_ID
            && matches!(
                id[1],
                CYPRESS_MEMORY_TYPE1_ID | CYPRESS_MEMORY_TYPE2_ID | CYPRESS_MEMORY_TYPE3_ID
            );
        if !recognized {
            tracing::error!("SPI flash is not connected or not supported: {id:02x?}");
            return Err(Error::Idcode {
                reason: "SPI flash is not connected or not supported",
                unique_exit_code: None,
            });
        }
        let geometry = FlashGeometry::from_jedec_id(id)?;
        tracing::info!(
            "Cypress S25F device found: id {:02X} {:02X} {:02X}, {} MB",
            id[0],
            id[1],
            id[2],
            geometry.total_bytes / (1024 * 1024)
        );
        self.geometry = Some(geometry);

        if self.action == Action::SpiFlashReadId {
            self.jtag.goto_state(TapState::TestLogicReset, 0)?;
            return Ok(SpiReport::JedecId(id));
        }

        // Common preamble: reset, scrub status, and select the address mode.
        self.spi_scan(RESET_ENABLE, None, None)?;
        self.spi_scan(CLEAR_STATUS_REGISTER, None, None)?;
        self.write_status_register(0x00)?;
        if geometry.addressing == AddressMode::FourByte {
            tracing::info!("setting 4-byte address mode");
            if geometry.memory_type_id == CYPRESS_MEMORY_TYPE1_ID {
                self.write_bank_address_register(0x80)?;
            } else {
                self.spi_scan(ENABLE_4BYTE_ADDRESS, None, None)?;
            }
        }

        let result = match self.action {
            Action::SpiFlashRead => self.read_action().map(SpiReport::Data),
            Action::SpiFlashErase => self.die_erase().map(|()| SpiReport::None),
            Action::SpiFlashEraseImage => self.erase_image_action().map(|()| SpiReport::None),
            Action::SpiFlashProgram => self.program_action().map(|()| SpiReport::None),
            Action::SpiFlashVerify => self.verify_action().map(|()| SpiReport::None),
            Action::SpiFlashBlankCheck => self.blank_check_action().map(|()| SpiReport::None),
            _ => unreachable!("dispatched as a SPI-flash action"),
        };
        // Walking back to Test-Logic-Reset traverses Update-DR, committing
        // the final bridge register write.
        let reset = self.jtag.goto_state(TapState::TestLogicReset, 0);
        let report = result?;
        reset?;
        Ok(report)
    }

    // Register helpers.

    fn read_status_register(&mut self) -> Result<u8, Error> {
        let mut status = [0u8; 1];
        self.spi_scan(READ_STATUS_REGISTER, None, Some(&mut status))?;
        Ok(status[0])
    }

    fn read_status_register2(&mut self) -> Result<u8, Error> {
        let mut status = [0u8; 1];
        self.spi_scan(READ_STATUS_REGISTER2, None, Some(&mut status))?;
        Ok(status[0])
    }

    fn write_status_register(&mut self, value: u8) -> Result<(), Error> {
        self.spi_scan(WRITE_ENABLE, None, None)?;
        self.spi_scan(WRITE_STATUS_REGISTER, Some(&[value]), None)?;
        self.busy_wait().map(|_| ())
    }

    fn write_bank_address_register(&mut self, value: u8) -> Result<(), Error> {
        self.spi_scan(WRITE_ENABLE, None, None)?;
        self.spi_scan(WRITE_BANK_ADDRESS_REGISTER, Some(&[value]), None)?;
        self.busy_wait().map(|_| ())
    }

    /// Poll status register 1 until the write-in-progress bit clears.
    fn busy_wait(&mut self) -> Result<u8, Error> {
        let mut timeout = 0u32;
        loop {
            let status = self.read_status_register()?;
            if status & 0x01 == 0 {
                return Ok(status);
            }
            timeout += 1;
            if timeout > self.timeout_limit {
                tracing::error!("timeout polling the SPI flash status register");
                return Err(Error::SpiFlashTimeout);
            }
        }
    }

    /// The program/erase fault bit lives in SR2 on the type-3 part.
    fn operation_failed(&mut self, status: u8, erase: bool) -> Result<bool, Error> {
        if self.geometry().memory_type_id == CYPRESS_MEMORY_TYPE3_ID {
            let status2 = self.read_status_register2()?;
            let bit = if erase { SR2_ERASE_ERROR } else { SR2_PROGRAM_ERROR };
            Ok(status2 & bit != 0)
        } else {
            let bit = if erase { SR1_ERASE_ERROR } else { SR1_PROGRAM_ERROR };
            Ok(status & bit != 0)
        }
    }

    fn check_image_fits(&self) -> Result<(), Error> {
        let image_size = self.image.image_size();
        let device_size = self.geometry().total_bytes;
        if self.target_address + image_size > device_size {
            tracing::error!("image does not fit the available memory space");
            return Err(Error::ImageSize {
                target: self.target_address,
                image_size,
                device_size,
            });
        }
        Ok(())
    }

    // Actions.

    /// Read `image_size` bytes starting at offset zero.
    fn read_action(&mut self) -> Result<Vec<u8>, Error> {
        tracing::info!("performing SPI flash read");
        let total = self.image.image_size();
        let mut data = Vec::with_capacity(total as usize);
        self.progress.started(Operation::SpiRead);
        let mut last_percent = 0u8;
        while (data.len() as u64) < total {
            let chunk = (total - data.len() as u64).min(PAGE_BUFFER_SIZE as u64);
            self.read_memory(data.len() as u64, chunk, &mut data)?;
            let percent = (data.len() as u64 * 100 / total) as u8;
            if percent != last_percent {
                self.progress.percent(Operation::SpiRead, percent);
                last_percent = percent;
            }
        }
        self.progress.finished(Operation::SpiRead);
        Ok(data)
    }

    fn read_memory(&mut self, start: u64, count: u64, into: &mut Vec<u8>) -> Result<(), Error> {
        let (addr, len) = encode_address(start, self.geometry().addressing);
        self.enable_cs()?;
        self.shift_byte_in(READ)?;
        for &byte in &addr[..len] {
            self.shift_byte_in(byte)?;
        }
        self.shift_dummy_bit()?;
        for _ in 0..count {
            into.push(self.shift_byte_out()?);
        }
        self.disable_cs()
    }

    /// Erase the whole die.
    fn die_erase(&mut self) -> Result<(), Error> {
        tracing::info!("performing SPI flash die erase, please wait...");
        self.spi_scan(WRITE_ENABLE, None, None)?;
        self.spi_scan(DIE_ERASE, None, None)?;
        let status = self.busy_wait()?;
        if self.operation_failed(status, true)? {
            tracing::error!("failed to erase SPI flash");
            return Err(Error::SpiFlashErase);
        }
        Ok(())
    }

    fn sector_erase(&mut self, address: u64) -> Result<(), Error> {
        let (addr, len) = encode_address(address, self.geometry().addressing);
        self.enable_cs()?;
        self.shift_byte_in(WRITE_ENABLE)?;
        self.disable_cs()?;
        self.spi_scan(SECTOR_ERASE, Some(&addr[..len]), None)?;
        let status = self.busy_wait()?;
        if self.operation_failed(status, true)? {
            tracing::error!("failed to erase SPI flash sector at {address:#x}");
            return Err(Error::SpiFlashErase);
        }
        Ok(())
    }

    fn erase_image_action(&mut self) -> Result<(), Error> {
        tracing::info!("performing SPI flash image erase");
        self.bytes_processed = 0;
        self.check_image_fits()?;
        self.erase_image_span()
    }

    /// Erase every sector covering `[target, target + image_size)`.
    fn erase_image_span(&mut self) -> Result<(), Error> {
        let geometry = self.geometry();
        let image_size = self.image.image_size();
        tracing::info!(
            "erasing SPI flash region {:#x}..{:#x}",
            self.target_address,
            self.target_address + image_size
        );
        if self.target_address % geometry.sector_bytes != 0 {
            tracing::warn!(
                "target address is not sector aligned; whole sectors will be erased"
            );
        }
        let mut sectors = (self.target_address % geometry.sector_bytes + image_size
            + geometry.sector_bytes
            - 1)
            / geometry.sector_bytes;
        let mut address = self.target_address;
        self.progress.started(Operation::SpiErase);
        while sectors > 0 {
            self.sector_erase(address)?;
            address += geometry.sector_bytes;
            sectors -= 1;
        }
        self.progress.finished(Operation::SpiErase);
        Ok(())
    }

    fn program_action(&mut self) -> Result<(), Error> {
        tracing::info!("performing SPI flash program");
        self.check_image_fits()?;
        self.erase_image_span()?;
        self.bytes_processed = 0;

        let image_size = self.image.image_size();
        self.progress.started(Operation::SpiProgram);
        let mut index: u64 = 0;
        while index < image_size {
            let (slice, available) = self.image.get_data(Block::Header, index * 8)?;
            let count = (available as u64).min(image_size - index);
            let chunk = slice[..count as usize].to_vec();
            self.program_memory(self.target_address + index, &chunk)?;
            index += count;
        }
        self.progress.finished(Operation::SpiProgram);
        Ok(())
    }

    /// Program `data` starting at `start`, slicing on page boundaries. The
    /// first write is shortened to reach page alignment.
    fn program_memory(&mut self, start: u64, data: &[u8]) -> Result<(), Error> {
        let geometry = self.geometry();
        let image_size = self.image.image_size();
        let mut remaining = data.len() as u64;
        let mut address = start;
        let mut offset: usize = 0;
        let mut page_bytes = (geometry.page_bytes - address % geometry.page_bytes).min(remaining);
        let mut last_percent = (self.bytes_processed * 100 / image_size) as u8;
        while remaining > 0 {
            self.spi_scan(WRITE_ENABLE, None, None)?;
            self.enable_cs()?;
            self.shift_byte_in(PAGE_PROGRAM)?;
            let (addr, len) = encode_address(address, geometry.addressing);
            for &byte in &addr[..len] {
                self.shift_byte_in(byte)?;
            }
            for &byte in &data[offset..offset + page_bytes as usize] {
                self.shift_byte_in(byte)?;
            }
            self.disable_cs()?;
            let status = self.busy_wait()?;
            if self.operation_failed(status, false)? {
                tracing::error!("failed to program SPI flash at {address:#x}");
                return Err(Error::SpiFlashProgram);
            }

            remaining -= page_bytes;
            address += page_bytes;
            offset += page_bytes as usize;
            self.bytes_processed += page_bytes;
            let percent = (self.bytes_processed * 100 / image_size) as u8;
            if percent != last_percent {
                self.progress.percent(Operation::SpiProgram, percent);
                last_percent = percent;
            }
            page_bytes = remaining.min(geometry.page_bytes);
        }
        Ok(())
    }

    fn verify_action(&mut self) -> Result<(), Error> {
        tracing::info!("performing SPI flash verify");
        self.bytes_processed = 0;
        let image_size = self.image.image_size();
        tracing::info!(
            "verifying image against {:#x}..{:#x}",
            self.target_address,
            self.target_address + image_size
        );
        self.progress.started(Operation::SpiVerify);
        let mut index: u64 = 0;
        while index < image_size {
            let (slice, available) = self.image.get_data(Block::Header, index * 8)?;
            let count = (available as u64).min(image_size - index);
            let chunk = slice[..count as usize].to_vec();
            self.verify_memory(self.target_address + index, &chunk)?;
            index += count;
        }
        self.progress.finished(Operation::SpiVerify);
        Ok(())
    }

    fn verify_memory(&mut self, start: u64, data: &[u8]) -> Result<(), Error> {
        let image_size = self.image.image_size();
        let (addr, len) = encode_address(start, self.geometry().addressing);
        self.enable_cs()?;
        self.shift_byte_in(READ)?;
        for &byte in &addr[..len] {
            self.shift_byte_in(byte)?;
        }
        self.shift_dummy_bit()?;
        let mut last_percent = (self.bytes_processed * 100 / image_size) as u8;
        for (index, &expected) in data.iter().enumerate() {
            let actual = self.shift_byte_out()?;
            if actual != expected {
                self.disable_cs()?;
                tracing::error!(
                    "SPI flash verify failed at {:#x}: expected {expected:#04x}, read {actual:#04x}",
                    start + index as u64
                );
                return Err(Error::SpiFlashVerify {
                    address: start + index as u64,
                    expected,
                    actual,
                });
            }
            self.bytes_processed += 1;
            let percent = (self.bytes_processed * 100 / image_size) as u8;
            if percent != last_percent {
                self.progress.percent(Operation::SpiVerify, percent);
                last_percent = percent;
            }
        }
        self.disable_cs()
    }

    /// One long read over the whole device checking for unerased bytes.
    fn blank_check_action(&mut self) -> Result<(), Error> {
        tracing::info!("performing SPI flash blank check");
        self.bytes_processed = 0;
        let total = self.geometry().total_bytes;
        let (addr, len) = encode_address(0, self.geometry().addressing);
        self.enable_cs()?;
        self.shift_byte_in(READ)?;
        for &byte in &addr[..len] {
            self.shift_byte_in(byte)?;
        }
        self.shift_dummy_bit()?;
        self.progress.started(Operation::SpiBlankCheck);
        let mut last_percent = 0u8;
        for index in 0..total {
            let value = self.shift_byte_out()?;
            if value != 0xff {
                self.disable_cs()?;
                tracing::error!("SPI flash is not blank at {index:#x}: read {value:#04x}");
                return Err(Error::SpiFlashBlankCheck {
                    address: index,
                    value,
                });
            }
            self.bytes_processed += 1;
            let percent = (self.bytes_processed * 100 / total) as u8;
            if percent != last_percent {
                self.progress.percent(Operation::SpiBlankCheck, percent);
                last_percent = percent;
            }
        }
        self.progress.finished(Operation::SpiBlankCheck);
        self.disable_cs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_encoding_is_big_endian() {
        let (bytes, len) = encode_address(0x0012_3456, AddressMode::ThreeByte);
        assert_eq!(&bytes[..len], &[0x12, 0x34, 0x56]);
        let (bytes, len) = encode_address(0x0102_0304, AddressMode::FourByte);
        assert_eq!(&bytes[..len], &[0x01, 0x02, 0x03, 0x04]);
        // Every byte of the address participates, most significant first.
        for mode in [AddressMode::ThreeByte, AddressMode::FourByte] {
            let addr = 0x00ab_cdefu64;
            let (bytes, len) = encode_address(addr, mode);
            for (i, &byte) in bytes[..len].iter().enumerate() {
                assert_eq!(byte, (addr >> ((len - 1 - i) * 8)) as u8);
            }
        }
    }

    #[test]
    fn geometry_dispatch() {
        let geometry = FlashGeometry::from_jedec_id([0x01, 0x20, 0x18]).unwrap();
        assert_eq!(geometry.addressing, AddressMode::ThreeByte);
        assert_eq!(geometry.page_bytes, 256);
        assert_eq!(geometry.sector_bytes, 65536);
        assert_eq!(geometry.total_bytes, 0x0100_0000);

        let geometry = FlashGeometry::from_jedec_id([0x01, 0x60, 0x19]).unwrap();
        assert_eq!(geometry.addressing, AddressMode::FourByte);
        assert_eq!(geometry.total_bytes, 0x0200_0000);

        let geometry = FlashGeometry::from_jedec_id([0x01, 0x02, 0x20]).unwrap();
        assert_eq!(geometry.page_bytes, 512);
        assert_eq!(geometry.sector_bytes, 262_144);

        assert!(FlashGeometry::from_jedec_id([0x01, 0x02, 0x99]).is_err());
    }
}
