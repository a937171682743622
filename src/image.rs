//! Programming-image (DAT) access.
//!
//! A DAT file starts with a fixed-layout header carrying the target identity
//! and a lookup table of data blocks. All reads go through a small page cache
//! so the image never has to be resident; the in-memory storage used by the
//! CLI is simply the trivial backend.

use crate::progress::{Operation, Progress};

/// Size of the page cache window in bytes.
pub const PAGE_BUFFER_SIZE: usize = 1024;
/// A page is not refilled while at least this many bytes remain valid past
/// the requested index.
pub const MIN_VALID_BYTES_IN_PAGE: usize = 16;
/// Size of one block lookup-table record.
pub const BYTES_PER_TABLE_RECORD: u64 = 9;

/// Header byte holding the header size (= lookup-table offset).
pub const HEADER_SIZE_OFFSET: u64 = 24;
/// Header bytes holding the total image size.
pub const IMAGE_SIZE_OFFSET: u64 = 25;
/// Family code of the target device.
pub const DEVICE_FAMILY_OFFSET: u64 = 36;
/// Expected 32-bit JTAG IDCODE.
pub const DEVICE_ID_OFFSET: u64 = 37;
/// Mask applied to both expected and actual IDCODE.
pub const DEVICE_ID_MASK_OFFSET: u64 = 41;
/// Silicon signature.
pub const SILSIG_OFFSET: u64 = 45;
/// Image checksum.
pub const CHECKSUM_OFFSET: u64 = 49;
/// Boundary-scan register bit count.
pub const BSR_BIT_COUNT_OFFSET: u64 = 51;
/// Total number of components in the image.
pub const COMPONENT_COUNT_OFFSET: u64 = 53;
/// Number of components in the programming data stream.
pub const DATA_SIZE_OFFSET: u64 = 55;
/// Number of components in the erase data stream.
pub const ERASE_DATA_SIZE_OFFSET: u64 = 57;
/// Number of components verified by the verify flow.
pub const VERIFY_DATA_SIZE_OFFSET: u64 = 59;
/// Number of eNVM components.
pub const ENVM_DATA_SIZE_OFFSET: u64 = 61;
/// Number of eNVM verify components.
pub const ENVM_VERIFY_DATA_SIZE_OFFSET: u64 = 63;
/// UEK1 presence flag.
pub const UEK1_EXISTS_OFFSET: u64 = 65;
/// UEK2 presence flag.
pub const UEK2_EXISTS_OFFSET: u64 = 66;
/// DPK presence flag.
pub const DPK_EXISTS_OFFSET: u64 = 67;
/// UEK3 presence flag.
pub const UEK3_EXISTS_OFFSET: u64 = 68;
/// Device exception code (ES vs. production part).
pub const DEVICE_EXCEPTION_OFFSET: u64 = 69;

/// The accepted header magic words, as little-endian u32.
const MAGIC_WORDS: [u32; 5] = [
    0x6973_6544, // "Desi"
    0x6574_6341, // "Acte"
    0x2d4d_3447, // "G4M-"
    0x3447_5452, // "RTG4"
    0x2d4d_3547, // "G5M-"
];

/// Data blocks addressed through the header lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    /// The header itself (always at offset 0).
    Header,
    /// Boundary-scan register pattern.
    BsrPattern,
    /// Boundary-scan register mask.
    BsrMask,
    /// Packed 22-bit per-component block counts.
    BlockCounts,
    /// User passkey 1.
    Upk1,
    /// User passkey 2.
    Upk2,
    /// Programming data stream.
    DataStream,
    /// Erase data stream.
    EraseDataStream,
    /// Debug passkey.
    Dpk,
}

impl Block {
    /// The block identifier used in the lookup table.
    pub fn id(self) -> u8 {
        match self {
            Block::Header => 0,
            Block::BsrPattern => 3,
            Block::BsrMask => 4,
            Block::BlockCounts => 5,
            Block::Upk1 => 6,
            Block::Upk2 => 7,
            Block::DataStream => 8,
            Block::EraseDataStream => 9,
            Block::Dpk => 13,
        }
    }
}

/// Errors produced by the image layer.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// The computed CRC disagrees with the trailing two bytes.
    #[error("image CRC mismatch: expected {expected:#06x}, computed {actual:#06x}")]
    CrcMismatch {
        /// CRC stored in the image.
        expected: u16,
        /// CRC computed over the image body.
        actual: u16,
    },

    /// The image failed pre-CRC validation (magic word or size).
    #[error("image failed validation: {0}")]
    NotValid(&'static str),

    /// The magic word is not one of the accepted values.
    #[error("not a programming image (unrecognized magic word)")]
    BadMagic,

    /// A required data block is absent from the lookup table.
    #[error("data block {block} is not present in the image")]
    BlockNotFound {
        /// The missing block id.
        block: u8,
    },

    /// A single-window read wanted more bytes than one page can hold.
    #[error("page window too small: requested {requested} bytes, {available} available")]
    PageTooSmall {
        /// Bytes the caller asked for.
        requested: usize,
        /// Bytes the page could provide.
        available: usize,
    },

    /// The backing storage failed.
    #[error("image storage read failed")]
    Storage(#[source] std::io::Error),
}

/// Backing storage for a programming image.
pub trait ImageStorage {
    /// Total size of the stored image in bytes.
    fn len(&self) -> u64;
    /// Read bytes at `offset` into `buf`, returning the count read.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, ImageError>;
}

/// The whole image resident in memory.
pub struct MemoryStorage(Vec<u8>);

impl MemoryStorage {
    /// Wrap an in-memory image.
    pub fn new(data: Vec<u8>) -> Self {
        MemoryStorage(data)
    }
}

impl ImageStorage for MemoryStorage {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, ImageError> {
        let offset = offset as usize;
        let n = buf.len().min(self.0.len().saturating_sub(offset));
        buf[..n].copy_from_slice(&self.0[offset..offset + n]);
        Ok(n)
    }
}

/// Random bit-indexed access to a DAT image through a page cache.
pub struct DatImage {
    storage: Box<dyn ImageStorage>,
    image_size: u64,
    page: [u8; PAGE_BUFFER_SIZE],
    page_start: u64,
    page_end: u64,
    page_valid: bool,
    cached_block: Option<(u8, u64)>,
}

impl DatImage {
    /// Create an image over the given storage. The image size starts as the
    /// raw storage length and is replaced by the header value once
    /// [`Self::validate`] runs.
    pub fn new(storage: Box<dyn ImageStorage>) -> Self {
        let image_size = storage.len();
        DatImage {
            storage,
            image_size,
            page: [0; PAGE_BUFFER_SIZE],
            page_start: 0,
            page_end: 0,
            page_valid: false,
            cached_block: None,
        }
    }

    /// Create an image over an in-memory buffer.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::new(Box::new(MemoryStorage::new(data)))
    }

    /// The current image size in bytes.
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Drop the page cache and block memo. Called at action entry.
    pub fn flush(&mut self) {
        self.page_valid = false;
        self.cached_block = None;
    }

    /// Resolve a block id to its absolute byte offset. `None` means the
    /// block is absent from the lookup table.
    fn block_address(&mut self, id: u8) -> Result<Option<u64>, ImageError> {
        if id == Block::Header.id() {
            return Ok(Some(0));
        }
        if let Some((cached_id, addr)) = self.cached_block {
            if cached_id == id {
                return Ok(Some(addr));
            }
        }
        self.cached_block = None;

        // The lookup table sits at the end of the header; its final byte
        // count precedes it.
        let table = self.get_header_bytes(HEADER_SIZE_OFFSET, 1)? as u64;
        self.image_size = self.get_header_bytes(IMAGE_SIZE_OFFSET, 4)? as u64;
        let num_records = self.get_header_bytes(table - 1, 1)?;
        for record in 0..num_records as u64 {
            let offset = table + BYTES_PER_TABLE_RECORD * record;
            if self.get_header_bytes(offset, 1)? as u8 == id {
                let addr = self.get_header_bytes(offset + 1, 4)? as u64;
                self.cached_block = Some((id, addr));
                return Ok(Some(addr));
            }
        }
        Ok(None)
    }

    /// Position the page over the byte at absolute offset `addr`, returning
    /// the page offset and the valid byte count from there.
    fn element(&mut self, addr: u64) -> Result<(usize, usize), ImageError> {
        let window_ok = self.page_valid
            && addr >= self.page_start
            && addr <= self.page_end
            && addr + MIN_VALID_BYTES_IN_PAGE as u64 <= self.page_end;
        if window_ok {
            return Ok((
                (addr - self.page_start) as usize,
                (self.page_end - addr + 1) as usize,
            ));
        }
        if addr >= self.image_size {
            return Ok((0, 0));
        }
        let want = PAGE_BUFFER_SIZE.min((self.image_size - addr) as usize);
        let got = self.storage.read(addr, &mut self.page[..want])?;
        if got == 0 {
            return Ok((0, 0));
        }
        self.page_start = addr;
        self.page_end = addr + got as u64 - 1;
        self.page_valid = true;
        Ok((0, got))
    }

    /// Borrow up to a page's worth of bytes of `block`, beginning at the
    /// byte containing `bit_index`. A zero count means the block is absent
    /// or the index is past the image.
    pub fn get_data(&mut self, block: Block, bit_index: u64) -> Result<(&[u8], usize), ImageError> {
        let Some(addr) = self.block_address(block.id())? else {
            return Ok((&[], 0));
        };
        let (offset, len) = self.element(addr + bit_index / 8)?;
        Ok((&self.page[offset..offset + len], len))
    }

    /// Compose up to four consecutive bytes of `block` little-endian.
    /// Reads stop early if the block is absent; missing bytes read as zero.
    pub fn get_bytes(&mut self, block: Block, byte_index: u64, count: usize) -> Result<u32, ImageError> {
        debug_assert!(count <= 4);
        let mut value = 0u32;
        let mut shift = 0u32;
        let mut index = byte_index;
        let mut want = count;
        while want > 0 {
            let (slice, available) = self.get_data(block, index * 8)?;
            if available == 0 {
                break;
            }
            let take = available.min(want);
            for &byte in &slice[..take] {
                value |= (byte as u32) << (shift * 8);
                shift += 1;
            }
            index += take as u64;
            want -= take;
        }
        Ok(value)
    }

    /// Compose up to four consecutive header bytes little-endian.
    pub fn get_header_bytes(&mut self, byte_index: u64, count: usize) -> Result<u32, ImageError> {
        self.get_bytes(Block::Header, byte_index, count)
    }

    /// Check the magic word and adopt the image size from the header.
    pub fn validate(&mut self) -> Result<(), ImageError> {
        let magic = self.get_header_bytes(0, 4)?;
        if !MAGIC_WORDS.contains(&magic) {
            return Err(ImageError::BadMagic);
        }
        self.image_size = self.get_header_bytes(IMAGE_SIZE_OFFSET, 4)? as u64;
        Ok(())
    }

    /// Verify the 16-bit CRC over the image body against the trailing two
    /// bytes. The image is streamed through the page cache.
    pub fn check_crc(&mut self, progress: &Progress) -> Result<(), ImageError> {
        let magic = self.get_header_bytes(0, 4)?;
        if !MAGIC_WORDS.contains(&magic) {
            return Err(ImageError::NotValid("unrecognized magic word"));
        }
        self.image_size = self.get_header_bytes(IMAGE_SIZE_OFFSET, 4)? as u64;
        if self.image_size == 0 {
            return Err(ImageError::NotValid("image size is zero"));
        }
        let expected = self.get_header_bytes(self.image_size - 2, 2)? as u16;

        tracing::debug!(expected = format_args!("{expected:#06x}"), "checking image CRC");
        progress.started(Operation::CrcCheck);
        let mut crc = 0u16;
        let body = self.image_size - 2;
        let mut index = 0u64;
        let mut last_percent = 0u8;
        while index < body {
            let (slice, available) = self.get_data(Block::Header, index * 8)?;
            let take = (available as u64).min(body - index);
            for &byte in &slice[..take as usize] {
                crc = crc16_update(crc, byte);
            }
            index += take;
            let percent = (index * 100 / body) as u8;
            if percent != last_percent {
                progress.percent(Operation::CrcCheck, percent);
                last_percent = percent;
            }
        }
        progress.finished(Operation::CrcCheck);

        if crc != expected {
            return Err(ImageError::CrcMismatch {
                expected,
                actual: crc,
            });
        }
        Ok(())
    }

    /// The number of 128-bit blocks in component `component` (1-based),
    /// from the packed 22-bit count table.
    pub fn block_count(&mut self, component: u16) -> Result<u32, ImageError> {
        let bit = (component as u64 - 1) * 22;
        let packed = self.get_bytes(Block::BlockCounts, bit / 8, 4)?;
        Ok((packed >> (bit % 8)) & 0x003f_ffff)
    }

    // Header identity accessors.

    /// Family code of the target device.
    pub fn device_family(&mut self) -> Result<u8, ImageError> {
        Ok(self.get_header_bytes(DEVICE_FAMILY_OFFSET, 1)? as u8)
    }

    /// Expected 32-bit IDCODE.
    pub fn expected_device_id(&mut self) -> Result<u32, ImageError> {
        self.get_header_bytes(DEVICE_ID_OFFSET, 4)
    }

    /// Mask applied to expected and actual IDCODE.
    pub fn device_id_mask(&mut self) -> Result<u32, ImageError> {
        self.get_header_bytes(DEVICE_ID_MASK_OFFSET, 4)
    }

    /// Device exception code.
    pub fn device_exception(&mut self) -> Result<u8, ImageError> {
        Ok(self.get_header_bytes(DEVICE_EXCEPTION_OFFSET, 1)? as u8)
    }

    /// Boundary-scan register bit count.
    pub fn bsr_bit_count(&mut self) -> Result<u32, ImageError> {
        self.get_header_bytes(BSR_BIT_COUNT_OFFSET, 2)
    }

    /// Total number of components.
    pub fn component_count(&mut self) -> Result<u16, ImageError> {
        Ok(self.get_header_bytes(COMPONENT_COUNT_OFFSET, 2)? as u16)
    }

    /// Number of components in the programming data stream.
    pub fn data_size(&mut self) -> Result<u16, ImageError> {
        Ok(self.get_header_bytes(DATA_SIZE_OFFSET, 2)? as u16)
    }

    /// Number of components in the erase data stream.
    pub fn erase_data_size(&mut self) -> Result<u16, ImageError> {
        Ok(self.get_header_bytes(ERASE_DATA_SIZE_OFFSET, 2)? as u16)
    }
}

/// One step of the image CRC: polynomial 0x8408, right-shifting, zero seed.
pub fn crc16_update(mut crc: u16, byte: u8) -> u16 {
    let mut byte = byte;
    for _ in 0..8 {
        let mix = (byte as u16 ^ crc) & 1;
        crc >>= 1;
        if mix != 0 {
            crc ^= 0x8408;
        }
        byte >>= 1;
    }
    crc
}

#[cfg(any(test, feature = "test"))]
pub mod testutil {
    //! Synthetic DAT images for tests.

    use super::crc16_update;

    /// Builds a structurally valid DAT image byte-by-byte.
    pub struct ImageBuilder {
        /// Family code (header byte 36).
        pub family: u8,
        /// Expected IDCODE.
        pub device_id: u32,
        /// IDCODE mask.
        pub id_mask: u32,
        /// Device exception code.
        pub exception: u8,
        /// BSR bit count.
        pub bsr_bits: u16,
        /// Total component count.
        pub components: u16,
        /// Datastream component count.
        pub data_size: u16,
        /// Erase-stream component count.
        pub erase_data_size: u16,
        blocks: Vec<(u8, Vec<u8>)>,
    }

    impl Default for ImageBuilder {
        fn default() -> Self {
            ImageBuilder {
                family: 0x07,
                device_id: 0x0f81_11cf,
                id_mask: 0xffff_ffff,
                exception: 0,
                bsr_bits: 0,
                components: 1,
                data_size: 1,
                erase_data_size: 1,
                blocks: vec![],
            }
        }
    }

    impl ImageBuilder {
        /// Append a data block.
        pub fn block(mut self, id: u8, data: Vec<u8>) -> Self {
            self.blocks.push((id, data));
            self
        }

        /// Append a packed 22-bit block-count table for the given counts.
        pub fn block_counts(self, counts: &[u32]) -> Self {
            let mut bits: Vec<bool> = vec![];
            for &count in counts {
                for bit in 0..22 {
                    bits.push(count & (1 << bit) != 0);
                }
            }
            let mut bytes = vec![0u8; (bits.len() + 7) / 8 + 4];
            for (i, bit) in bits.iter().enumerate() {
                if *bit {
                    bytes[i / 8] |= 1 << (i % 8);
                }
            }
            self.block(super::Block::BlockCounts.id(), bytes)
        }

        /// Serialize the image, appending a valid CRC.
        pub fn build(self) -> Vec<u8> {
            const TABLE_OFFSET: usize = 80;
            let mut header = vec![0u8; TABLE_OFFSET + 9 * self.blocks.len()];
            header[0..4].copy_from_slice(b"G5M-");
            header[24] = TABLE_OFFSET as u8;
            header[36] = self.family;
            header[37..41].copy_from_slice(&self.device_id.to_le_bytes());
            header[41..45].copy_from_slice(&self.id_mask.to_le_bytes());
            header[51..53].copy_from_slice(&self.bsr_bits.to_le_bytes());
            header[53..55].copy_from_slice(&self.components.to_le_bytes());
            header[55..57].copy_from_slice(&self.data_size.to_le_bytes());
            header[57..59].copy_from_slice(&self.erase_data_size.to_le_bytes());
            header[69] = self.exception;
            header[TABLE_OFFSET - 1] = self.blocks.len() as u8;

            let mut offset = header.len() as u32;
            for (i, (id, data)) in self.blocks.iter().enumerate() {
                let record = TABLE_OFFSET + 9 * i;
                header[record] = *id;
                header[record + 1..record + 5].copy_from_slice(&offset.to_le_bytes());
                header[record + 5..record + 9]
                    .copy_from_slice(&(data.len() as u32).to_le_bytes());
                offset += data.len() as u32;
            }

            let mut image = header;
            for (_, data) in &self.blocks {
                image.extend_from_slice(data);
            }

            let total = image.len() as u32 + 2;
            image[25..29].copy_from_slice(&total.to_le_bytes());
            let mut crc = 0u16;
            for &byte in &image {
                crc = crc16_update(crc, byte);
            }
            image.extend_from_slice(&crc.to_le_bytes());
            image
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::ImageBuilder;
    use super::*;

    #[test]
    fn crc16_reference_values() {
        // Poly 0x8408, right-shifting, zero seed: the KERMIT check value.
        let crc = b"123456789"
            .iter()
            .fold(0u16, |crc, &b| crc16_update(crc, b));
        assert_eq!(crc, 0x2189);
    }

    #[test]
    fn valid_image_passes_crc() {
        let data = ImageBuilder::default()
            .block(Block::DataStream.id(), vec![0xaa; 64])
            .build();
        let mut image = DatImage::from_bytes(data);
        image.check_crc(&Progress::none()).unwrap();
    }

    #[test]
    fn any_body_mutation_fails_crc() {
        let mut data = ImageBuilder::default()
            .block(Block::DataStream.id(), vec![0xaa; 64])
            .build();
        let victim = data.len() / 2;
        data[victim] ^= 0x01;
        let mut image = DatImage::from_bytes(data);
        assert!(matches!(
            image.check_crc(&Progress::none()),
            Err(ImageError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let mut data = ImageBuilder::default().build();
        data[0..4].copy_from_slice(b"XXXX");
        let mut image = DatImage::from_bytes(data);
        assert!(matches!(image.validate(), Err(ImageError::BadMagic)));
        let mut image2 = DatImage::from_bytes(vec![0; 64]);
        assert!(matches!(
            image2.check_crc(&Progress::none()),
            Err(ImageError::NotValid(_))
        ));
    }

    #[test]
    fn paging_is_transparent() {
        // A block larger than the page forces multiple refills.
        let payload: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
        let data = ImageBuilder::default()
            .block(Block::DataStream.id(), payload.clone())
            .build();
        let mut image = DatImage::from_bytes(data);
        image.validate().unwrap();

        let mut streamed = vec![];
        for i in 0..payload.len() / 4 {
            let word = image.get_bytes(Block::DataStream, i as u64 * 4, 4).unwrap();
            streamed.extend_from_slice(&word.to_le_bytes());
        }
        assert_eq!(streamed, payload[..streamed.len()]);
    }

    #[test]
    fn page_window_is_not_refilled_while_enough_bytes_remain() {
        let payload: Vec<u8> = vec![0x5a; 2048];
        let data = ImageBuilder::default()
            .block(Block::DataStream.id(), payload)
            .build();
        let mut image = DatImage::from_bytes(data);
        let (_, first) = image.get_data(Block::DataStream, 0).unwrap();
        assert!(first > MIN_VALID_BYTES_IN_PAGE);
        let start = image.page_start;
        // Reads comfortably inside the window must not move it.
        let (_, available) = image.get_data(Block::DataStream, 512 * 8).unwrap();
        assert_eq!(image.page_start, start);
        // A read inside the window but within MIN_VALID_BYTES_IN_PAGE of its
        // end must refill.
        let near_end = 512 + available as u64 - (MIN_VALID_BYTES_IN_PAGE as u64 - 2);
        let _ = image.get_data(Block::DataStream, near_end * 8).unwrap();
        assert_ne!(image.page_start, start);
    }

    #[test]
    fn missing_block_reads_as_absent() {
        let data = ImageBuilder::default()
            .block(Block::DataStream.id(), vec![1, 2, 3, 4])
            .build();
        let mut image = DatImage::from_bytes(data);
        let (_, count) = image.get_data(Block::Dpk, 0).unwrap();
        assert_eq!(count, 0);
        assert_eq!(image.get_bytes(Block::Dpk, 0, 4).unwrap(), 0);
    }

    #[test]
    fn packed_block_counts_unpack() {
        let data = ImageBuilder::default()
            .block_counts(&[3, 0x3f_ffff, 17])
            .build();
        let mut image = DatImage::from_bytes(data);
        assert_eq!(image.block_count(1).unwrap(), 3);
        assert_eq!(image.block_count(2).unwrap(), 0x3f_ffff);
        assert_eq!(image.block_count(3).unwrap(), 17);
    }

    #[test]
    fn header_identity_fields_round_trip() {
        let mut builder = ImageBuilder::default();
        builder.device_id = 0x0f81_1234;
        builder.id_mask = 0x0fff_ffff;
        builder.exception = 13;
        builder.bsr_bits = 1234;
        let mut image = DatImage::from_bytes(builder.build());
        assert_eq!(image.expected_device_id().unwrap(), 0x0f81_1234);
        assert_eq!(image.device_id_mask().unwrap(), 0x0fff_ffff);
        assert_eq!(image.device_exception().unwrap(), 13);
        assert_eq!(image.bsr_bit_count().unwrap(), 1234);
        assert_eq!(image.device_family().unwrap(), 0x07);
    }
}
