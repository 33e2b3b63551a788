//! Sparse extent file header (`spec.md` §4.C, §6): the 512-byte `KDMV`
//! header that precedes every sparse/VMFS-sparse extent's grain data.
//!
//! Field decoding is ported from the teacher's
//! `VMDKSparseFileHeader::parse_sparse_header`; the line-ending marker
//! validation at offsets 76-80 (present in the on-disk format but not
//! checked by the teacher) is added here.

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const SECTOR_SIZE: u64 = 512;
pub const HEADER_SIZE: usize = 512;
const MAGIC: &[u8; 4] = b"KDMV";

pub const FLAG_VALID_NEWLINE_DETECTION_TEST: u32 = 0x0000_0001;
pub const FLAG_USE_SECONDARY_GRAIN_DIRECTORY: u32 = 0x0000_0002;
pub const FLAG_USE_ZEROED_GRAIN_TABLE: u32 = 0x0000_0004;
pub const FLAG_HAS_COMPRESSED_GRAIN_DATA: u32 = 0x0001_0000;
pub const FLAG_HAS_METADATA: u32 = 0x0002_0000;

/// Per-grain compression algorithm (`spec.md` §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Deflate,
}

/// Decoded 512-byte sparse header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseHeader {
    pub version: u32,
    pub flags: u32,
    pub capacity_sectors: u64,
    pub grain_size_sectors: u64,
    pub embedded_descriptor_sector: u64,
    pub embedded_descriptor_sectors_count: u64,
    pub grain_table_entries: u32,
    pub secondary_grain_directory_sector: u64,
    pub grain_directory_sector: i64,
    pub overhead_sectors: u64,
    pub is_dirty: bool,
    pub compression_algorithm: CompressionAlgorithm,
}

impl SparseHeader {
    pub fn has_redundant_grain_directory(&self) -> bool {
        self.flags & FLAG_USE_SECONDARY_GRAIN_DIRECTORY == FLAG_USE_SECONDARY_GRAIN_DIRECTORY
    }

    pub fn has_compressed_grains(&self) -> bool {
        self.flags & FLAG_HAS_COMPRESSED_GRAIN_DATA == FLAG_HAS_COMPRESSED_GRAIN_DATA
    }

    pub fn has_embedded_descriptor(&self) -> bool {
        self.embedded_descriptor_sector != 0 && self.embedded_descriptor_sectors_count != 0
    }

    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size_sectors * SECTOR_SIZE
    }

    /// Parses a 512-byte sparse header buffer, per the layout in `spec.md` §6.
    ///
    /// Validates the magic number, the compression algorithm code, and (when
    /// the newline-detection-test flag is set) the five line-ending marker
    /// bytes at offsets 76-80, which exist to detect file transfers that
    /// mangled line endings.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < HEADER_SIZE {
            return Err(Error::input("sparse header data too short"));
        }
        if &data[0..4] != MAGIC {
            return Err(Error::input("invalid sparse header magic number"));
        }

        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version == 0 || version > 3 {
            return Err(Error::input(format!("unsupported sparse header version: {}", version)));
        }
        let flags = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let capacity_sectors = u64::from_le_bytes(data[12..20].try_into().unwrap());
        let grain_size_sectors = u64::from_le_bytes(data[20..28].try_into().unwrap());
        let embedded_descriptor_sector = u64::from_le_bytes(data[28..36].try_into().unwrap());
        let embedded_descriptor_sectors_count = u64::from_le_bytes(data[36..44].try_into().unwrap());
        let grain_table_entries = u32::from_le_bytes(data[44..48].try_into().unwrap());
        let secondary_grain_directory_sector = u64::from_le_bytes(data[48..56].try_into().unwrap());
        let grain_directory_sector = i64::from_le_bytes(data[56..64].try_into().unwrap());
        let overhead_sectors = u64::from_le_bytes(data[64..72].try_into().unwrap());
        let is_dirty = data[72] & 0x01 == 1;

        if flags & FLAG_VALID_NEWLINE_DETECTION_TEST == FLAG_VALID_NEWLINE_DETECTION_TEST {
            validate_line_ending_markers(&data[76..81])?;
        }

        let compression_algorithm = match u16::from_le_bytes(data[81..83].try_into().unwrap()) {
            0 => CompressionAlgorithm::None,
            1 => CompressionAlgorithm::Deflate,
            other => {
                return Err(Error::input(format!(
                    "unsupported compression algorithm code: {}",
                    other
                )))
            }
        };

        if grain_size_sectors == 0 || !grain_size_sectors.is_power_of_two() {
            return Err(Error::input(
                "grain size must be a non-zero power of two sectors",
            ));
        }

        if grain_table_entries != 512 {
            return Err(Error::input(format!(
                "unsupported grain table entry count: {}",
                grain_table_entries
            )));
        }

        Ok(SparseHeader {
            version,
            flags,
            capacity_sectors,
            grain_size_sectors,
            embedded_descriptor_sector,
            embedded_descriptor_sectors_count,
            grain_table_entries,
            secondary_grain_directory_sector,
            grain_directory_sector,
            overhead_sectors,
            is_dirty,
            compression_algorithm,
        })
    }
}

/// Checks the five marker bytes (`single_end_line_char`, `non_end_line_chars`,
/// `double_end_line_char_1`, `double_end_line_char_2`) at offsets 76-80 that
/// detect an FTP/text-mode transfer which rewrote line endings and corrupted
/// the file.
fn validate_line_ending_markers(markers: &[u8]) -> Result<(), Error> {
    const EXPECTED: [u8; 5] = [0x0a, 0x20, 0x0d, 0x0d, 0x0a];
    if markers != EXPECTED {
        return Err(Error::input(
            "sparse header line-ending markers indicate a corrupted transfer",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(compression: u16, flags: u32, line_endings: [u8; 5]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(b"KDMV");
        buf[4..8].copy_from_slice(&1u32.to_le_bytes()); // version
        buf[8..12].copy_from_slice(&flags.to_le_bytes());
        buf[12..20].copy_from_slice(&2048u64.to_le_bytes()); // capacity
        buf[20..28].copy_from_slice(&128u64.to_le_bytes()); // grain size
        buf[28..36].copy_from_slice(&0u64.to_le_bytes());
        buf[36..44].copy_from_slice(&0u64.to_le_bytes());
        buf[44..48].copy_from_slice(&512u32.to_le_bytes());
        buf[48..56].copy_from_slice(&0u64.to_le_bytes());
        buf[56..64].copy_from_slice(&1i64.to_le_bytes());
        buf[64..72].copy_from_slice(&1u64.to_le_bytes());
        buf[72] = 0;
        buf[76..81].copy_from_slice(&line_endings);
        buf[81..83].copy_from_slice(&compression.to_le_bytes());
        buf
    }

    const VALID_LINE_ENDINGS: [u8; 5] = [0x0a, 0x20, 0x0d, 0x0d, 0x0a];

    #[test]
    fn parses_a_valid_header() {
        let data = header_bytes(0, 0, VALID_LINE_ENDINGS);
        let header = SparseHeader::parse(&data).unwrap();
        assert_eq!(header.capacity_sectors, 2048);
        assert_eq!(header.grain_size_sectors, 128);
        assert_eq!(header.compression_algorithm, CompressionAlgorithm::None);
        assert!(!header.is_dirty);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = header_bytes(0, 0, VALID_LINE_ENDINGS);
        data[0] = b'X';
        assert!(SparseHeader::parse(&data).is_err());
    }

    #[test]
    fn rejects_unsupported_compression_code() {
        let data = header_bytes(7, 0, VALID_LINE_ENDINGS);
        assert!(SparseHeader::parse(&data).is_err());
    }

    #[test]
    fn rejects_bad_line_ending_markers_when_flagged() {
        let data = header_bytes(0, FLAG_VALID_NEWLINE_DETECTION_TEST, [0, 0, 0, 0, 0]);
        assert!(SparseHeader::parse(&data).is_err());
    }

    #[test]
    fn ignores_line_ending_markers_when_not_flagged() {
        let data = header_bytes(0, 0, [0, 0, 0, 0, 0]);
        assert!(SparseHeader::parse(&data).is_ok());
    }

    #[test]
    fn rejects_non_standard_grain_table_entry_count() {
        let mut data = header_bytes(0, 0, VALID_LINE_ENDINGS);
        data[44..48].copy_from_slice(&256u32.to_le_bytes());
        assert!(SparseHeader::parse(&data).is_err());
    }

    #[test]
    fn reports_compressed_and_redundant_directory_flags() {
        let data = header_bytes(
            1,
            FLAG_HAS_COMPRESSED_GRAIN_DATA | FLAG_USE_SECONDARY_GRAIN_DIRECTORY,
            VALID_LINE_ENDINGS,
        );
        let header = SparseHeader::parse(&data).unwrap();
        assert!(header.has_compressed_grains());
        assert!(header.has_redundant_grain_directory());
    }
}
