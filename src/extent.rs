//! Extent reader (`spec.md` §4.F): resolves a virtual offset within one
//! extent to a physical read, including sparse grain lookups and optional
//! per-grain DEFLATE decompression.
//!
//! The dispatch-by-storage-kind shape mirrors the teacher's
//! `VMDKExtentFile::read_data`; the sparse branch is rebuilt around
//! [`crate::sparse::directory::GrainDirectory`] and
//! [`crate::sparse::cache::GrainCache`] instead of re-decompressing and
//! re-walking the directory inline on every call.

use crate::codec::GrainDecompressor;
use crate::descriptor::{ExtentAccessMode, ExtentKind, ExtentSpec};
use crate::error::Error;
use crate::io::{read_exact_at, ByteStream};
use crate::sparse::cache::GrainCache;
use crate::sparse::directory::GrainDirectory;
use crate::sparse::header::{SparseHeader, SECTOR_SIZE};

const COMPRESSED_GRAIN_MARKER_SIZE: u64 = 12;

/// Runtime companion of an [`ExtentSpec`] (`spec.md` §3 `ExtentState`).
pub struct ExtentState {
    pub spec: ExtentSpec,
    pub virtual_start: u64,
    pub virtual_end: u64,
    stream: Box<dyn ByteStream>,
    sparse: Option<SparseState>,
    physical_bias_bytes: u64,
}

struct SparseState {
    header: SparseHeader,
    directory: GrainDirectory,
}

impl ExtentState {
    /// Builds the runtime state for one extent. For sparse extents this
    /// reads and validates the sparse header and flattens the grain
    /// directory (`spec.md` §4.C, §4.D); for flat extents it only computes
    /// the physical bias.
    pub fn open(
        spec: ExtentSpec,
        virtual_start: u64,
        mut stream: Box<dyn ByteStream>,
    ) -> Result<Self, Error> {
        let physical_bias_bytes = spec.start_offset_sectors * SECTOR_SIZE;
        let virtual_end = virtual_start + spec.nominal_size_bytes();

        let sparse = if spec.storage_kind.is_sparse() {
            let mut header_buf = [0u8; crate::sparse::header::HEADER_SIZE];
            read_exact_at(stream.as_mut(), physical_bias_bytes, &mut header_buf)
                .map_err(Error::from)?;
            let header = SparseHeader::parse(&header_buf)?;
            let expected_bytes =
                header.grain_table_entries as u64 * header.grain_size_bytes() * directory_entries(&header)?;
            if expected_bytes < header.capacity_sectors * SECTOR_SIZE {
                return Err(Error::input(
                    "grain table coverage is smaller than declared capacity",
                ));
            }
            let directory = GrainDirectory::load(stream.as_mut(), &header)?;
            Some(SparseState { header, directory })
        } else {
            None
        };

        Ok(ExtentState {
            spec,
            virtual_start,
            virtual_end,
            stream,
            sparse,
            physical_bias_bytes,
        })
    }

    pub fn is_writable_rejected(&self) -> bool {
        self.spec.access_mode == ExtentAccessMode::NoAccess
    }

    /// Reads up to `buf.len()` bytes, clamped to the remaining bytes in this
    /// extent, starting at `virtual_offset_in_extent`. Returns bytes read.
    pub fn read(
        &mut self,
        virtual_offset_in_extent: u64,
        buf: &mut [u8],
        cache: &mut GrainCache,
        extent_id: u32,
        decompressor: &dyn GrainDecompressor,
    ) -> Result<usize, Error> {
        let remaining = self
            .spec
            .nominal_size_bytes()
            .saturating_sub(virtual_offset_in_extent);
        let len = (buf.len() as u64).min(remaining) as usize;
        if len == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..len];

        match self.spec.storage_kind {
            ExtentKind::Flat | ExtentKind::Vmfs | ExtentKind::VmfsRdm | ExtentKind::VmfsRaw => {
                read_flat(
                    self.stream.as_mut(),
                    self.physical_bias_bytes + virtual_offset_in_extent,
                    buf,
                )
            }
            ExtentKind::Zero => {
                buf.fill(0);
                Ok(buf.len())
            }
            ExtentKind::Sparse | ExtentKind::VmfsSparse => {
                let stream = self.stream.as_mut();
                let sparse = self
                    .sparse
                    .as_mut()
                    .ok_or_else(|| Error::input("missing sparse state for sparse extent"))?;
                read_sparse(
                    stream,
                    sparse,
                    virtual_offset_in_extent,
                    buf,
                    cache,
                    extent_id,
                    decompressor,
                )
            }
        }
    }
}

fn directory_entries(header: &SparseHeader) -> Result<u64, Error> {
    let coverage = header.grain_table_entries as u64 * header.grain_size_bytes();
    if coverage == 0 {
        return Err(Error::input("grain table coverage is zero"));
    }
    let total = header.capacity_sectors * SECTOR_SIZE;
    Ok(total.div_ceil(coverage))
}

fn read_flat(stream: &mut dyn ByteStream, physical_offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
    stream
        .read_at(physical_offset, buf)
        .map_err(Error::from)
}

#[allow(clippy::too_many_arguments)]
fn read_sparse(
    stream: &mut dyn ByteStream,
    sparse: &mut SparseState,
    virtual_offset_in_extent: u64,
    buf: &mut [u8],
    cache: &mut GrainCache,
    extent_id: u32,
    decompressor: &dyn GrainDecompressor,
) -> Result<usize, Error> {
    let grain_bytes = sparse.header.grain_size_bytes();
    let grain_index = virtual_offset_in_extent / grain_bytes;
    let offset_in_grain = virtual_offset_in_extent % grain_bytes;
    let length_this_grain = buf.len().min((grain_bytes - offset_in_grain) as usize);
    let buf = &mut buf[..length_this_grain];

    let Some(sector) = sparse.directory.sector_for_grain(stream, grain_index)? else {
        buf.fill(0);
        return Ok(buf.len());
    };

    let key = (extent_id, grain_index);
    if cache.peek(key).is_none() {
        let grain = load_grain(stream, &sparse.header, sector, grain_bytes, decompressor)?;
        cache.insert(key, grain)?;
    }
    let grain = cache
        .peek(key)
        .ok_or_else(|| Error::runtime(crate::error::RuntimeError::ValueMissing))?;
    if offset_in_grain as usize + buf.len() > grain.len() {
        return Err(Error::input("grain buffer too short for requested range"));
    }
    buf.copy_from_slice(&grain[offset_in_grain as usize..offset_in_grain as usize + buf.len()]);
    Ok(buf.len())
}

fn load_grain(
    stream: &mut dyn ByteStream,
    header: &SparseHeader,
    sector: u64,
    grain_bytes: u64,
    decompressor: &dyn GrainDecompressor,
) -> Result<Vec<u8>, Error> {
    use crate::sparse::header::CompressionAlgorithm;

    let physical_offset = sector * SECTOR_SIZE;
    match header.compression_algorithm {
        CompressionAlgorithm::None => {
            let mut grain = vec![0u8; grain_bytes as usize];
            read_exact_at(stream, physical_offset, &mut grain).map_err(Error::from)?;
            Ok(grain)
        }
        CompressionAlgorithm::Deflate => {
            let mut marker = [0u8; COMPRESSED_GRAIN_MARKER_SIZE as usize];
            read_exact_at(stream, physical_offset, &mut marker).map_err(Error::from)?;
            let compressed_size = u32::from_le_bytes(marker[8..12].try_into().unwrap()) as usize;
            let mut compressed = vec![0u8; compressed_size];
            read_exact_at(stream, physical_offset + COMPRESSED_GRAIN_MARKER_SIZE, &mut compressed)
                .map_err(Error::from)?;
            let mut grain = vec![0u8; grain_bytes as usize];
            let written = decompressor.decompress(&compressed, &mut grain)?;
            if written < grain.len() {
                grain[written..].fill(0);
            }
            Ok(grain)
        }
    }
}
