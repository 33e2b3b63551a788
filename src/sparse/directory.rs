//! Grain directory/table loader (`spec.md` §4.D).
//!
//! The grain directory itself (one physical sector number per grain table)
//! is small and read eagerly, same as the teacher's
//! `VMDKSparseExtentMetadata::read_from_file`. Grain *tables* are the bulk
//! of the metadata, so unlike the teacher (which flattens every table into
//! memory up front) this loads them on demand through a bounded
//! [`GrainTableCache`], matching the "loaded on demand" requirement the
//! teacher's code never implements.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::codec::adler32;
use crate::error::Error;
use crate::io::{read_exact_at, ByteStream};
use crate::sparse::header::{SparseHeader, SECTOR_SIZE};

const DEFAULT_CACHED_GRAIN_TABLES: usize = 16;

/// Grain directory plus an on-demand cache of the grain tables it points at.
///
/// `gd_entries` holds one physical sector number per grain table (0 meaning
/// "not allocated", i.e. every grain it covers reads as zero); the tables
/// themselves are loaded lazily through `table_cache` as `sector_for_grain`
/// is asked about grains that fall in them.
pub struct GrainDirectory {
    grain_table_entries: u32,
    gd_entries: Vec<u32>,
    table_cache: GrainTableCache,
}

impl GrainDirectory {
    /// Loads the grain directory for `header`, optionally cross-verifying
    /// the primary directory (and every grain table it points at) against
    /// the redundant copy when the header advertises both.
    pub fn load(stream: &mut dyn ByteStream, header: &SparseHeader) -> Result<Self, Error> {
        let grain_table_entries = header.grain_table_entries;
        if grain_table_entries == 0 {
            return Err(Error::input("grain table entry count is zero"));
        }

        let gd_entries = read_directory_pointers(stream, header, directory_sector(header, false)?)?;

        if header.has_redundant_grain_directory() {
            let primary_flat = flatten_tables(stream, header, &gd_entries)?;
            let secondary_pointers =
                read_directory_pointers(stream, header, directory_sector(header, true)?)?;
            let secondary_flat = flatten_tables(stream, header, &secondary_pointers)?;
            if primary_flat != secondary_flat {
                return Err(Error::input(format!(
                    "primary and redundant grain directories disagree (checksums {:08x} vs {:08x})",
                    adler32(&u32_slice_to_le_bytes(&primary_flat)),
                    adler32(&u32_slice_to_le_bytes(&secondary_flat)),
                )));
            }
        }

        Ok(GrainDirectory {
            grain_table_entries,
            gd_entries,
            table_cache: GrainTableCache::default(),
        })
    }

    pub fn grain_count(&self) -> usize {
        self.gd_entries.len() * self.grain_table_entries as usize
    }

    /// Looks up the on-disk sector number for `grain_index`, loading (and
    /// caching) the covering grain table on demand. Returns `None` if the
    /// grain's table is unallocated or the grain itself is unallocated
    /// within an allocated table — both read as zero.
    pub fn sector_for_grain(
        &mut self,
        stream: &mut dyn ByteStream,
        grain_index: u64,
    ) -> Result<Option<u64>, Error> {
        let entries_per_table = self.grain_table_entries as u64;
        let directory_index = grain_index / entries_per_table;
        let index_in_table = (grain_index % entries_per_table) as usize;
        let table_sector = *self
            .gd_entries
            .get(directory_index as usize)
            .ok_or_else(|| Error::input(format!("grain index out of range: {}", grain_index)))?;

        if table_sector == 0 {
            return Ok(None);
        }

        let grain_table_entries = self.grain_table_entries;
        let table = self.table_cache.get_or_try_insert(directory_index, || {
            read_grain_table(stream, table_sector as u64, grain_table_entries)
        })?;
        let sector = table[index_in_table];
        Ok(if sector == 0 { None } else { Some(sector as u64) })
    }
}

fn directory_sector(header: &SparseHeader, redundant: bool) -> Result<u64, Error> {
    let raw = if redundant {
        header.secondary_grain_directory_sector as i64
    } else {
        header.grain_directory_sector
    };
    if raw < 0 {
        return Err(Error::input("grain directory sector is unset (-1)"));
    }
    Ok(raw as u64)
}

/// Reads the raw grain-directory sector pointers, one per grain table.
fn read_directory_pointers(
    stream: &mut dyn ByteStream,
    header: &SparseHeader,
    directory_sector: u64,
) -> Result<Vec<u32>, Error> {
    let grain_directory_entry_count = directory_entry_count(header)?;
    let mut raw = vec![0u8; grain_directory_entry_count as usize * 4];
    read_exact_at(stream, directory_sector * SECTOR_SIZE, &mut raw).map_err(Error::from)?;
    Ok(raw
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

/// Reads one grain table (`grain_table_entries` little-endian sector
/// numbers) from `table_sector`.
fn read_grain_table(
    stream: &mut dyn ByteStream,
    table_sector: u64,
    grain_table_entries: u32,
) -> Result<Vec<u32>, Error> {
    let mut raw = vec![0u8; grain_table_entries as usize * 4];
    read_exact_at(stream, table_sector * SECTOR_SIZE, &mut raw).map_err(Error::from)?;
    Ok(raw
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

/// Eagerly reads every grain table a directory points at, used only for the
/// one-time redundant-directory cross-check at load time (the read path
/// proper never materializes more than `table_cache`'s capacity of tables
/// at once). A pointer of 0 means the table was never allocated, so its
/// grains are pushed as zero rather than read from physical offset 0 —
/// otherwise that would land on the sparse header itself.
fn flatten_tables(
    stream: &mut dyn ByteStream,
    header: &SparseHeader,
    pointers: &[u32],
) -> Result<Vec<u32>, Error> {
    let mut flattened = Vec::with_capacity(pointers.len() * header.grain_table_entries as usize);
    for &table_sector in pointers {
        if table_sector == 0 {
            flattened.extend(std::iter::repeat(0u32).take(header.grain_table_entries as usize));
            continue;
        }
        flattened.extend(read_grain_table(
            stream,
            table_sector as u64,
            header.grain_table_entries,
        )?);
    }
    Ok(flattened)
}

fn u32_slice_to_le_bytes(entries: &[u32]) -> Vec<u8> {
    entries.iter().flat_map(|entry| entry.to_le_bytes()).collect()
}

fn directory_entry_count(header: &SparseHeader) -> Result<u64, Error> {
    let grains_per_directory_entry = header.grain_table_entries as u64;
    if grains_per_directory_entry == 0 {
        return Err(Error::input("grain table entry count is zero"));
    }
    let mut count = header.capacity_sectors / (grains_per_directory_entry * header.grain_size_sectors);
    if header.capacity_sectors % (grains_per_directory_entry * header.grain_size_sectors) > 0 {
        count += 1;
    }
    Ok(count)
}

/// Bounded cache of decoded grain tables, keyed by grain-directory index.
/// Capacity defaults to [`DEFAULT_CACHED_GRAIN_TABLES`]; `spec.md` §3/§4.D
/// only require a minimum of 4.
pub struct GrainTableCache {
    cache: LruCache<u64, Vec<u32>>,
}

impl Default for GrainTableCache {
    fn default() -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(DEFAULT_CACHED_GRAIN_TABLES).unwrap()),
        }
    }
}

impl GrainTableCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }

    /// Returns the cached table for `directory_index`, loading it with
    /// `load` (and caching the result) on a miss.
    pub fn get_or_try_insert(
        &mut self,
        directory_index: u64,
        load: impl FnOnce() -> Result<Vec<u32>, Error>,
    ) -> Result<&Vec<u32>, Error> {
        if !self.cache.contains(&directory_index) {
            let table = load()?;
            self.cache.put(directory_index, table);
        }
        Ok(self
            .cache
            .get(&directory_index)
            .expect("just inserted above"))
    }
}
