//! Supplied codec interface (`spec.md` §1, §4.I): Adler-32 and a
//! zlib/DEFLATE decompressor, kept behind a small trait so tests can swap in
//! a stub without linking `flate2`.

use std::io::Read;

use crate::error::{Error, Result};

const ADLER_MOD: u32 = 65521;

/// Computes the Adler-32 checksum of `data`, as used by zlib framing.
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in data {
        a = (a + byte as u32) % ADLER_MOD;
        b = (b + a) % ADLER_MOD;
    }
    (b << 16) | a
}

/// Decompresses a bounded compressed buffer into a bounded output buffer,
/// returning the number of bytes written. Injected so the extent reader
/// (`spec.md` §4.F) never talks to a concrete decompressor directly.
pub trait GrainDecompressor {
    fn decompress(&self, compressed: &[u8], out: &mut [u8]) -> Result<usize>;
}

/// Default decompressor, backed by `flate2`'s zlib reader — the same crate
/// and API the teacher's `vmdk.rs` uses inline in `read_sparse_extent`.
#[derive(Default)]
pub struct ZlibGrainDecompressor;

impl GrainDecompressor for ZlibGrainDecompressor {
    fn decompress(&self, compressed: &[u8], out: &mut [u8]) -> Result<usize> {
        let mut decoder = flate2::bufread::ZlibDecoder::new(compressed);
        let mut written = 0;
        loop {
            if written == out.len() {
                // Any further bytes mean the grain decompressed to more than
                // its nominal size, which spec.md §4.F treats as fatal.
                let mut probe = [0u8; 1];
                let extra = decoder
                    .read(&mut probe)
                    .map_err(|e| Error::compression(e.to_string()))?;
                if extra > 0 {
                    return Err(Error::compression(
                        "decompressed grain exceeds grain size",
                    ));
                }
                break;
            }
            let n = decoder
                .read(&mut out[written..])
                .map_err(|e| Error::compression(e.to_string()))?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    }
}
