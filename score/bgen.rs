// ========================================================================================
//
//                                 THE BGEN READER
//
// ========================================================================================
//
// ### Purpose ###
//
// Random-access reader for BGEN v1.1 / v1.2 files. The side-car index supplies the
// byte offset of each variant block; this module decodes the block into allele
// names and one probability vector per sample.
//
// Supported: layouts 1 and 2; uncompressed, zlib and zstd genotype blocks; any bit
// depth from 1 to 32; phased and unphased data. Phased diploid biallelic samples
// are converted to genotype probabilities so that every scoreable sample reaches
// the kernel in the same (hom-first, het, hom-second) shape.

use crate::error::ScoreError;
use crate::types::GenotypeEvidence;
use flate2::read::ZlibDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const MISSING_PLOIDY_FLAG: u8 = 0x80;
const PLOIDY_MASK: u8 = 0x3F;
const SAMPLE_IDS_FLAG: u32 = 1 << 31;
/// Layout 1 stores each probability as a fixed-point u16 over this denominator.
const LAYOUT1_SCALE: f64 = 32_768.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCompression {
    None,
    Zlib,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgenLayout {
    One,
    Two,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BgenHeader {
    /// Absolute offset of the first variant block.
    pub first_variant_offset: u64,
    pub n_variants: u32,
    pub n_samples: u32,
    pub compression: BlockCompression,
    pub layout: BgenLayout,
    pub sample_ids: Option<Vec<String>>,
}

/// One decoded variant block.
#[derive(Debug, Clone, PartialEq)]
pub struct BgenVariant {
    pub id: String,
    pub rsid: String,
    pub chromosome: String,
    pub position: u32,
    pub alleles: Vec<String>,
    /// One entry per sample. Missing samples carry an empty probability vector.
    pub samples: Vec<GenotypeEvidence>,
}

pub struct BgenReader<R> {
    reader: R,
    path: PathBuf,
    header: BgenHeader,
}

impl BgenReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, ScoreError> {
        let file = File::open(path)
            .map_err(|e| ScoreError::io(format!("opening '{}'", path.display()), e))?;
        Self::from_reader(BufReader::new(file), path.to_path_buf())
    }
}

impl<R: Read + Seek> BgenReader<R> {
    pub fn from_reader(mut reader: R, path: PathBuf) -> Result<Self, ScoreError> {
        let header = read_header(&mut reader, &path)?;
        Ok(Self {
            reader,
            path,
            header,
        })
    }

    pub fn header(&self) -> &BgenHeader {
        &self.header
    }

    pub fn n_samples(&self) -> usize {
        self.header.n_samples as usize
    }

    pub fn sample_ids(&self) -> Option<&[String]> {
        self.header.sample_ids.as_deref()
    }

    /// Decodes the variant block that starts at `offset`.
    pub fn read_at(&mut self, offset: u64) -> Result<BgenVariant, ScoreError> {
        if offset < self.header.first_variant_offset {
            return Err(ScoreError::Bgen {
                path: self.path.clone(),
                details: format!(
                    "variant offset {offset} lies inside the header, which ends at byte {}",
                    self.header.first_variant_offset
                ),
            });
        }
        self.reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_error(offset, e))?;
        self.read_variant()
            .map_err(|e| match e {
                BlockError::Io(io_err) => self.io_error(offset, io_err),
                BlockError::Format(details) => ScoreError::Bgen {
                    path: self.path.clone(),
                    details: format!("variant block at byte {offset}: {details}"),
                },
            })
    }

    fn io_error(&self, offset: u64, e: io::Error) -> ScoreError {
        ScoreError::io(
            format!("reading the variant at byte {offset} of '{}'", self.path.display()),
            e,
        )
    }

    fn read_variant(&mut self) -> Result<BgenVariant, BlockError> {
        let r = &mut self.reader;
        let layout = self.header.layout;

        if layout == BgenLayout::One {
            let n = read_u32(r)?;
            if n != self.header.n_samples {
                return Err(BlockError::Format(format!(
                    "block declares {n} samples but the header declares {}",
                    self.header.n_samples
                )));
            }
        }
        let id = read_string_u16(r)?;
        let rsid = read_string_u16(r)?;
        let chromosome = read_string_u16(r)?;
        let position = read_u32(r)?;
        let n_alleles = match layout {
            BgenLayout::One => 2,
            BgenLayout::Two => read_u16(r)?,
        };
        let mut alleles = Vec::with_capacity(usize::from(n_alleles));
        for _ in 0..n_alleles {
            alleles.push(read_string_u32(r)?);
        }

        let samples = match layout {
            BgenLayout::One => {
                let raw = read_layout1_block(r, self.header.compression, self.header.n_samples)?;
                decode_layout1(&raw, self.header.n_samples as usize)?
            }
            BgenLayout::Two => {
                let raw = read_layout2_block(r, self.header.compression)?;
                decode_layout2(&raw, self.header.n_samples, n_alleles)?
            }
        };

        Ok(BgenVariant {
            id,
            rsid,
            chromosome,
            position,
            alleles,
            samples,
        })
    }
}

/// Internal error for block decoding; the reader adds path and offset.
#[derive(Debug)]
enum BlockError {
    Io(io::Error),
    Format(String),
}

impl From<io::Error> for BlockError {
    fn from(e: io::Error) -> Self {
        BlockError::Io(e)
    }
}

fn format_err<T>(details: impl Into<String>) -> Result<T, BlockError> {
    Err(BlockError::Format(details.into()))
}

// ========================================================================================
//                                   Header parsing
// ========================================================================================

fn read_header<R: Read + Seek>(reader: &mut R, path: &Path) -> Result<BgenHeader, ScoreError> {
    let context = || format!("reading the header of '{}'", path.display());
    let bad = |details: String| ScoreError::Bgen {
        path: path.to_path_buf(),
        details,
    };

    let offset = read_u32(reader).map_err(|e| ScoreError::io(context(), e))?;
    let header_length = read_u32(reader).map_err(|e| ScoreError::io(context(), e))?;
    if header_length < 20 {
        return Err(bad(format!("header length {header_length} is shorter than 20 bytes")));
    }
    if header_length > offset {
        return Err(bad(format!(
            "header length {header_length} exceeds the variant data offset {offset}"
        )));
    }
    let n_variants = read_u32(reader).map_err(|e| ScoreError::io(context(), e))?;
    let n_samples = read_u32(reader).map_err(|e| ScoreError::io(context(), e))?;
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| ScoreError::io(context(), e))?;
    if &magic != b"bgen" && magic != [0u8; 4] {
        return Err(bad(format!("unrecognized magic number {magic:?}")));
    }
    let free_data = u64::from(header_length - 20);
    reader
        .seek(SeekFrom::Current(free_data as i64))
        .map_err(|e| ScoreError::io(context(), e))?;
    let flags = read_u32(reader).map_err(|e| ScoreError::io(context(), e))?;

    let compression = match flags & 0b11 {
        0 => BlockCompression::None,
        1 => BlockCompression::Zlib,
        2 => BlockCompression::Zstd,
        other => return Err(bad(format!("unknown compression code {other}"))),
    };
    let layout = match (flags >> 2) & 0b1111 {
        1 => BgenLayout::One,
        2 => BgenLayout::Two,
        other => return Err(bad(format!("unsupported layout {other}"))),
    };
    if layout == BgenLayout::One && compression == BlockCompression::Zstd {
        return Err(bad("layout 1 does not support zstd compression".to_string()));
    }

    let sample_ids = if flags & SAMPLE_IDS_FLAG != 0 {
        let block_length = read_u32(reader).map_err(|e| ScoreError::io(context(), e))?;
        let n = read_u32(reader).map_err(|e| ScoreError::io(context(), e))?;
        if n != n_samples {
            return Err(bad(format!(
                "sample identifier block lists {n} samples but the header declares {n_samples}"
            )));
        }
        if u64::from(header_length) + u64::from(block_length) > u64::from(offset) {
            return Err(bad("sample identifier block overruns the variant data".to_string()));
        }
        let mut ids = Vec::with_capacity(n as usize);
        for _ in 0..n {
            ids.push(read_string_u16(reader).map_err(|e| ScoreError::io(context(), e))?);
        }
        Some(ids)
    } else {
        None
    };

    Ok(BgenHeader {
        first_variant_offset: u64::from(offset) + 4,
        n_variants,
        n_samples,
        compression,
        layout,
        sample_ids,
    })
}

// ========================================================================================
//                                 Primitive readers
// ========================================================================================

fn read_u16(r: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn bytes_to_string(bytes: Vec<u8>) -> io::Result<String> {
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn read_string_u16(r: &mut impl Read) -> io::Result<String> {
    let len = read_u16(r)?;
    bytes_to_string(read_bytes(r, usize::from(len))?)
}

fn read_string_u32(r: &mut impl Read) -> io::Result<String> {
    let len = read_u32(r)?;
    bytes_to_string(read_bytes(r, len as usize)?)
}

fn decompress(
    compression: BlockCompression,
    compressed: &[u8],
    expected_len: usize,
) -> Result<Vec<u8>, BlockError> {
    let out = match compression {
        BlockCompression::None => compressed.to_vec(),
        BlockCompression::Zlib => {
            let mut out = Vec::with_capacity(expected_len);
            ZlibDecoder::new(compressed).read_to_end(&mut out)?;
            out
        }
        BlockCompression::Zstd => zstd::stream::decode_all(compressed)?,
    };
    if out.len() != expected_len {
        return format_err(format!(
            "genotype block decompressed to {} bytes, expected {expected_len}",
            out.len()
        ));
    }
    Ok(out)
}

// ========================================================================================
//                                 Layout 1 (v1.1)
// ========================================================================================

fn read_layout1_block(
    r: &mut impl Read,
    compression: BlockCompression,
    n_samples: u32,
) -> Result<Vec<u8>, BlockError> {
    let expected = 6 * n_samples as usize;
    match compression {
        BlockCompression::None => Ok(read_bytes(r, expected)?),
        other => {
            let compressed_len = read_u32(r)? as usize;
            let compressed = read_bytes(r, compressed_len)?;
            decompress(other, &compressed, expected)
        }
    }
}

fn decode_layout1(raw: &[u8], n_samples: usize) -> Result<Vec<GenotypeEvidence>, BlockError> {
    if raw.len() != 6 * n_samples {
        return format_err(format!(
            "layout 1 block holds {} bytes for {n_samples} samples",
            raw.len()
        ));
    }
    Ok(raw
        .chunks_exact(6)
        .map(|sample| {
            let p = |i: usize| f64::from(u16::from_le_bytes([sample[i], sample[i + 1]])) / LAYOUT1_SCALE;
            let values = [p(0), p(2), p(4)];
            // All-zero probabilities mark a missing call in this layout.
            let values = if values.iter().all(|&v| v == 0.0) {
                Vec::new()
            } else {
                values.to_vec()
            };
            GenotypeEvidence::Probabilities { ploidy: 2, values }
        })
        .collect())
}

// ========================================================================================
//                                 Layout 2 (v1.2+)
// ========================================================================================

fn read_layout2_block(r: &mut impl Read, compression: BlockCompression) -> Result<Vec<u8>, BlockError> {
    let total_len = read_u32(r)? as usize;
    match compression {
        BlockCompression::None => Ok(read_bytes(r, total_len)?),
        other => {
            if total_len < 4 {
                return format_err(format!("compressed block length {total_len} is too short"));
            }
            let uncompressed_len = read_u32(r)? as usize;
            let compressed = read_bytes(r, total_len - 4)?;
            decompress(other, &compressed, uncompressed_len)
        }
    }
}

/// LSB-first bit stream, as used for layout 2 probabilities.
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn read(&mut self, bits: u8) -> Option<u64> {
        let bits_usize = usize::from(bits);
        if bits == 0 || bits > 32 || self.bit + bits_usize > self.data.len() * 8 {
            return None;
        }
        let start = self.bit / 8;
        let shift = self.bit % 8;
        let mut window = [0u8; 8];
        let end = (start + 8).min(self.data.len());
        window[..end - start].copy_from_slice(&self.data[start..end]);
        let value = (u64::from_le_bytes(window) >> shift) & ((1u64 << bits) - 1);
        self.bit += bits_usize;
        Some(value)
    }
}

fn n_choose_k(n: u64, k: u64) -> u64 {
    let k = k.min(n - k);
    (0..k).fold(1u64, |acc, i| acc * (n - i) / (i + 1))
}

fn decode_layout2(raw: &[u8], n_samples: u32, n_alleles: u16) -> Result<Vec<GenotypeEvidence>, BlockError> {
    let mut cursor = io::Cursor::new(raw);
    let n = read_u32(&mut cursor)?;
    if n != n_samples {
        return format_err(format!(
            "probability block declares {n} samples but the header declares {n_samples}"
        ));
    }
    let k = read_u16(&mut cursor)?;
    if k == 0 || k != n_alleles {
        return format_err(format!(
            "probability block declares {k} alleles but the variant lists {n_alleles}"
        ));
    }
    let mut small = [0u8; 2];
    cursor.read_exact(&mut small)?;
    let (min_ploidy, max_ploidy) = (small[0], small[1]);
    let ploidy_bytes = read_bytes(&mut cursor, n as usize)?;
    let mut tail = [0u8; 2];
    cursor.read_exact(&mut tail)?;
    let phased = match tail[0] {
        0 => false,
        1 => true,
        other => return format_err(format!("phased flag must be 0 or 1, found {other}")),
    };
    let bits = tail[1];
    if bits == 0 || bits > 32 {
        return format_err(format!("bit depth {bits} is outside 1..=32"));
    }
    let header_len = cursor.position() as usize;
    let mut stream = BitReader::new(&raw[header_len..]);
    let scale = ((1u64 << bits) - 1) as f64;
    let k = u64::from(k);

    let mut samples = Vec::with_capacity(n as usize);
    for &ploidy_byte in &ploidy_bytes {
        let missing = ploidy_byte & MISSING_PLOIDY_FLAG != 0;
        let ploidy = ploidy_byte & PLOIDY_MASK;
        if ploidy < min_ploidy || ploidy > max_ploidy {
            return format_err(format!(
                "sample ploidy {ploidy} is outside the declared range {min_ploidy}..={max_ploidy}"
            ));
        }
        let z = u64::from(ploidy);

        let (groups, per_group) = if phased {
            (z, k)
        } else {
            (1, n_choose_k(z + k - 1, k - 1))
        };

        let mut values = Vec::with_capacity((groups * per_group) as usize);
        for _ in 0..groups {
            let mut remaining = 1.0f64;
            for _ in 0..per_group.saturating_sub(1) {
                let Some(stored) = stream.read(bits) else {
                    return format_err("probability data ended early");
                };
                let p = stored as f64 / scale;
                remaining -= p;
                values.push(p);
            }
            values.push(remaining.max(0.0));
        }

        let values = if missing {
            Vec::new()
        } else if phased && ploidy == 2 && k == 2 {
            // Haplotype probabilities of the first allele, one per haplotype.
            let (h1, h2) = (values[0], values[2]);
            vec![
                h1 * h2,
                h1 * (1.0 - h2) + (1.0 - h1) * h2,
                (1.0 - h1) * (1.0 - h2),
            ]
        } else {
            values
        };
        samples.push(GenotypeEvidence::Probabilities { ploidy, values });
    }
    Ok(samples)
}
