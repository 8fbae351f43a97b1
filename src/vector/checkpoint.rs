//! Durable checkpoints of the vector index.
//!
//! # File Format
//!
//! - Header (16 bytes, little-endian): magic `GVIX`, version, dimension, population
//! - Payload: lz4 block (size-prepended) of a bincode-encoded [`CheckpointPayload`]
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! crash mid-write leaves the previous checkpoint intact. Reads go through a
//! memory map.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use memmap2::MmapOptions;

use crate::types::LocationId;
use crate::vector::types::{PartitionId, VectorDimension, VectorError};

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u32 = 1;

/// Size of the header in bytes.
const HEADER_SIZE: usize = 16;

/// Magic bytes identifying checkpoint files.
const MAGIC_BYTES: &[u8; 4] = b"GVIX";

#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub(crate) struct CheckpointEntry {
    pub id: LocationId,
    pub vector: Vec<f32>,
    pub partition: Option<PartitionId>,
}

#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub(crate) struct CheckpointPayload {
    pub entries: Vec<CheckpointEntry>,
    pub partitioned: bool,
    pub centroids: Vec<Vec<f32>>,
    pub lists: Vec<Vec<LocationId>>,
    pub tombstones: u64,
    pub built_population: u64,
}

/// Header fields of a checkpoint, readable without decoding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub version: u32,
    pub dimension: usize,
    pub population: usize,
}

pub(crate) fn save(
    path: &Path,
    dimension: VectorDimension,
    payload: &CheckpointPayload,
) -> Result<(), VectorError> {
    let encoded = bincode::encode_to_vec(payload, bincode::config::standard())
        .map_err(|e| VectorError::Serialization(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&encoded);

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(MAGIC_BYTES)?;
    file.write_all(&CHECKPOINT_VERSION.to_le_bytes())?;
    file.write_all(&(dimension.get() as u32).to_le_bytes())?;
    file.write_all(&(payload.entries.len() as u32).to_le_bytes())?;
    file.write_all(&compressed)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| VectorError::Storage(e.error))?;
    Ok(())
}

/// Reads only the header of the checkpoint at `path`.
pub fn read_header(path: &Path) -> Result<CheckpointHeader, VectorError> {
    let file = File::open(path)?;
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    parse_header(&mmap)
}

pub(crate) fn load(
    path: &Path,
    expected_dimension: VectorDimension,
) -> Result<CheckpointPayload, VectorError> {
    let file = File::open(path)?;
    let mmap = unsafe { MmapOptions::new().map(&file)? };

    let header = parse_header(&mmap)?;
    if header.dimension != expected_dimension.get() {
        return Err(VectorError::DimensionMismatch {
            expected: expected_dimension.get(),
            actual: header.dimension,
        });
    }

    let decompressed = lz4_flex::decompress_size_prepended(&mmap[HEADER_SIZE..])
        .map_err(|e| VectorError::Serialization(e.to_string()))?;
    let (payload, _): (CheckpointPayload, usize) =
        bincode::decode_from_slice(&decompressed, bincode::config::standard())
            .map_err(|e| VectorError::Serialization(e.to_string()))?;

    if payload.entries.len() != header.population {
        return Err(VectorError::InvalidCheckpoint(format!(
            "header announces {} vectors, payload holds {}",
            header.population,
            payload.entries.len()
        )));
    }
    Ok(payload)
}

fn parse_header(bytes: &[u8]) -> Result<CheckpointHeader, VectorError> {
    if bytes.len() < HEADER_SIZE {
        return Err(VectorError::InvalidCheckpoint(format!(
            "file is {} bytes, shorter than the {HEADER_SIZE}-byte header",
            bytes.len()
        )));
    }
    if &bytes[0..4] != MAGIC_BYTES {
        return Err(VectorError::InvalidCheckpoint("bad magic bytes".to_string()));
    }

    let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let version = word(4);
    if version != CHECKPOINT_VERSION {
        return Err(VectorError::VersionMismatch {
            expected: CHECKPOINT_VERSION,
            actual: version,
        });
    }

    Ok(CheckpointHeader {
        version,
        dimension: word(8) as usize,
        population: word(12) as usize,
    })
}
