use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, StoreError};
use crate::node::{DataColumn, Direction, LodNode, CELL_COUNT, GRID_WIDTH};
use crate::pool::{NodePool, PooledNode};
use crate::pos::SectionPos;

/// On-disk format discriminant for [`NodeRecord`]s.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FormatVersion {
    /// Legacy layout without adjacency blobs; upgraded on read.
    V1NoAdjacency = 1,
    /// Current layout.
    V2Latest = 2,
}

impl FormatVersion {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::V1NoAdjacency),
            2 => Ok(Self::V2Latest),
            other => Err(StoreError::Corruption(format!(
                "unknown record format version: {other}"
            ))),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Codec applied to each blob of a [`NodeRecord`].
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompressionMode {
    None = 0,
    Snappy = 1,
}

impl CompressionMode {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::None),
            1 => Ok(Self::Snappy),
            other => Err(StoreError::Corruption(format!(
                "no compression mode with the value {other}"
            ))),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Persisted, compressed form of a [`LodNode`]. The unit of storage I/O.
///
/// The propagation flags are `Option`s: `None` means "leave the stored flag
/// untouched on save", so an ordinary data write cannot accidentally clear a
/// pending propagation marker.
#[derive(Clone)]
pub struct NodeRecord {
    pub pos: SectionPos,
    pub format: FormatVersion,
    pub compression: CompressionMode,
    /// Checksum of the compressed column blob.
    pub data_checksum: u32,
    pub data_blob: Vec<u8>,
    pub gen_step_blob: Vec<u8>,
    pub world_compression_blob: Vec<u8>,
    /// Border strips indexed by [`Direction::index`]; absent on V1 records.
    pub adjacent_blobs: [Option<Vec<u8>>; 4],
    pub apply_to_parent: Option<bool>,
    pub apply_to_children: Option<bool>,
    pub created_unix_ms: u64,
    pub last_modified_unix_ms: u64,
}

impl NodeRecord {
    /// Encodes a node into a current-format record.
    pub fn from_node(node: &LodNode, compression: CompressionMode) -> Result<NodeRecord> {
        Self::build(node, compression, FormatVersion::V2Latest)
    }

    /// Encodes a node into a legacy-format record. Exists for data import
    /// paths and migration fixtures; regular writes always use
    /// [`NodeRecord::from_node`].
    pub fn legacy_from_node(node: &LodNode, compression: CompressionMode) -> Result<NodeRecord> {
        Self::build(node, compression, FormatVersion::V1NoAdjacency)
    }

    fn build(node: &LodNode, compression: CompressionMode, format: FormatVersion) -> Result<NodeRecord> {
        let data_blob = compress(compression, &encode_columns(node.columns())?)?;
        let data_checksum = crc32fast::hash(&data_blob);
        let gen_step_blob = compress(compression, node.generation_steps())?;
        let world_compression_blob = compress(compression, node.compression_modes())?;

        let mut adjacent_blobs = [None, None, None, None];
        if format == FormatVersion::V2Latest {
            for direction in Direction::ALL {
                let strip = node.border_strip(direction);
                adjacent_blobs[direction.index()] =
                    Some(compress(compression, &encode_strip(&strip)?)?);
            }
        }

        let now = unix_time_ms();
        Ok(NodeRecord {
            pos: node.pos(),
            format,
            compression,
            data_checksum,
            data_blob,
            gen_step_blob,
            world_compression_blob,
            adjacent_blobs,
            apply_to_parent: node.apply_to_parent.then_some(true),
            apply_to_children: node.apply_to_children.then_some(true),
            created_unix_ms: now,
            last_modified_unix_ms: now,
        })
    }

    /// Decodes the full grid into a pooled node.
    pub fn to_node(&self, pool: &Arc<NodePool>) -> Result<PooledNode> {
        if crc32fast::hash(&self.data_blob) != self.data_checksum {
            return Err(StoreError::Corruption(format!(
                "column data checksum mismatch for {}",
                self.pos
            )));
        }

        let data = decompress(self.compression, &self.data_blob)?;
        let columns = decode_columns(&data)?;
        let gen_steps = decompress(self.compression, &self.gen_step_blob)?;
        let modes = decompress(self.compression, &self.world_compression_blob)?;
        if gen_steps.len() != CELL_COUNT || modes.len() != CELL_COUNT {
            return Err(StoreError::Corruption(format!(
                "metadata grid truncated for {}",
                self.pos
            )));
        }

        let mut node = pool.acquire(self.pos);
        for (index, column) in columns.into_iter().enumerate() {
            let (x, z) = (index % GRID_WIDTH, index / GRID_WIDTH);
            node.set_column(x, z, column, gen_steps[index], modes[index]);
        }
        Ok(node)
    }

    /// Decodes only the border strip for one direction. Callers must route
    /// V1 records through the full upgrade path instead.
    pub fn to_adjacent_node(&self, direction: Direction, pool: &Arc<NodePool>) -> Result<PooledNode> {
        let blob = self.adjacent_blobs[direction.index()]
            .as_ref()
            .ok_or_else(|| {
                StoreError::Corruption(format!(
                    "record for {} is missing its {direction:?} adjacency blob",
                    self.pos
                ))
            })?;
        let strip = decode_strip(&decompress(self.compression, blob)?)?;

        let mut node = pool.acquire(self.pos);
        node.set_adjacent_strip(direction, strip);
        Ok(node)
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn compress(mode: CompressionMode, data: &[u8]) -> Result<Vec<u8>> {
    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|err| StoreError::Serialization(format!("snappy compression failed: {err}"))),
    }
}

fn decompress(mode: CompressionMode, data: &[u8]) -> Result<Vec<u8>> {
    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|err| StoreError::Corruption(format!("snappy decompression failed: {err}"))),
    }
}

fn encode_columns(columns: &[DataColumn]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(columns.len() * 2);
    for column in columns {
        let count = u16::try_from(column.len()).map_err(|_| {
            StoreError::InvalidArgument(format!(
                "column holds {} points, limit is {}",
                column.len(),
                u16::MAX
            ))
        })?;
        out.extend_from_slice(&count.to_le_bytes());
        for point in column {
            out.extend_from_slice(&point.to_le_bytes());
        }
    }
    Ok(out)
}

fn decode_columns(data: &[u8]) -> Result<Vec<DataColumn>> {
    let mut columns = Vec::with_capacity(CELL_COUNT);
    let mut cursor = 0usize;
    for _ in 0..CELL_COUNT {
        columns.push(read_column(data, &mut cursor)?);
    }
    if cursor != data.len() {
        return Err(StoreError::Corruption(
            "trailing bytes after column data".into(),
        ));
    }
    Ok(columns)
}

fn encode_strip(strip: &[DataColumn]) -> Result<Vec<u8>> {
    encode_columns(strip)
}

fn decode_strip(data: &[u8]) -> Result<Vec<DataColumn>> {
    let mut strip = Vec::with_capacity(GRID_WIDTH);
    let mut cursor = 0usize;
    for _ in 0..GRID_WIDTH {
        strip.push(read_column(data, &mut cursor)?);
    }
    if cursor != data.len() {
        return Err(StoreError::Corruption(
            "trailing bytes after adjacency strip".into(),
        ));
    }
    Ok(strip)
}

fn read_column(data: &[u8], cursor: &mut usize) -> Result<DataColumn> {
    let truncated = || StoreError::Corruption("column data truncated".into());

    let end = cursor.checked_add(2).ok_or_else(truncated)?;
    let header = data.get(*cursor..end).ok_or_else(truncated)?;
    let count = u16::from_le_bytes([header[0], header[1]]) as usize;
    *cursor = end;

    let mut column = DataColumn::with_capacity(count);
    for _ in 0..count {
        let end = cursor.checked_add(8).ok_or_else(truncated)?;
        let bytes = data.get(*cursor..end).ok_or_else(truncated)?;
        column.push(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")));
        *cursor = end;
    }
    Ok(column)
}
