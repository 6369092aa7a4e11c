use smallvec::SmallVec;

use crate::pos::SectionPos;

/// Width of a node's column grid along each horizontal axis.
pub const GRID_WIDTH: usize = 64;
/// Number of columns held by one node.
pub const CELL_COUNT: usize = GRID_WIDTH * GRID_WIDTH;

/// One vertical column of opaque data points, ordered bottom to top.
pub type DataColumn = SmallVec<[u64; 4]>;

/// Compass-cardinal directions used for adjacency strips.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];

    pub fn index(self) -> usize {
        match self {
            Direction::North => 0,
            Direction::South => 1,
            Direction::East => 2,
            Direction::West => 3,
        }
    }
}

/// In-memory unit of LOD data for one [`SectionPos`].
///
/// Holds a fixed-size grid of columns plus per-cell generation-step and
/// world-compression-mode bytes, transient propagation flags, and optionally
/// a cached border strip per cardinal neighbor (used by partial reads).
/// Nodes are created empty and mutated only through [`LodNode::merge_from`].
pub struct LodNode {
    pos: SectionPos,
    columns: Vec<DataColumn>,
    generation_steps: Vec<u8>,
    compression_modes: Vec<u8>,
    /// This node holds changes its parent has not absorbed yet.
    pub apply_to_parent: bool,
    /// This node holds changes its children have not absorbed yet.
    pub apply_to_children: bool,
    adjacent: [Option<Vec<DataColumn>>; 4],
}

impl LodNode {
    /// Creates an empty node for the given position.
    pub fn empty(pos: SectionPos) -> Self {
        Self {
            pos,
            columns: vec![DataColumn::new(); CELL_COUNT],
            generation_steps: vec![0; CELL_COUNT],
            compression_modes: vec![0; CELL_COUNT],
            apply_to_parent: false,
            apply_to_children: false,
            adjacent: [None, None, None, None],
        }
    }

    pub fn pos(&self) -> SectionPos {
        self.pos
    }

    pub fn column(&self, x: usize, z: usize) -> &DataColumn {
        &self.columns[cell_index(x, z)]
    }

    /// Replaces one column and its metadata bytes.
    pub fn set_column(&mut self, x: usize, z: usize, column: DataColumn, gen_step: u8, mode: u8) {
        let index = cell_index(x, z);
        self.columns[index] = column;
        self.generation_steps[index] = gen_step;
        self.compression_modes[index] = mode;
    }

    pub fn generation_step(&self, x: usize, z: usize) -> u8 {
        self.generation_steps[cell_index(x, z)]
    }

    pub fn world_compression_mode(&self, x: usize, z: usize) -> u8 {
        self.compression_modes[cell_index(x, z)]
    }

    /// True when no column carries any data points.
    pub fn is_empty(&self) -> bool {
        self.columns.iter().all(|column| column.is_empty())
            && self.adjacent.iter().all(Option::is_none)
    }

    pub(crate) fn columns(&self) -> &[DataColumn] {
        &self.columns
    }

    pub(crate) fn generation_steps(&self) -> &[u8] {
        &self.generation_steps
    }

    pub(crate) fn compression_modes(&self) -> &[u8] {
        &self.compression_modes
    }

    /// Cached border columns for one neighbor direction, if present.
    pub fn adjacent_strip(&self, direction: Direction) -> Option<&[DataColumn]> {
        self.adjacent[direction.index()].as_deref()
    }

    pub(crate) fn set_adjacent_strip(&mut self, direction: Direction, strip: Vec<DataColumn>) {
        self.adjacent[direction.index()] = Some(strip);
    }

    /// Copies this node's border columns for the given direction.
    ///
    /// North/south strips run along x at the minimum/maximum z row; east/west
    /// strips run along z at the maximum/minimum x column.
    pub fn border_strip(&self, direction: Direction) -> Vec<DataColumn> {
        let mut strip = Vec::with_capacity(GRID_WIDTH);
        for i in 0..GRID_WIDTH {
            let (x, z) = match direction {
                Direction::North => (i, 0),
                Direction::South => (i, GRID_WIDTH - 1),
                Direction::West => (0, i),
                Direction::East => (GRID_WIDTH - 1, i),
            };
            strip.push(self.columns[cell_index(x, z)].clone());
        }
        strip
    }

    /// Reduces this node to the single adjacency strip for `direction`,
    /// dropping the full grid. Used when a legacy record had to be upgraded
    /// through a full read but the caller only wanted one border.
    pub fn retain_only_adjacent(&mut self, direction: Direction) {
        let strip = self.border_strip(direction);
        self.reset(self.pos);
        self.adjacent[direction.index()] = Some(strip);
    }

    /// Clears all data and rebinds the node to a new position. Called when a
    /// node is checked back out of the pool.
    pub(crate) fn reset(&mut self, pos: SectionPos) {
        self.pos = pos;
        for column in &mut self.columns {
            column.clear();
        }
        self.generation_steps.fill(0);
        self.compression_modes.fill(0);
        self.apply_to_parent = false;
        self.apply_to_children = false;
        self.adjacent = [None, None, None, None];
    }

    /// Merges another node's data into this one, returning whether anything
    /// changed.
    ///
    /// Three shapes are supported:
    /// - same position: non-empty incoming columns replace differing stored
    ///   columns;
    /// - `other` is a direct child: its cells are downsampled into the
    ///   matching quadrant of this node;
    /// - `other` is the direct parent: its cells fill only the holes in this
    ///   node's grid, never overwriting existing data.
    ///
    /// Any other positional relation is a no-op.
    pub fn merge_from(&mut self, other: &LodNode) -> bool {
        if other.pos == self.pos {
            self.merge_same_pos(other)
        } else if other.pos.detail_level() + 1 == self.pos.detail_level()
            && other.pos.parent() == self.pos
        {
            self.merge_child(other)
        } else if self.pos.detail_level() + 1 == other.pos.detail_level()
            && self.pos.parent() == other.pos
        {
            self.merge_parent(other)
        } else {
            false
        }
    }

    fn merge_same_pos(&mut self, other: &LodNode) -> bool {
        let mut changed = false;
        for index in 0..CELL_COUNT {
            let incoming = &other.columns[index];
            if !incoming.is_empty() && *incoming != self.columns[index] {
                self.columns[index] = incoming.clone();
                self.generation_steps[index] = other.generation_steps[index];
                self.compression_modes[index] = other.compression_modes[index];
                changed = true;
            }
        }
        changed
    }

    /// Downsamples a direct child into the quadrant of this node it covers.
    fn merge_child(&mut self, child: &LodNode) -> bool {
        let quadrant = child.pos.index_in_parent() as usize;
        let offset_x = (quadrant & 1) * (GRID_WIDTH / 2);
        let offset_z = ((quadrant >> 1) & 1) * (GRID_WIDTH / 2);

        let mut changed = false;
        for qz in 0..GRID_WIDTH / 2 {
            for qx in 0..GRID_WIDTH / 2 {
                // Representative column for the 2x2 child block: the first
                // non-empty column in row-major order.
                let mut sample = None;
                for dz in 0..2 {
                    for dx in 0..2 {
                        let index = cell_index(qx * 2 + dx, qz * 2 + dz);
                        if !child.columns[index].is_empty() {
                            sample.get_or_insert(index);
                        }
                    }
                }
                let Some(sample) = sample else { continue };

                let target = cell_index(offset_x + qx, offset_z + qz);
                if self.columns[target] != child.columns[sample] {
                    self.columns[target] = child.columns[sample].clone();
                    self.generation_steps[target] = child.generation_steps[sample];
                    self.compression_modes[target] = child.compression_modes[sample];
                    changed = true;
                }
            }
        }
        changed
    }

    /// Upsamples the direct parent into this node, filling only empty cells.
    fn merge_parent(&mut self, parent: &LodNode) -> bool {
        let quadrant = self.pos.index_in_parent() as usize;
        let offset_x = (quadrant & 1) * (GRID_WIDTH / 2);
        let offset_z = ((quadrant >> 1) & 1) * (GRID_WIDTH / 2);

        let mut changed = false;
        for z in 0..GRID_WIDTH {
            for x in 0..GRID_WIDTH {
                let target = cell_index(x, z);
                if !self.columns[target].is_empty() {
                    continue;
                }
                let source = cell_index(offset_x + x / 2, offset_z + z / 2);
                if parent.columns[source].is_empty() {
                    continue;
                }
                self.columns[target] = parent.columns[source].clone();
                self.generation_steps[target] = parent.generation_steps[source];
                self.compression_modes[target] = parent.compression_modes[source];
                changed = true;
            }
        }
        changed
    }
}

fn cell_index(x: usize, z: usize) -> usize {
    debug_assert!(x < GRID_WIDTH && z < GRID_WIDTH);
    z * GRID_WIDTH + x
}
