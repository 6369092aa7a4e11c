use std::fmt;

/// Finest detail level in the section tree.
pub const LEAF_DETAIL_LEVEL: u8 = 0;
/// Coarsest detail level in the section tree. Sections at this level have no
/// parent and up-propagation stops here.
pub const ROOT_DETAIL_LEVEL: u8 = 12;

const COORD_BITS: u32 = 28;
const COORD_MASK: u64 = (1 << COORD_BITS) - 1;

/// Key identifying one node of the hierarchical section tree.
///
/// Packed into a single `u64`: detail level in the top 8 bits, then a 28-bit
/// signed x axis and a 28-bit signed z axis. The packed form gives a cheap
/// total order, which the lock registry and in-flight bookkeeping rely on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionPos(u64);

impl SectionPos {
    /// Packs a detail level and two axes into a position key.
    ///
    /// Coordinates outside the 28-bit signed range wrap; the tree's address
    /// space is bounded well inside that range.
    pub fn new(detail_level: u8, x: i32, z: i32) -> Self {
        let packed = ((detail_level as u64) << (2 * COORD_BITS))
            | (((x as u64) & COORD_MASK) << COORD_BITS)
            | ((z as u64) & COORD_MASK);
        Self(packed)
    }

    /// Reconstructs a position from its packed representation.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The packed representation, usable as a storage key.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Coarseness of this section; [`LEAF_DETAIL_LEVEL`] is finest.
    pub fn detail_level(self) -> u8 {
        (self.0 >> (2 * COORD_BITS)) as u8
    }

    pub fn x(self) -> i32 {
        sign_extend((self.0 >> COORD_BITS) & COORD_MASK)
    }

    pub fn z(self) -> i32 {
        sign_extend(self.0 & COORD_MASK)
    }

    /// The coarser section containing this one.
    pub fn parent(self) -> SectionPos {
        debug_assert!(self.detail_level() < ROOT_DETAIL_LEVEL);
        SectionPos::new(self.detail_level() + 1, self.x() >> 1, self.z() >> 1)
    }

    /// One of the four finer sections this one covers.
    ///
    /// `index` selects the quadrant: bit 0 is the x offset, bit 1 the z
    /// offset.
    pub fn child(self, index: u8) -> SectionPos {
        debug_assert!(self.detail_level() > LEAF_DETAIL_LEVEL);
        debug_assert!(index < 4);
        SectionPos::new(
            self.detail_level() - 1,
            (self.x() << 1) + (index & 1) as i32,
            (self.z() << 1) + ((index >> 1) & 1) as i32,
        )
    }

    /// Index of this section within its parent, mirroring [`Self::child`].
    pub fn index_in_parent(self) -> u8 {
        ((self.x() & 1) as u8) | (((self.z() & 1) as u8) << 1)
    }

    /// Center of this section in leaf-level cell coordinates, used to order
    /// propagation work by proximity to a viewer.
    pub fn center(self) -> (i64, i64) {
        let span = 1i64 << self.detail_level();
        (
            self.x() as i64 * span + span / 2,
            self.z() as i64 * span + span / 2,
        )
    }
}

fn sign_extend(value: u64) -> i32 {
    ((value << (64 - COORD_BITS)) as i64 >> (64 - COORD_BITS)) as i32
}

impl fmt::Display for SectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.detail_level(), self.x(), self.z())
    }
}

impl fmt::Debug for SectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectionPos{self}")
    }
}
