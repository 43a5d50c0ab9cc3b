//! Flat array layouts shared by the host, the generated kernels and the
//! reference kernels.
//!
//! A sparse grid is a list of subspaces. Each subspace has one level
//! vector and a run of coefficient slots described by a
//! [`SubspaceDescriptor`]. Complete subspaces are direct-indexed: the slot
//! of a point is computed from its index vector. Incomplete ones are
//! streamed: every point is listed explicitly.

use std::collections::BTreeMap;
use std::ops::Range;

use sgocl_common::{OclError, Real, Result};

/// Descriptor flag of a stream record.
pub const KIND_STREAM: u32 = 0;
/// Descriptor flag of a direct-indexed record.
pub const KIND_SUBSPACE: u32 = 1;

/// Words per descriptor: kind, start slot, slot count.
pub const DESCRIPTOR_WORDS: usize = 3;

/// Deepest supported level per dimension.
pub const MAX_LEVEL: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubspaceKind {
    Stream,
    Direct,
}

/// One decoded descriptor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubspaceDescriptor {
    pub kind: SubspaceKind,
    pub start: u32,
    pub count: u32,
}

impl SubspaceDescriptor {
    #[must_use]
    pub fn slots(&self) -> Range<usize> {
        self.start as usize..(self.start + self.count) as usize
    }

    fn encode(self) -> [u32; DESCRIPTOR_WORDS] {
        let kind = match self.kind {
            SubspaceKind::Stream => KIND_STREAM,
            SubspaceKind::Direct => KIND_SUBSPACE,
        };
        [kind, self.start, self.count]
    }
}

/// A grid point given by its level and index per dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridPoint {
    pub level: Vec<u32>,
    pub index: Vec<u32>,
}

impl GridPoint {
    #[must_use]
    pub fn new(level: Vec<u32>, index: Vec<u32>) -> Self {
        Self { level, index }
    }
}

// ── Basis arithmetic ────────────────────────────────────────────────

/// Linear hat function `prod max(1 - |l_d * x_d - i_d|, 0)` where `l_d`
/// is the level factor `2^level`.
pub(crate) fn hat<T: Real>(level_factors: &[T], indices: &[T], x: &[T]) -> T {
    let mut value = T::ONE;
    for ((&l, &i), &xd) in level_factors.iter().zip(indices).zip(x) {
        value = value * (T::ONE - (l * xd - i).abs()).max(T::ZERO);
        if value == T::ZERO {
            break;
        }
    }
    value
}

/// Slot offset and basis value of the only point of a complete subspace
/// whose support contains `x`, or `None` if `x` is outside all of them.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub(crate) fn direct_lookup<T: Real>(level_factors: &[T], x: &[T]) -> Option<(usize, T)> {
    let mut lin = 0usize;
    let mut value = T::ONE;
    for (&l, &xd) in level_factors.iter().zip(x) {
        let scaled = l * xd;
        if scaled < T::ZERO {
            return None;
        }
        let index = (scaled.floor().to_f64() as usize) | 1;
        let radix = (l.to_f64() as usize) / 2;
        let k = index >> 1;
        if k >= radix {
            return None;
        }
        lin = lin * radix + k;
        value = value * (T::ONE - (scaled - T::from_f64(index as f64)).abs()).max(T::ZERO);
    }
    Some((lin, value))
}

// ── Grid layout ─────────────────────────────────────────────────────

/// Device-ready arrays of a sparse grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridLayout<T> {
    dims: usize,
    /// `num_subspaces x dims` level factors `2^l`.
    levels: Vec<T>,
    /// `grid_size x dims` indices.
    indices: Vec<T>,
    /// `num_subspaces x 3` descriptor words.
    descriptors: Vec<u32>,
}

impl<T: Real> GridLayout<T> {
    /// Wrap pre-built arrays after checking their shapes.
    pub fn new(dims: usize, levels: Vec<T>, indices: Vec<T>, descriptors: Vec<u32>) -> Result<Self> {
        if dims == 0 {
            return Err(OclError::InvalidArgument("grid must have at least one dimension".into()));
        }
        if descriptors.len() % DESCRIPTOR_WORDS != 0 {
            return Err(OclError::InvalidArgument(format!(
                "descriptor array of {} words is not a multiple of {DESCRIPTOR_WORDS}",
                descriptors.len()
            )));
        }
        let num_subspaces = descriptors.len() / DESCRIPTOR_WORDS;
        if levels.len() != num_subspaces * dims {
            return Err(OclError::InvalidArgument(format!(
                "{} level entries for {num_subspaces} subspaces in {dims} dimensions",
                levels.len()
            )));
        }
        if indices.len() % dims != 0 {
            return Err(OclError::InvalidArgument(format!(
                "{} index entries is not a multiple of {dims} dimensions",
                indices.len()
            )));
        }
        let grid_size = indices.len() / dims;
        for (s, record) in descriptors.chunks_exact(DESCRIPTOR_WORDS).enumerate() {
            if record[0] != KIND_STREAM && record[0] != KIND_SUBSPACE {
                return Err(OclError::InvalidArgument(format!("subspace {s} has unknown kind {}", record[0])));
            }
            let end = record[1] as usize + record[2] as usize;
            if end > grid_size {
                return Err(OclError::InvalidArgument(format!(
                    "subspace {s} covers slots up to {end} but the grid has {grid_size}"
                )));
            }
        }
        Ok(Self { dims, levels, indices, descriptors })
    }

    /// Lay out `points`, grouping them by level vector.
    ///
    /// Returns the layout and, for every input point, the slot it was
    /// placed in; coefficient vectors must be permuted accordingly.
    pub fn from_points(dims: usize, points: &[GridPoint]) -> Result<(Self, Vec<usize>)> {
        if dims == 0 {
            return Err(OclError::InvalidArgument("grid must have at least one dimension".into()));
        }
        let mut groups: BTreeMap<&[u32], Vec<usize>> = BTreeMap::new();
        for (p, point) in points.iter().enumerate() {
            validate_point(dims, p, point)?;
            groups.entry(point.level.as_slice()).or_default().push(p);
        }

        let mut levels = Vec::with_capacity(groups.len() * dims);
        let mut indices = vec![T::ZERO; points.len() * dims];
        let mut descriptors = Vec::with_capacity(groups.len() * DESCRIPTOR_WORDS);
        let mut slots = vec![0usize; points.len()];
        let mut next = 0usize;

        for (level, members) in &groups {
            levels.extend(level.iter().map(|&l| T::from_f64(f64::from(l)).exp2()));
            let placement = direct_placement(level, members, points);
            let kind = if placement.is_some() { SubspaceKind::Direct } else { SubspaceKind::Stream };
            for (k, &p) in members.iter().enumerate() {
                let slot = next + placement.as_ref().map_or(k, |lin| lin[k]);
                slots[p] = slot;
                for (d, &i) in points[p].index.iter().enumerate() {
                    indices[slot * dims + d] = T::from_f64(f64::from(i));
                }
            }
            let descriptor = SubspaceDescriptor {
                kind,
                start: u32::try_from(next).map_err(|_| too_many_points(points.len()))?,
                count: u32::try_from(members.len()).map_err(|_| too_many_points(points.len()))?,
            };
            descriptors.extend(descriptor.encode());
            next += members.len();
        }

        Ok((Self { dims, levels, indices, descriptors }, slots))
    }

    #[must_use]
    pub const fn dims(&self) -> usize {
        self.dims
    }

    /// Number of coefficient slots.
    #[must_use]
    pub fn grid_size(&self) -> usize {
        self.indices.len() / self.dims
    }

    #[must_use]
    pub fn num_subspaces(&self) -> usize {
        self.descriptors.len() / DESCRIPTOR_WORDS
    }

    #[must_use]
    pub fn levels(&self) -> &[T] {
        &self.levels
    }

    #[must_use]
    pub fn indices(&self) -> &[T] {
        &self.indices
    }

    #[must_use]
    pub fn descriptors(&self) -> &[u32] {
        &self.descriptors
    }

    /// Decoded descriptor of subspace `s`.
    #[must_use]
    pub fn descriptor(&self, s: usize) -> Option<SubspaceDescriptor> {
        let record = self.descriptors.get(s * DESCRIPTOR_WORDS..(s + 1) * DESCRIPTOR_WORDS)?;
        let kind = if record[0] == KIND_SUBSPACE { SubspaceKind::Direct } else { SubspaceKind::Stream };
        Some(SubspaceDescriptor { kind, start: record[1], count: record[2] })
    }

    /// Coefficient slots owned by the subspaces in `subspaces`.
    ///
    /// Subspaces are laid out back to back, so this is one range.
    #[must_use]
    pub fn slot_range(&self, subspaces: Range<usize>) -> Range<usize> {
        let end = subspaces.end.min(self.num_subspaces());
        if subspaces.start >= end {
            return 0..0;
        }
        let slots = |s: usize| self.descriptor(s).map_or(0..0, |d| d.slots());
        let first = (subspaces.start..end).map(|s| slots(s).start).min().unwrap_or(0);
        let last = (subspaces.start..end).map(|s| slots(s).end).max().unwrap_or(0);
        first..last
    }

    /// Sum of `alpha[slot] * phi_slot(x)` over the subspaces in `subspaces`,
    /// evaluated point by point without direct indexing.
    #[must_use]
    pub fn evaluate(&self, alpha: &[T], subspaces: Range<usize>, x: &[T]) -> T {
        let d = self.dims;
        let mut sum = T::ZERO;
        for s in subspaces.start..subspaces.end.min(self.num_subspaces()) {
            let Some(desc) = self.descriptor(s) else { continue };
            let level = &self.levels[s * d..(s + 1) * d];
            for slot in desc.slots() {
                sum += alpha[slot] * hat(level, &self.indices[slot * d..(slot + 1) * d], x);
            }
        }
        sum
    }
}

fn too_many_points(n: usize) -> OclError {
    OclError::InvalidArgument(format!("{n} grid points do not fit 32-bit slot offsets"))
}

fn validate_point(dims: usize, p: usize, point: &GridPoint) -> Result<()> {
    if point.level.len() != dims || point.index.len() != dims {
        return Err(OclError::InvalidArgument(format!(
            "grid point {p} has {} levels and {} indices, expected {dims}",
            point.level.len(),
            point.index.len()
        )));
    }
    for (&l, &i) in point.level.iter().zip(&point.index) {
        if l == 0 || l > MAX_LEVEL {
            return Err(OclError::InvalidArgument(format!(
                "grid point {p} has level {l}, expected 1..={MAX_LEVEL}"
            )));
        }
        if i % 2 == 0 || i >= 1 << l {
            return Err(OclError::InvalidArgument(format!("grid point {p} has index {i} invalid for level {l}")));
        }
    }
    Ok(())
}

/// Slot offsets of `members` if they fill their subspace exactly once.
fn direct_placement(level: &[u32], members: &[usize], points: &[GridPoint]) -> Option<Vec<usize>> {
    let full = level.iter().try_fold(1usize, |acc, &l| acc.checked_mul(1 << (l - 1)))?;
    if full != members.len() {
        return None;
    }
    let mut seen = vec![false; full];
    let mut placement = Vec::with_capacity(members.len());
    for &p in members {
        let lin = points[p].index.iter().zip(level).fold(0usize, |acc, (&i, &l)| {
            acc * (1usize << (l - 1)) + ((i as usize) >> 1)
        });
        if std::mem::replace(&mut seen[lin], true) {
            return None;
        }
        placement.push(lin);
    }
    Some(placement)
}

// ── Dataset ─────────────────────────────────────────────────────────

/// Data points stored column-major: coordinate `d` of point `j` lives at
/// `data[j + size * d]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset<T> {
    dims: usize,
    size: usize,
    data: Vec<T>,
}

impl<T: Real> Dataset<T> {
    /// Wrap a column-major array of `data.len() / dims` points.
    pub fn new(dims: usize, data: Vec<T>) -> Result<Self> {
        if dims == 0 || data.len() % dims != 0 {
            return Err(OclError::InvalidArgument(format!(
                "dataset of {} values cannot be split into {dims} dimensions",
                data.len()
            )));
        }
        Ok(Self { dims, size: data.len() / dims, data })
    }

    /// Transpose row-major `points` (`[x0_0, x0_1, .., x1_0, ..]`).
    pub fn from_rows(dims: usize, rows: &[T]) -> Result<Self> {
        if dims == 0 || rows.len() % dims != 0 {
            return Err(OclError::InvalidArgument(format!(
                "{} row-major values cannot be split into {dims} dimensions",
                rows.len()
            )));
        }
        let size = rows.len() / dims;
        let mut data = vec![T::ZERO; rows.len()];
        for (j, row) in rows.chunks_exact(dims).enumerate() {
            for (d, &v) in row.iter().enumerate() {
                data[j + size * d] = v;
            }
        }
        Ok(Self { dims, size, data })
    }

    /// Append points at the origin until the size is a multiple of `block`.
    ///
    /// Every basis function vanishes at the origin, so padding points
    /// evaluate to zero and contribute nothing to a transposed product.
    #[must_use]
    pub fn padded_to(self, block: usize) -> Self {
        if block == 0 || self.size % block == 0 {
            return self;
        }
        let size = self.size.div_ceil(block) * block;
        let mut data = vec![T::ZERO; size * self.dims];
        for d in 0..self.dims {
            data[d * size..d * size + self.size].copy_from_slice(&self.data[d * self.size..(d + 1) * self.size]);
        }
        Self { dims: self.dims, size, data }
    }

    #[must_use]
    pub const fn dims(&self) -> usize {
        self.dims
    }

    /// Number of points.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Coordinates of point `j`.
    #[must_use]
    pub fn point(&self, j: usize) -> Vec<T> {
        (0..self.dims).map(|d| self.data[j + self.size * d]).collect()
    }
}
