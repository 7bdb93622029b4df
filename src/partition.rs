use std::fmt;
use std::ops::Range;

use bitvec::vec::BitVec;
use itertools::Itertools;
use ndarray::Array2;

use crate::approx::{overapproximate, BlockOptions, SetPolicy};
use crate::error::{EngineError, Result};
use crate::sets::{LazySet, SetOps, SetScalar};

/// An ordered partition of the variable indices `0..n` into contiguous,
/// ascending blocks. The tiling invariant is checked at construction and
/// holds for the lifetime of the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
	blocks: Vec<Range<usize>>,
}

impl Partition {
	pub fn new(blocks: Vec<Range<usize>>) -> Result<Self> {
		if blocks.is_empty() {
			return Err(EngineError::config("partition has no blocks"));
		}
		if blocks[0].start != 0 {
			return Err(EngineError::config(format!(
				"partition must start at variable 0, not {}",
				blocks[0].start
			)));
		}
		let mut expected = 0;
		for (i, block) in blocks.iter().enumerate() {
			if block.is_empty() {
				return Err(EngineError::config(format!("block {i} is empty")));
			}
			if block.start != expected {
				return Err(EngineError::config(format!(
					"block {i} starts at {} but the previous block ends at {expected}",
					block.start
				)));
			}
			expected = block.end;
		}
		Ok(Self { blocks })
	}

	/// The trivial partition with one block spanning all variables.
	pub fn single(dim: usize) -> Result<Self> {
		Self::new(vec![0..dim])
	}

	/// Blocks of the given width, the last one taking the remainder.
	pub fn uniform(dim: usize, width: usize) -> Result<Self> {
		if width == 0 {
			return Err(EngineError::config("block width must be positive"));
		}
		let mut blocks = Vec::with_capacity(dim.div_ceil(width));
		let mut start = 0;
		while start < dim {
			let end = (start + width).min(dim);
			blocks.push(start..end);
			start = end;
		}
		Self::new(blocks)
	}

	/// One block per variable.
	pub fn singletons(dim: usize) -> Result<Self> {
		Self::new((0..dim).map(|i| i..i + 1).collect())
	}

	/// The number of blocks.
	pub fn len(&self) -> usize {
		self.blocks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.blocks.is_empty()
	}

	/// The number of variables covered.
	pub fn dim(&self) -> usize {
		self.blocks.last().map(|b| b.end).unwrap_or(0)
	}

	pub fn block(&self, index: usize) -> Range<usize> {
		self.blocks[index].clone()
	}

	pub fn blocks(&self) -> impl Iterator<Item = Range<usize>> + '_ {
		self.blocks.iter().cloned()
	}

	/// Maps a variable index to its block and the offset within it.
	pub fn block_of(&self, var: usize) -> Result<(usize, usize)> {
		let idx = self.blocks.partition_point(|b| b.end <= var);
		if idx >= self.blocks.len() || !self.blocks[idx].contains(&var) {
			return Err(EngineError::config(format!(
				"variable {var} is outside the partitioned range 0..{}",
				self.dim()
			)));
		}
		Ok((idx, var - self.blocks[idx].start))
	}

	/// The ascending block indices whose block contains at least one of the
	/// given (sorted) variables.
	pub fn blocks_of(&self, vars: &[usize]) -> Result<Vec<usize>> {
		let mut out = Vec::new();
		for &var in vars {
			let (block, _) = self.block_of(var)?;
			if out.last() != Some(&block) {
				out.push(block);
			}
		}
		Ok(out)
	}

	/// The ascending block indices not contained in `blocks`.
	pub fn complement_of(&self, blocks: &[usize]) -> Vec<usize> {
		let mask = self.membership_mask(blocks);
		(0..self.len()).filter(|i| !mask[*i]).collect()
	}

	/// One bit per block, set for the listed blocks.
	pub fn membership_mask(&self, blocks: &[usize]) -> BitVec {
		let mut mask = BitVec::repeat(false, self.len());
		for &b in blocks {
			mask.set(b, true);
		}
		mask
	}

	/// For the cartesian product of the listed blocks (in order), maps every
	/// covered variable to its coordinate in the product space. Used to
	/// rewrite full-space predicates into the interesting subspace.
	pub fn output_coordinates(&self, blocks: &[usize]) -> Vec<(usize, usize)> {
		let mut out = Vec::new();
		let mut coord = 0;
		for &b in blocks {
			for var in self.block(b) {
				out.push((var, coord));
				coord += 1;
			}
		}
		out
	}
}

impl fmt::Display for Partition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"[{}]",
			self.blocks
				.iter()
				.map(|b| format!("{}..{}", b.start, b.end))
				.join(" | ")
		)
	}
}

/// The 0/1 matrix selecting the coordinates of `range` out of `dim`.
pub fn projection_matrix<N>(dim: usize, range: Range<usize>) -> Array2<N>
where
	N: SetScalar,
{
	let mut matrix = Array2::zeros((range.len(), dim));
	for (row, col) in range.enumerate() {
		matrix[[row, col]] = N::one();
	}
	matrix
}

/// Decomposes a full-dimensional set into one block set per partition
/// block, applying the per-block init policy to each projection. The
/// single-block passthrough shortcut keeps the original set untouched.
pub fn decompose<N>(
	x0: &LazySet<N>,
	partition: &Partition,
	init: &BlockOptions<N>,
	keep_lazy: bool,
) -> Result<Vec<LazySet<N>>>
where
	N: SetScalar,
{
	let dim = partition.dim();
	if x0.dim() != dim {
		return Err(EngineError::shape(format!(
			"initial set has dimension {} but the partition covers {dim}",
			x0.dim()
		)));
	}
	if partition.len() == 1
		&& (keep_lazy || init.resolve(0, dim) == SetPolicy::Passthrough)
	{
		return Ok(vec![x0.clone()]);
	}
	let mut decomposed = Vec::with_capacity(partition.len());
	for (i, range) in partition.blocks().enumerate() {
		let policy = if keep_lazy {
			SetPolicy::Passthrough
		} else {
			init.resolve(i, range.len())
		};
		let projected = LazySet::linear_map(projection_matrix(dim, range), x0.clone())?;
		let block_set = overapproximate(&projected, &policy)?;
		block_set.ensure_finite()?;
		decomposed.push(block_set);
	}
	Ok(decomposed)
}

#[cfg(test)]
mod partition_tests {
	use ndarray::arr1;

	use super::*;

	#[test]
	fn tiling_is_validated() {
		assert!(Partition::new(vec![0..2, 2..5]).is_ok());
		assert!(Partition::new(vec![]).is_err());
		assert!(Partition::new(vec![1..3]).is_err());
		assert!(Partition::new(vec![0..2, 3..5]).is_err());
		assert!(Partition::new(vec![0..2, 1..5]).is_err());
		assert!(Partition::new(vec![0..2, 2..2, 2..4]).is_err());
	}

	#[test]
	fn uniform_takes_the_remainder() {
		let p = Partition::uniform(5, 2).unwrap();
		assert_eq!(p.len(), 3);
		assert_eq!(p.block(2), 4..5);
		assert_eq!(p.dim(), 5);
		assert!(Partition::uniform(5, 0).is_err());
	}

	#[test]
	fn variables_map_to_blocks() {
		let p = Partition::new(vec![0..2, 2..4, 4..5]).unwrap();
		assert_eq!(p.block_of(0).unwrap(), (0, 0));
		assert_eq!(p.block_of(3).unwrap(), (1, 1));
		assert_eq!(p.block_of(4).unwrap(), (2, 0));
		assert!(p.block_of(5).is_err());
	}

	#[test]
	fn interesting_and_complement_tile_the_blocks() {
		let p = Partition::new(vec![0..2, 2..4, 4..5]).unwrap();
		let interesting = p.blocks_of(&[0, 1]).unwrap();
		assert_eq!(interesting, vec![0]);
		assert_eq!(p.complement_of(&interesting), vec![1, 2]);
		let all = p.blocks_of(&[0, 2, 4]).unwrap();
		assert_eq!(all, vec![0, 1, 2]);
		assert!(p.complement_of(&all).is_empty());
	}

	#[test]
	fn output_coordinates_follow_block_order() {
		let p = Partition::new(vec![0..2, 2..4, 4..5]).unwrap();
		assert_eq!(
			p.output_coordinates(&[0, 2]),
			vec![(0, 0), (1, 1), (4, 2)]
		);
	}

	#[test]
	fn trivial_passthrough_decomposition_is_identity() {
		let p = Partition::single(2).unwrap();
		let x0 = LazySet::hyperrectangle(arr1(&[1.0, 2.0]), arr1(&[0.5, 0.5])).unwrap();
		let init = BlockOptions::uniform(SetPolicy::Passthrough);
		let decomposed = decompose(&x0, &p, &init, false).unwrap();
		assert_eq!(decomposed.len(), 1);
		match &decomposed[0] {
			LazySet::Hyperrectangle { center, .. } => assert_eq!(center, &arr1(&[1.0, 2.0])),
			other => panic!("expected the original hyperrectangle, got {other:?}"),
		}
	}

	#[test]
	fn decomposition_projects_per_block() {
		let p = Partition::singletons(2).unwrap();
		let x0: LazySet<f64> = LazySet::hyperrectangle(arr1(&[1.0, -1.0]), arr1(&[0.5, 2.0])).unwrap();
		let decomposed = decompose(&x0, &p, &BlockOptions::default(), false).unwrap();
		assert_eq!(decomposed.len(), 2);
		match decomposed[0] {
			LazySet::Interval { lo, hi } => {
				assert!((lo - 0.5).abs() < 1e-9);
				assert!((hi - 1.5).abs() < 1e-9);
			}
			ref other => panic!("expected an interval, got {other:?}"),
		}
		match decomposed[1] {
			LazySet::Interval { lo, hi } => {
				assert!((lo + 3.0).abs() < 1e-9);
				assert!((hi - 1.0).abs() < 1e-9);
			}
			ref other => panic!("expected an interval, got {other:?}"),
		}
	}
}
