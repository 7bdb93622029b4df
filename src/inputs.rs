use ndarray::Array2;

use crate::approx::{overapproximate, BlockOptions, SetPolicy};
use crate::error::{EngineError, Result};
use crate::partition::{projection_matrix, Partition};
use crate::sets::{LazySet, SetOps, SetScalar, SumArray};

/// When the accumulated input expression is folded into a fresh block set.
/// Mirrors the `lazy_inputs_interval` option: 0 collapses at every step,
/// -1 never collapses, a positive period collapses every m-th step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapsePolicy {
	Always,
	Never,
	Every(usize),
	Predicate(fn(usize) -> bool),
}

impl CollapsePolicy {
	pub fn from_interval(interval: i64) -> Result<Self> {
		match interval {
			0 => Ok(Self::Always),
			-1 => Ok(Self::Never),
			m if m > 0 => Ok(Self::Every(m as usize)),
			m => Err(EngineError::config(format!(
				"lazy input interval must be 0, -1 or positive, got {m}"
			))),
		}
	}

	pub fn fires(&self, k: usize) -> bool {
		match self {
			Self::Always => true,
			Self::Never => false,
			Self::Every(0) => true,
			Self::Every(m) => k % m == 0,
			Self::Predicate(f) => f(k),
		}
	}
}

/// Per interesting block, the lazy overapproximation of the input
/// contribution accumulated so far. Slots are mutated in place step by
/// step; the contract is that slot i always covers
/// `pi_i(U + Phi U + ... + Phi^(k-1) U)` after step k.
pub struct InputAccumulator<N>
where
	N: SetScalar,
{
	input: LazySet<N>,
	slots: Vec<SumArray<N>>,
	policies: Vec<SetPolicy<N>>,
	collapse: CollapsePolicy,
}

impl<N> InputAccumulator<N>
where
	N: SetScalar,
{
	/// Initialises the accumulator at step 1 with the projected and
	/// approximated input, one single-element sum array per interesting
	/// block.
	pub fn init(
		input: LazySet<N>,
		partition: &Partition,
		interesting: &[usize],
		iter: &BlockOptions<N>,
		collapse: CollapsePolicy,
	) -> Result<Self> {
		let dim = partition.dim();
		if input.dim() != dim {
			return Err(EngineError::shape(format!(
				"input set has dimension {} but the partition covers {dim}",
				input.dim()
			)));
		}
		let mut slots = Vec::with_capacity(interesting.len());
		let mut policies = Vec::with_capacity(interesting.len());
		for &block in interesting {
			let range = partition.block(block);
			let policy = iter.resolve(block, range.len());
			let projected =
				LazySet::linear_map(projection_matrix(dim, range), input.clone())?;
			let first = overapproximate(&projected, &policy)?;
			slots.push(SumArray::from_terms(vec![first])?);
			policies.push(policy);
		}
		Ok(Self {
			input,
			slots,
			policies,
			collapse,
		})
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	/// The number of summands currently held for a slot.
	pub fn term_count(&self, slot: usize) -> usize {
		self.slots[slot].len()
	}

	/// Absorbs the step-k contribution `row_block(Phi^(k-1)) * U` for every
	/// slot, collapsing when the schedule fires, and returns the per-slot
	/// accumulator values to use at step k.
	pub fn absorb(&mut self, k: usize, row_blocks: Vec<Array2<N>>) -> Result<Vec<LazySet<N>>> {
		if row_blocks.len() != self.slots.len() {
			return Err(EngineError::shape(format!(
				"{} row blocks absorbed into {} accumulator slots",
				row_blocks.len(),
				self.slots.len()
			)));
		}
		for (slot, rows) in self.slots.iter_mut().zip(row_blocks) {
			let term = LazySet::linear_map(rows, self.input.clone())?;
			slot.push(term)?;
		}
		let fire = self.collapse.fires(k);
		if fire {
			log::debug!("collapsing input accumulator at step {k}");
		}
		let mut values = Vec::with_capacity(self.slots.len());
		for (slot, policy) in self.slots.iter_mut().zip(self.policies.iter()) {
			if fire {
				values.push(slot.collapse(policy)?);
			} else {
				values.push(slot.current());
			}
		}
		Ok(values)
	}
}
