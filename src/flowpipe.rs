use std::fmt;

use itertools::Itertools;

use crate::sets::{LazySet, SetScalar};

/// One step of the flowpipe: the (possibly partial) cartesian-product set,
/// the time interval it covers and the partition blocks it spans.
#[derive(Debug, Clone)]
pub struct ReachRecord<N>
where
	N: SetScalar,
{
	pub set: LazySet<N>,
	pub t_start: N,
	pub t_end: N,
	pub blocks: Vec<usize>,
}

/// Why a run stopped. `Horizon` is the normal outcome; `InvariantDisjoint`
/// marks a skip stop; `Terminated` covers satisfied custom policies and
/// caller cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
	Horizon,
	InvariantDisjoint,
	Terminated,
}

/// The ordered, timestamped sequence of reach-set records. Records are
/// appended in strictly increasing step order and the sequence is truncated
/// at the step that stopped the run.
#[derive(Debug, Clone)]
pub struct Flowpipe<N>
where
	N: SetScalar,
{
	pub records: Vec<ReachRecord<N>>,
	pub stop: StopReason,
}

impl<N> Flowpipe<N>
where
	N: SetScalar,
{
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			records: Vec::with_capacity(capacity),
			stop: StopReason::Horizon,
		}
	}

	pub fn push(&mut self, record: ReachRecord<N>) {
		self.records.push(record);
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &ReachRecord<N>> {
		self.records.iter()
	}

	pub fn last(&self) -> Option<&ReachRecord<N>> {
		self.records.last()
	}
}

impl<N> fmt::Display for Flowpipe<N>
where
	N: SetScalar,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(
			f,
			"flowpipe with {} records, stopped by {:?}:",
			self.len(),
			self.stop
		)?;
		write!(
			f,
			"{}",
			self.records
				.iter()
				.map(|r| {
					format!(
						" - [{}, {}] over blocks {{{}}}",
						r.t_start,
						r.t_end,
						r.blocks.iter().map(|b| b.to_string()).join(", ")
					)
				})
				.join("\n")
		)
	}
}
