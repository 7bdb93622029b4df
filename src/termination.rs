use crate::error::Result;
use crate::sets::{HalfSpace, LazySet, SetOps, SetScalar};

/// The outcome of consulting the termination policy at one step. `set` is
/// what the engine should store: the invariant-intersected current set when
/// an invariant is in effect, the current set otherwise.
pub struct TerminationCheck<N>
where
	N: SetScalar,
{
	pub terminate: bool,
	pub skip: bool,
	pub set: LazySet<N>,
}

/// Per-step predicate deciding whether the iteration stops. This is also
/// the cancellation channel: callers express timeouts by wrapping a policy
/// and flipping `terminate` when their clock runs out.
pub trait Termination<N>
where
	N: SetScalar,
{
	fn status(&self, k: usize, set: &LazySet<N>, t0: N) -> Result<TerminationCheck<N>>;
}

/// Never terminates and never skips.
pub struct Unbounded;

impl<N> Termination<N> for Unbounded
where
	N: SetScalar,
{
	fn status(&self, _k: usize, set: &LazySet<N>, _t0: N) -> Result<TerminationCheck<N>> {
		Ok(TerminationCheck {
			terminate: false,
			skip: false,
			set: set.clone(),
		})
	}
}

/// Terminates normally once the step count reaches the horizon.
pub struct Horizon {
	pub max_steps: usize,
}

impl<N> Termination<N> for Horizon
where
	N: SetScalar,
{
	fn status(&self, k: usize, set: &LazySet<N>, _t0: N) -> Result<TerminationCheck<N>> {
		Ok(TerminationCheck {
			terminate: k >= self.max_steps,
			skip: false,
			set: set.clone(),
		})
	}
}

/// Disjointness from the invariant polyhedron is decided by the sufficient
/// single-constraint support test; a hit terminates with skip. Otherwise
/// the returned set is the lazy intersection with the invariant.
fn invariant_status<N>(
	constraints: &[HalfSpace<N>],
	set: &LazySet<N>,
) -> Result<(bool, LazySet<N>)>
where
	N: SetScalar,
{
	for half in constraints {
		if set.is_disjoint_from(half)? {
			return Ok((true, set.clone()));
		}
	}
	Ok((
		false,
		LazySet::Intersection {
			operand: Box::new(set.clone()),
			constraints: constraints.to_vec(),
		},
	))
}

/// Terminates with skip when the current set left the invariant.
pub struct Invariant<N>
where
	N: SetScalar,
{
	pub constraints: Vec<HalfSpace<N>>,
}

impl<N> Termination<N> for Invariant<N>
where
	N: SetScalar,
{
	fn status(&self, _k: usize, set: &LazySet<N>, _t0: N) -> Result<TerminationCheck<N>> {
		let (disjoint, set) = invariant_status(&self.constraints, set)?;
		Ok(TerminationCheck {
			terminate: disjoint,
			skip: disjoint,
			set,
		})
	}
}

/// Horizon termination combined with invariant skip; the invariant is
/// consulted first so leaving it wins over running out of steps.
pub struct InvariantHorizon<N>
where
	N: SetScalar,
{
	pub max_steps: usize,
	pub constraints: Vec<HalfSpace<N>>,
}

impl<N> Termination<N> for InvariantHorizon<N>
where
	N: SetScalar,
{
	fn status(&self, k: usize, set: &LazySet<N>, _t0: N) -> Result<TerminationCheck<N>> {
		let (disjoint, set) = invariant_status(&self.constraints, set)?;
		if disjoint {
			return Ok(TerminationCheck {
				terminate: true,
				skip: true,
				set,
			});
		}
		Ok(TerminationCheck {
			terminate: k >= self.max_steps,
			skip: false,
			set,
		})
	}
}
