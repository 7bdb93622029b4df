use crate::approx::overapproximate;
use crate::error::{EngineError, Result};
use crate::flowpipe::{Flowpipe, ReachRecord, StopReason};
use crate::inputs::InputAccumulator;
use crate::matpow::MatrixPower;
use crate::options::EngineConfig;
use crate::partition::decompose;
use crate::sets::{HalfSpace, LazySet, SetOps, SetScalar, SumArray};
use crate::termination::Termination;

/// A predicate over cartesian-product sets, evaluated per step in check
/// mode. The set passed in spans the interesting blocks only; properties
/// over the full space must be rewritten through
/// [`Partition::output_coordinates`](crate::partition::Partition::output_coordinates)
/// before the run.
pub trait Property<N>
where
	N: SetScalar,
{
	fn holds(&self, set: &LazySet<N>) -> Result<bool>;
}

/// Satisfied when the set lies inside every listed half-space.
pub struct ContainedIn<N>
where
	N: SetScalar,
{
	pub constraints: Vec<HalfSpace<N>>,
}

impl<N> Property<N> for ContainedIn<N>
where
	N: SetScalar,
{
	fn holds(&self, set: &LazySet<N>) -> Result<bool> {
		for half in &self.constraints {
			if set.support(&half.normal.view())? > half.offset {
				return Ok(false);
			}
		}
		Ok(true)
	}
}

/// Adapts a plain predicate closure into a property.
pub struct PredicateFn<F>(pub F);

impl<N, F> Property<N> for PredicateFn<F>
where
	N: SetScalar,
	F: Fn(&LazySet<N>) -> bool,
{
	fn holds(&self, set: &LazySet<N>) -> Result<bool> {
		Ok((self.0)(set))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Init,
	Propagating,
	CrossGuard,
	Terminated,
}

enum StepOutcome {
	Continue,
	Stop,
}

/// The block-propagation engine. Owns the matrix-power handle, the
/// decomposed initial set and the input accumulator for the duration of
/// one run; the partition and configuration are read-only throughout.
pub struct Engine<N, P, T>
where
	N: SetScalar,
	P: MatrixPower<N>,
	T: Termination<N>,
{
	config: EngineConfig<N>,
	power: P,
	termination: T,
	x0: Vec<LazySet<N>>,
	accumulator: Option<InputAccumulator<N>>,
	phase: Phase,
}

impl<N, P, T> Engine<N, P, T>
where
	N: SetScalar,
	P: MatrixPower<N>,
	T: Termination<N>,
{
	pub fn new(
		config: EngineConfig<N>,
		power: P,
		termination: T,
		x0: LazySet<N>,
		input: Option<LazySet<N>>,
	) -> Result<Self> {
		let dim = config.partition.dim();
		if power.dim() != dim {
			return Err(EngineError::shape(format!(
				"matrix-power handle covers {} variables but the partition {dim}",
				power.dim()
			)));
		}
		let x0 = decompose(&x0, &config.partition, &config.init_options, config.lazy_x0)?;
		let accumulator = match input {
			Some(u) if !config.assume_homogeneous => Some(InputAccumulator::init(
				u,
				&config.partition,
				&config.interesting,
				&config.iter_options,
				config.collapse,
			)?),
			_ => None,
		};
		Ok(Self {
			config,
			power,
			termination,
			x0,
			accumulator,
			phase: Phase::Init,
		})
	}

	fn set_phase(&mut self, next: Phase) {
		if self.phase != next {
			log::debug!("phase {:?} -> {:?}", self.phase, next);
			self.phase = next;
		}
	}

	fn t_start(&self, k: usize) -> N {
		N::from_usize(k - 1).unwrap() * self.config.delta
	}

	/// Gathers the cross-block contributions of one block at the current
	/// power, always flattening into a Minkowski-sum array, and applies the
	/// block's iter policy.
	fn compute_block(&mut self, block: usize, input: Option<&LazySet<N>>) -> Result<LazySet<N>> {
		let range = self.config.partition.block(block);
		let mut terms = Vec::with_capacity(self.config.partition.len() + 1);
		for j in 0..self.config.partition.len() {
			let cols = self.config.partition.block(j);
			if let Some(sub) = self.power.sub_block(range.clone(), cols)? {
				terms.push(LazySet::linear_map(sub, self.x0[j].clone())?);
			}
		}
		if let Some(w) = input {
			terms.push(w.clone());
		}
		let gathered = if terms.is_empty() {
			LazySet::zero(range.len())
		} else {
			LazySet::SumArray(SumArray::from_terms(terms)?)
		};
		let policy = self.config.iter_options.resolve(block, range.len());
		let approx = overapproximate(&gathered, &policy)?;
		approx.ensure_finite()?;
		Ok(approx)
	}

	/// Absorbs the step-k input term into every accumulator slot and
	/// returns the per-slot values, or `None` for homogeneous runs.
	fn absorb_inputs(&mut self, k: usize, interesting: &[usize]) -> Result<Option<Vec<LazySet<N>>>> {
		if self.accumulator.is_none() {
			return Ok(None);
		}
		let mut rows = Vec::with_capacity(interesting.len());
		for &i in interesting {
			rows.push(self.power.row_block(self.config.partition.block(i))?);
		}
		match self.accumulator.as_mut() {
			Some(acc) => Ok(Some(acc.absorb(k, rows)?)),
			None => Ok(None),
		}
	}

	/// Termination, cross-guard splicing and record assembly for one step.
	fn store_step(
		&mut self,
		flowpipe: &mut Flowpipe<N>,
		k: usize,
		step_sets: Vec<LazySet<N>>,
	) -> Result<StepOutcome> {
		let interesting = self.config.interesting.clone();
		let complement = self.config.complement.clone();
		let candidate = LazySet::cartesian(step_sets.clone());

		let t0 = self.t_start(k);
		let check = self.termination.status(k, &candidate, t0)?;
		if check.terminate && check.skip {
			log::info!("invariant disjoint at step {k}; stopping with skip");
			flowpipe.stop = StopReason::InvariantDisjoint;
			self.set_phase(Phase::Terminated);
			return Ok(StepOutcome::Stop);
		}

		let crossing = !self.config.guards.is_empty()
			&& !complement.is_empty()
			&& candidate.may_intersect_any(&self.config.guards)?;
		let (stored, covered) = if crossing {
			self.set_phase(Phase::CrossGuard);
			log::debug!(
				"possible guard crossing at step {k}; splicing {} cheap blocks",
				complement.len()
			);
			let mut full: Vec<Option<LazySet<N>>> = vec![None; self.config.partition.len()];
			for (slot, &i) in interesting.iter().enumerate() {
				full[i] = Some(step_sets[slot].clone());
			}
			for &j in &complement {
				full[j] = Some(self.compute_block(j, None)?);
			}
			let spliced = full
				.into_iter()
				.map(|set| set.ok_or_else(|| EngineError::shape("block missing after splicing")))
				.collect::<Result<Vec<_>>>()?;
			(
				LazySet::cartesian(spliced),
				(0..self.config.partition.len()).collect(),
			)
		} else {
			(check.set, interesting)
		};

		let stored = match &self.config.output_function {
			Some(out) => LazySet::linear_map(out.clone(), stored)?,
			None => stored,
		};
		flowpipe.push(ReachRecord {
			set: stored,
			t_start: t0,
			t_end: t0 + self.config.delta,
			blocks: covered,
		});

		if check.terminate {
			flowpipe.stop = if k < self.config.num_steps {
				StopReason::Terminated
			} else {
				StopReason::Horizon
			};
			self.set_phase(Phase::Terminated);
			return Ok(StepOutcome::Stop);
		}
		Ok(StepOutcome::Continue)
	}

	/// Reach mode: materialises the flowpipe, truncated on early stops.
	pub fn run_reach(mut self) -> Result<Flowpipe<N>> {
		let n = self.config.num_steps;
		let interesting = self.config.interesting.clone();
		log::info!(
			"reach run: {n} steps of {}, {} blocks ({} interesting)",
			self.config.delta,
			self.config.partition.len(),
			interesting.len()
		);
		let mut flowpipe = Flowpipe::with_capacity(n);

		let initial: Vec<LazySet<N>> = interesting.iter().map(|&i| self.x0[i].clone()).collect();
		if let StepOutcome::Stop = self.store_step(&mut flowpipe, 1, initial)? {
			return Ok(flowpipe);
		}

		for k in 2..=n {
			self.set_phase(Phase::Propagating);
			log::trace!("propagating step {k}");
			let inputs = self.absorb_inputs(k, &interesting)?;
			let mut step_sets = Vec::with_capacity(interesting.len());
			for (slot, &i) in interesting.iter().enumerate() {
				let w = inputs.as_ref().map(|values| &values[slot]);
				step_sets.push(self.compute_block(i, w)?);
			}
			if let StepOutcome::Stop = self.store_step(&mut flowpipe, k, step_sets)? {
				return Ok(flowpipe);
			}
			if k < n {
				self.power.advance()?;
			}
		}
		self.set_phase(Phase::Terminated);
		Ok(flowpipe)
	}

	/// Check mode: no records are kept; returns the first step at which the
	/// property is violated, or 0 when it holds through the horizon.
	pub fn run_check(mut self, property: &dyn Property<N>) -> Result<usize> {
		let n = self.config.num_steps;
		let interesting = self.config.interesting.clone();
		let eager = self.config.eager_checking;
		log::info!("check run: {n} steps, eager checking {eager}");
		let mut deferred: Vec<(usize, LazySet<N>)> = Vec::new();

		let initial =
			LazySet::cartesian(interesting.iter().map(|&i| self.x0[i].clone()).collect());
		let first_check = self.termination.status(1, &initial, self.t_start(1))?;
		if eager {
			if !property.holds(&initial)? {
				log::info!("property violated by the initial set");
				return Ok(1);
			}
		} else {
			deferred.push((1, initial));
		}
		if !first_check.terminate {
			for k in 2..=n {
				self.set_phase(Phase::Propagating);
				let inputs = self.absorb_inputs(k, &interesting)?;
				let mut step_sets = Vec::with_capacity(interesting.len());
				for (slot, &i) in interesting.iter().enumerate() {
					let w = inputs.as_ref().map(|values| &values[slot]);
					step_sets.push(self.compute_block(i, w)?);
				}
				let candidate = LazySet::cartesian(step_sets);
				let check = self.termination.status(k, &candidate, self.t_start(k))?;
				if eager {
					if !property.holds(&candidate)? {
						log::info!("property violated at step {k}");
						return Ok(k);
					}
				} else {
					deferred.push((k, candidate));
				}
				if check.terminate {
					break;
				}
				if k < n {
					self.power.advance()?;
				}
			}
		}
		self.set_phase(Phase::Terminated);
		for (k, set) in deferred {
			if !property.holds(&set)? {
				log::info!("property violated at step {k} (deferred)");
				return Ok(k);
			}
		}
		Ok(0)
	}
}
