use ndarray::Array2;

use crate::approx::{BlockOptions, SetPolicy};
use crate::error::{EngineError, Result};
use crate::inputs::CollapsePolicy;
use crate::partition::Partition;
use crate::sets::{HalfSpace, SetScalar};

/// Backend selector. Only the explicit block-decomposed engine is covered
/// here; the wrapping alternative is rejected at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
	Explicit,
	Wrap,
}

/// The caller-facing options bag. Fill in the fields, then normalise with
/// [`validate`](Self::validate); nothing but the resulting [`EngineConfig`]
/// travels through the hot path.
pub struct EngineOptions<N>
where
	N: SetScalar,
{
	pub algorithm: Algorithm,
	/// Time step of the discretisation.
	pub delta: N,
	/// Time horizon; the step count is derived from it.
	pub time_horizon: N,
	pub partition: Partition,
	/// Variables of interest, sorted ascending. Empty means all.
	pub vars: Vec<usize>,
	/// Treat lazily extracted exponential rows as sparse.
	pub assume_sparse: bool,
	/// Ignore inputs even if a set is supplied.
	pub assume_homogeneous: bool,
	/// Pass the initial set through decomposition unchanged.
	pub lazy_x0: bool,
	pub collapse: CollapsePolicy,
	pub block_options_init: BlockOptions<N>,
	pub block_options_iter: BlockOptions<N>,
	/// Evaluate the property at every step in check mode.
	pub eager_checking: bool,
	/// Linear map applied to every stored set.
	pub output_function: Option<Array2<N>>,
	/// Half-spaces whose union triggers cross-guard splicing; expressed
	/// over the cartesian product of the interesting blocks.
	pub guards: Vec<HalfSpace<N>>,
}

impl<N> EngineOptions<N>
where
	N: SetScalar,
{
	pub fn new(delta: N, time_horizon: N, partition: Partition) -> Self {
		Self {
			algorithm: Algorithm::Explicit,
			delta,
			time_horizon,
			partition,
			vars: Vec::new(),
			assume_sparse: false,
			assume_homogeneous: false,
			lazy_x0: false,
			collapse: CollapsePolicy::Always,
			block_options_init: BlockOptions::default(),
			block_options_iter: BlockOptions::default(),
			eager_checking: true,
			output_function: None,
			guards: Vec::new(),
		}
	}

	/// Normalises and checks the options. All configuration failures
	/// surface here, before any iteration begins.
	pub fn validate(self) -> Result<EngineConfig<N>> {
		if self.algorithm == Algorithm::Wrap {
			return Err(EngineError::config(
				"the wrap algorithm is not covered by this engine",
			));
		}
		if !(self.delta > N::zero()) || !self.delta.is_finite() {
			return Err(EngineError::config(format!(
				"time step must be positive and finite, got {}",
				self.delta
			)));
		}
		if !(self.time_horizon > N::zero()) || !self.time_horizon.is_finite() {
			return Err(EngineError::config(format!(
				"time horizon must be positive and finite, got {}",
				self.time_horizon
			)));
		}
		// Snap near-integer ratios before the ceiling: a horizon that is an
		// exact multiple of the step must not round up to a spurious step.
		let ratio = self.time_horizon / self.delta;
		let nearest = ratio.round();
		let tol = N::epsilon().sqrt() * ratio.abs().max(N::one());
		let steps = if (ratio - nearest).abs() <= tol {
			nearest
		} else {
			ratio.ceil()
		};
		let num_steps = steps
			.to_usize()
			.ok_or_else(|| EngineError::config("horizon does not fit in a step count"))?
			.max(1);

		let dim = self.partition.dim();
		let vars = if self.vars.is_empty() {
			(0..dim).collect()
		} else {
			if self.vars.windows(2).any(|w| w[0] >= w[1]) {
				return Err(EngineError::config(
					"variables of interest must be sorted and distinct",
				));
			}
			if *self.vars.last().unwrap() >= dim {
				return Err(EngineError::config(format!(
					"variable of interest {} is outside 0..{dim}",
					self.vars.last().unwrap()
				)));
			}
			self.vars
		};
		let interesting = self.partition.blocks_of(&vars)?;
		let complement = self.partition.complement_of(&interesting);
		let interesting_dim: usize = interesting
			.iter()
			.map(|&b| self.partition.block(b).len())
			.sum();

		for (i, range) in self.partition.blocks().enumerate() {
			for options in [&self.block_options_init, &self.block_options_iter] {
				if let SetPolicy::EpsPolygon(eps) = options.resolve(i, range.len()) {
					if range.len() > 2 {
						return Err(EngineError::config(format!(
							"epsilon-close policy on block {i} of dimension {}",
							range.len()
						)));
					}
					if !(eps > N::zero()) || !eps.is_finite() {
						return Err(EngineError::config(format!(
							"epsilon bound must be positive and finite, got {eps}"
						)));
					}
				}
			}
		}

		if self.collapse == CollapsePolicy::Every(0) {
			return Err(EngineError::config("collapse period must be positive"));
		}

		if let Some(out) = &self.output_function {
			if !complement.is_empty() {
				return Err(EngineError::config(
					"output function requires all blocks to be interesting",
				));
			}
			if out.ncols() != dim {
				return Err(EngineError::config(format!(
					"output function has {} columns for a {dim}-dimensional state",
					out.ncols()
				)));
			}
		}

		for (i, guard) in self.guards.iter().enumerate() {
			if guard.dim() != interesting_dim {
				return Err(EngineError::config(format!(
					"guard {i} has dimension {} but the interesting product space has {interesting_dim}",
					guard.dim()
				)));
			}
		}

		Ok(EngineConfig {
			delta: self.delta,
			num_steps,
			partition: self.partition,
			vars,
			interesting,
			complement,
			interesting_dim,
			assume_sparse: self.assume_sparse,
			assume_homogeneous: self.assume_homogeneous,
			lazy_x0: self.lazy_x0,
			collapse: self.collapse,
			init_options: self.block_options_init,
			iter_options: self.block_options_iter,
			eager_checking: self.eager_checking,
			output_function: self.output_function,
			guards: self.guards,
		})
	}
}

/// The validated, normalised configuration the engine runs on.
pub struct EngineConfig<N>
where
	N: SetScalar,
{
	pub delta: N,
	pub num_steps: usize,
	pub partition: Partition,
	pub vars: Vec<usize>,
	pub interesting: Vec<usize>,
	pub complement: Vec<usize>,
	pub interesting_dim: usize,
	pub assume_sparse: bool,
	pub assume_homogeneous: bool,
	pub lazy_x0: bool,
	pub collapse: CollapsePolicy,
	pub init_options: BlockOptions<N>,
	pub iter_options: BlockOptions<N>,
	pub eager_checking: bool,
	pub output_function: Option<Array2<N>>,
	pub guards: Vec<HalfSpace<N>>,
}

#[cfg(test)]
mod options_tests {
	use ndarray::arr1;

	use crate::approx::TemplateKind;

	use super::*;

	fn base() -> EngineOptions<f64> {
		EngineOptions::new(0.5, 2.0, Partition::uniform(4, 2).unwrap())
	}

	#[test]
	fn step_count_is_the_ceiling() {
		let config = base().validate().unwrap();
		assert_eq!(config.num_steps, 4);
		let mut opts = base();
		opts.delta = 0.3;
		opts.time_horizon = 1.0;
		assert_eq!(opts.validate().unwrap().num_steps, 4);
	}

	#[test]
	fn empty_vars_means_all() {
		let config = base().validate().unwrap();
		assert_eq!(config.vars, vec![0, 1, 2, 3]);
		assert_eq!(config.interesting, vec![0, 1]);
		assert!(config.complement.is_empty());
		assert_eq!(config.interesting_dim, 4);
	}

	#[test]
	fn vars_select_interesting_blocks() {
		let mut opts = base();
		opts.vars = vec![0];
		let config = opts.validate().unwrap();
		assert_eq!(config.interesting, vec![0]);
		assert_eq!(config.complement, vec![1]);
		assert_eq!(config.interesting_dim, 2);
	}

	#[test]
	fn rejects_bad_scalars_and_backends() {
		let mut opts = base();
		opts.delta = 0.0;
		assert!(opts.validate().is_err());
		let mut opts = base();
		opts.time_horizon = -1.0;
		assert!(opts.validate().is_err());
		let mut opts = base();
		opts.algorithm = Algorithm::Wrap;
		assert!(opts.validate().is_err());
	}

	#[test]
	fn rejects_malformed_vars() {
		let mut opts = base();
		opts.vars = vec![2, 1];
		assert!(opts.validate().is_err());
		let mut opts = base();
		opts.vars = vec![0, 7];
		assert!(opts.validate().is_err());
	}

	#[test]
	fn rejects_incompatible_policies() {
		let mut opts = EngineOptions::<f64>::new(0.5, 2.0, Partition::single(3).unwrap());
		opts.block_options_iter = BlockOptions::uniform(SetPolicy::EpsPolygon(0.1));
		assert!(opts.validate().is_err());
		let mut opts = base();
		opts.block_options_iter = BlockOptions::uniform(SetPolicy::EpsPolygon(0.0));
		assert!(opts.validate().is_err());
		let mut opts = base();
		opts.block_options_iter = BlockOptions::uniform(SetPolicy::Template(TemplateKind::Octagon));
		assert!(opts.validate().is_ok());
	}

	#[test]
	fn output_function_needs_full_dimension() {
		let mut opts = base();
		opts.vars = vec![0];
		opts.output_function = Some(ndarray::Array2::eye(4));
		assert!(opts.validate().is_err());
		let mut opts = base();
		opts.output_function = Some(ndarray::Array2::eye(4));
		assert!(opts.validate().is_ok());
	}

	#[test]
	fn guards_live_in_the_interesting_space() {
		let mut opts = base();
		opts.vars = vec![0];
		opts.guards = vec![HalfSpace::new(arr1(&[1.0, 0.0]), 1.0)];
		assert!(opts.validate().is_ok());
		let mut opts = base();
		opts.vars = vec![0];
		opts.guards = vec![HalfSpace::new(arr1(&[1.0, 0.0, 0.0, 0.0]), 1.0)];
		assert!(opts.validate().is_err());
	}

	#[test]
	fn zero_collapse_period_is_rejected() {
		let mut opts = base();
		opts.collapse = CollapsePolicy::Every(0);
		assert!(opts.validate().is_err());
	}
}
