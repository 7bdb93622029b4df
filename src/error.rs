use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Everything that can go wrong during a reachability run. Configuration
/// problems are caught before iteration begins; shape and numeric problems
/// abort the run; failures of external collaborators (the matrix exponential
/// oracle, property predicates) surface unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
	/// Invalid partition, incompatible policy, non-positive horizon, etc.
	#[error("configuration error: {0}")]
	Config(String),
	/// Block dimension mismatches and misaligned matrix rows.
	#[error("shape error: {0}")]
	Shape(String),
	/// Non-finite coordinates or an unexpectedly empty intermediate set.
	#[error("numeric error: {0}")]
	Numeric(String),
	/// A failure reported by an external collaborator.
	#[error("external collaborator failure: {0}")]
	External(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
	pub fn config(msg: impl Into<String>) -> Self {
		Self::Config(msg.into())
	}

	pub fn shape(msg: impl Into<String>) -> Self {
		Self::Shape(msg.into())
	}

	pub fn numeric(msg: impl Into<String>) -> Self {
		Self::Numeric(msg.into())
	}

	pub fn external(err: impl std::error::Error + Send + Sync + 'static) -> Self {
		Self::External(Box::new(err))
	}
}
