use std::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

use ndarray::{s, Array1, Array2, ArrayView1};

use crate::error::{EngineError, Result};

/// A trait representing what we need for a set or matrix coordinate.
pub trait SetScalar:
	num::Float
	+ num::FromPrimitive
	+ num::ToPrimitive
	+ Default
	+ std::iter::Sum
	+ AddAssign
	+ SubAssign
	+ MulAssign
	+ DivAssign
	+ std::fmt::Debug
	+ std::fmt::Display
	+ std::marker::Send
	+ std::marker::Sync
	+ sprs::MulAcc
	+ 'static
{
}

impl SetScalar for f64 {}
impl SetScalar for f32 {}

/// The half-space `{ x : normal · x <= offset }`.
#[derive(Debug, Clone)]
pub struct HalfSpace<N>
where
	N: SetScalar,
{
	pub normal: Array1<N>,
	pub offset: N,
}

impl<N> HalfSpace<N>
where
	N: SetScalar,
{
	pub fn new(normal: Array1<N>, offset: N) -> Self {
		Self { normal, offset }
	}

	pub fn dim(&self) -> usize {
		self.normal.len()
	}
}

/// Returns `s > 0` such that `a == s * b`, if such a scale exists. Used to
/// answer support queries on constraint representations without an LP.
pub(crate) fn positive_scale<N>(a: &ArrayView1<N>, b: &ArrayView1<N>) -> Option<N>
where
	N: SetScalar,
{
	if a.len() != b.len() {
		return None;
	}
	// Pivot on the largest component of b to keep the division stable.
	let mut pivot = 0;
	let mut pivot_abs = N::zero();
	for (i, &bi) in b.iter().enumerate() {
		if bi.abs() > pivot_abs {
			pivot_abs = bi.abs();
			pivot = i;
		}
	}
	if pivot_abs == N::zero() {
		return None;
	}
	let scale = a[pivot] / b[pivot];
	if scale <= N::zero() || !scale.is_finite() {
		return None;
	}
	let tol = N::epsilon().sqrt();
	for (&ai, &bi) in a.iter().zip(b.iter()) {
		if (ai - scale * bi).abs() > tol * (N::one() + ai.abs()) {
			return None;
		}
	}
	Some(scale)
}

/// An append-mostly container of lazy summands representing their Minkowski
/// sum. Collapsing replaces the whole arena with a single overapproximated
/// summand when the overapproximation policy permits forgetting history;
/// `collapsed_len` marks how many leading terms stem from the last collapse.
#[derive(Debug, Clone)]
pub struct SumArray<N>
where
	N: SetScalar,
{
	dim: usize,
	terms: Vec<LazySet<N>>,
	collapsed_len: usize,
}

impl<N> SumArray<N>
where
	N: SetScalar,
{
	/// An empty array; its value is the zero set of the given dimension.
	pub fn new(dim: usize) -> Self {
		Self {
			dim,
			terms: Vec::new(),
			collapsed_len: 0,
		}
	}

	pub fn from_terms(terms: Vec<LazySet<N>>) -> Result<Self> {
		let dim = match terms.first() {
			Some(first) => first.dim(),
			None => {
				return Err(EngineError::shape(
					"cannot build a Minkowski-sum array without terms",
				));
			}
		};
		let mut arr = Self::new(dim);
		for term in terms {
			arr.push(term)?;
		}
		Ok(arr)
	}

	pub fn push(&mut self, term: LazySet<N>) -> Result<()> {
		if term.dim() != self.dim {
			return Err(EngineError::shape(format!(
				"summand of dimension {} pushed into {}-dimensional sum array",
				term.dim(),
				self.dim
			)));
		}
		self.terms.push(term);
		Ok(())
	}

	pub fn dim(&self) -> usize {
		self.dim
	}

	pub fn len(&self) -> usize {
		self.terms.len()
	}

	pub fn is_empty(&self) -> bool {
		self.terms.is_empty()
	}

	pub fn terms(&self) -> &[LazySet<N>] {
		&self.terms
	}

	pub fn collapsed_len(&self) -> usize {
		self.collapsed_len
	}

	/// The set currently represented by the array. A single-term array
	/// unwraps to its term so collapsed accumulators stay flat.
	pub fn current(&self) -> LazySet<N> {
		match self.terms.len() {
			0 => LazySet::Zero { dim: self.dim },
			1 => self.terms[0].clone(),
			_ => LazySet::SumArray(self.clone()),
		}
	}

	/// Forget all summands in favour of a single replacement. Only sound
	/// when the replacement overapproximates the current value.
	pub(crate) fn replace_with(&mut self, term: LazySet<N>) {
		self.terms.clear();
		self.terms.push(term);
		self.collapsed_len = 1;
	}
}

/// The closed variant of set expressions the engine works with. Concrete
/// kinds store their geometry; lazy kinds defer to their operands through
/// the support-function recursion in [`SetOps`].
#[derive(Debug, Clone)]
pub enum LazySet<N>
where
	N: SetScalar,
{
	/// A 1-dimensional closed interval `[lo, hi]`.
	Interval { lo: N, hi: N },
	/// An axis-aligned hyperrectangle given by center and radius.
	Hyperrectangle {
		center: Array1<N>,
		radius: Array1<N>,
	},
	/// `center + sum_j generators[:, j] * e_j` with `e_j` in `[-1, 1]`.
	Zonotope {
		center: Array1<N>,
		generators: Array2<N>,
	},
	/// A 2-dimensional convex polygon, vertices in counterclockwise order.
	Polygon { vertices: Vec<Array1<N>> },
	/// The polytope `{ x : directions[i] · x <= offsets[i] }` together with
	/// its bounding box, which answers support queries in directions that
	/// are not template directions (soundly, without an LP).
	TemplatePolytope {
		directions: Vec<Array1<N>>,
		offsets: Vec<N>,
		box_lo: Array1<N>,
		box_hi: Array1<N>,
	},
	/// A single point.
	Singleton { point: Array1<N> },
	/// The singleton at the origin.
	Zero { dim: usize },
	/// The lazy image `matrix * operand`.
	LinearMap {
		matrix: Array2<N>,
		operand: Box<LazySet<N>>,
	},
	/// The lazy Minkowski sum of two operands.
	MinkowskiSum {
		lhs: Box<LazySet<N>>,
		rhs: Box<LazySet<N>>,
	},
	/// A cached Minkowski-sum array; always flat, never right-leaning.
	SumArray(SumArray<N>),
	/// The Cartesian product of block sets, in partition order.
	CartesianArray { blocks: Vec<LazySet<N>> },
	/// The operand intersected with a conjunction of half-spaces. Produced
	/// by invariant termination; support queries use the sound minimum rule.
	Intersection {
		operand: Box<LazySet<N>>,
		constraints: Vec<HalfSpace<N>>,
	},
}

/// The operations the engine needs from a set representation.
pub trait SetOps<N>: Sized
where
	N: SetScalar,
{
	fn dim(&self) -> usize;

	/// The support function `rho(d) = sup { d · x : x in self }`.
	fn support(&self, direction: &ArrayView1<N>) -> Result<N>;

	/// A support vector: a point attaining (or, for constraint
	/// representations, dominating) the support in the given direction.
	fn support_point(&self, direction: &ArrayView1<N>) -> Result<Array1<N>>;

	/// Componentwise lower and upper bounds, from 2n support queries.
	fn bounding_box(&self) -> Result<(Array1<N>, Array1<N>)>;

	fn linear_map(matrix: Array2<N>, operand: Self) -> Result<Self>;

	fn minkowski_sum(lhs: Self, rhs: Self) -> Result<Self>;

	fn cartesian(blocks: Vec<Self>) -> Self;

	/// Whether `self` and the half-space have no point in common, decided
	/// by `-rho(-a) > b`.
	fn is_disjoint_from(&self, half: &HalfSpace<N>) -> Result<bool>;

	/// Whether `self` may intersect the union of the given half-spaces.
	fn may_intersect_any(&self, halves: &[HalfSpace<N>]) -> Result<bool>;

	/// Fails with a numeric error if the stored geometry contains
	/// non-finite coordinates or is unexpectedly empty.
	fn ensure_finite(&self) -> Result<()>;
}

impl<N> LazySet<N>
where
	N: SetScalar,
{
	pub fn interval(lo: N, hi: N) -> Result<Self> {
		if lo > hi {
			return Err(EngineError::numeric(format!(
				"interval with lo {lo} above hi {hi}"
			)));
		}
		Ok(Self::Interval { lo, hi })
	}

	pub fn hyperrectangle(center: Array1<N>, radius: Array1<N>) -> Result<Self> {
		if center.len() != radius.len() {
			return Err(EngineError::shape(format!(
				"hyperrectangle center has dimension {} but radius {}",
				center.len(),
				radius.len()
			)));
		}
		if radius.iter().any(|r| *r < N::zero()) {
			return Err(EngineError::numeric("hyperrectangle with negative radius"));
		}
		Ok(Self::Hyperrectangle { center, radius })
	}

	pub fn zonotope(center: Array1<N>, generators: Array2<N>) -> Result<Self> {
		if generators.nrows() != center.len() {
			return Err(EngineError::shape(format!(
				"zonotope center has dimension {} but generators have {} rows",
				center.len(),
				generators.nrows()
			)));
		}
		Ok(Self::Zonotope { center, generators })
	}

	pub fn polygon(vertices: Vec<Array1<N>>) -> Result<Self> {
		if vertices.is_empty() {
			return Err(EngineError::numeric("polygon without vertices"));
		}
		if vertices.iter().any(|v| v.len() != 2) {
			return Err(EngineError::shape("polygon vertices must be 2-dimensional"));
		}
		Ok(Self::Polygon { vertices })
	}

	pub fn singleton(point: Array1<N>) -> Self {
		Self::Singleton { point }
	}

	pub fn zero(dim: usize) -> Self {
		Self::Zero { dim }
	}
}

impl<N> SetOps<N> for LazySet<N>
where
	N: SetScalar,
{
	fn dim(&self) -> usize {
		match self {
			Self::Interval { .. } => 1,
			Self::Hyperrectangle { center, .. } => center.len(),
			Self::Zonotope { center, .. } => center.len(),
			Self::Polygon { .. } => 2,
			Self::TemplatePolytope { box_lo, .. } => box_lo.len(),
			Self::Singleton { point } => point.len(),
			Self::Zero { dim } => *dim,
			Self::LinearMap { matrix, .. } => matrix.nrows(),
			Self::MinkowskiSum { lhs, .. } => lhs.dim(),
			Self::SumArray(arr) => arr.dim(),
			Self::CartesianArray { blocks } => blocks.iter().map(|b| b.dim()).sum(),
			Self::Intersection { operand, .. } => operand.dim(),
		}
	}

	fn support(&self, direction: &ArrayView1<N>) -> Result<N> {
		if direction.len() != self.dim() {
			return Err(EngineError::shape(format!(
				"support direction of dimension {} queried on a {}-dimensional set",
				direction.len(),
				self.dim()
			)));
		}
		match self {
			Self::Interval { lo, hi } => {
				let d = direction[0];
				Ok(if d >= N::zero() { d * *hi } else { d * *lo })
			}
			Self::Hyperrectangle { center, radius } => {
				let mut acc = center.dot(direction);
				for (r, d) in radius.iter().zip(direction.iter()) {
					acc = acc + *r * d.abs();
				}
				Ok(acc)
			}
			Self::Zonotope { center, generators } => {
				let mut acc = center.dot(direction);
				for j in 0..generators.ncols() {
					acc = acc + generators.column(j).dot(direction).abs();
				}
				Ok(acc)
			}
			Self::Polygon { vertices } => vertices
				.iter()
				.map(|v| v.dot(direction))
				.fold(None, |best: Option<N>, val| match best {
					Some(b) if b >= val => Some(b),
					_ => Some(val),
				})
				.ok_or_else(|| EngineError::numeric("support of empty polygon")),
			Self::TemplatePolytope {
				directions,
				offsets,
				box_lo,
				box_hi,
			} => {
				for (dir, off) in directions.iter().zip(offsets.iter()) {
					if let Some(scale) = positive_scale(&dir.view(), direction) {
						return Ok(*off / scale);
					}
				}
				// Not a template direction: fall back on the bounding box.
				let mut acc = N::zero();
				for ((&lo, &hi), &d) in box_lo.iter().zip(box_hi.iter()).zip(direction.iter()) {
					acc = acc + if d >= N::zero() { d * hi } else { d * lo };
				}
				Ok(acc)
			}
			Self::Singleton { point } => Ok(point.dot(direction)),
			Self::Zero { .. } => Ok(N::zero()),
			Self::LinearMap { matrix, operand } => {
				let pulled = matrix.t().dot(direction);
				operand.support(&pulled.view())
			}
			Self::MinkowskiSum { lhs, rhs } => {
				Ok(lhs.support(direction)? + rhs.support(direction)?)
			}
			Self::SumArray(arr) => {
				let mut acc = N::zero();
				for term in arr.terms() {
					acc = acc + term.support(direction)?;
				}
				Ok(acc)
			}
			Self::CartesianArray { blocks } => {
				let mut acc = N::zero();
				let mut offset = 0;
				for block in blocks {
					let len = block.dim();
					let slice = direction.slice(s![offset..offset + len]);
					acc = acc + block.support(&slice)?;
					offset += len;
				}
				Ok(acc)
			}
			Self::Intersection {
				operand,
				constraints,
			} => {
				let mut best = operand.support(direction)?;
				for half in constraints {
					if let Some(scale) = positive_scale(&half.normal.view(), direction) {
						let bound = half.offset / scale;
						if bound < best {
							best = bound;
						}
					}
				}
				Ok(best)
			}
		}
	}

	fn support_point(&self, direction: &ArrayView1<N>) -> Result<Array1<N>> {
		if direction.len() != self.dim() {
			return Err(EngineError::shape(format!(
				"support direction of dimension {} queried on a {}-dimensional set",
				direction.len(),
				self.dim()
			)));
		}
		match self {
			Self::Interval { lo, hi } => {
				let v = if direction[0] >= N::zero() { *hi } else { *lo };
				Ok(Array1::from_elem(1, v))
			}
			Self::Hyperrectangle { center, radius } => {
				let mut point = center.clone();
				for ((p, &r), &d) in point.iter_mut().zip(radius.iter()).zip(direction.iter()) {
					*p = if d >= N::zero() { *p + r } else { *p - r };
				}
				Ok(point)
			}
			Self::Zonotope { center, generators } => {
				let mut point = center.clone();
				for j in 0..generators.ncols() {
					let col = generators.column(j);
					if col.dot(direction) >= N::zero() {
						point += &col;
					} else {
						point -= &col;
					}
				}
				Ok(point)
			}
			Self::Polygon { vertices } => {
				let mut best: Option<(&Array1<N>, N)> = None;
				for v in vertices {
					let val = v.dot(direction);
					match best {
						Some((_, b)) if b >= val => {}
						_ => best = Some((v, val)),
					}
				}
				best.map(|(v, _)| v.clone())
					.ok_or_else(|| EngineError::numeric("support point of empty polygon"))
			}
			// The box corner dominates the support; a sound stand-in for
			// refinement over constraint representations.
			Self::TemplatePolytope {
				box_lo, box_hi, ..
			} => {
				let mut point = Array1::zeros(box_lo.len());
				for (i, &d) in direction.iter().enumerate() {
					point[i] = if d >= N::zero() { box_hi[i] } else { box_lo[i] };
				}
				Ok(point)
			}
			Self::Singleton { point } => Ok(point.clone()),
			Self::Zero { dim } => Ok(Array1::zeros(*dim)),
			Self::LinearMap { matrix, operand } => {
				let pulled = matrix.t().dot(direction);
				let inner = operand.support_point(&pulled.view())?;
				Ok(matrix.dot(&inner))
			}
			Self::MinkowskiSum { lhs, rhs } => {
				Ok(lhs.support_point(direction)? + rhs.support_point(direction)?)
			}
			Self::SumArray(arr) => {
				let mut point = Array1::zeros(arr.dim());
				for term in arr.terms() {
					point += &term.support_point(direction)?;
				}
				Ok(point)
			}
			Self::CartesianArray { blocks } => {
				let mut point = Array1::zeros(self.dim());
				let mut offset = 0;
				for block in blocks {
					let len = block.dim();
					let slice = direction.slice(s![offset..offset + len]);
					let part = block.support_point(&slice)?;
					point.slice_mut(s![offset..offset + len]).assign(&part);
					offset += len;
				}
				Ok(point)
			}
			// The operand's support point dominates the intersection; the
			// refinement then overapproximates the operand, a superset.
			Self::Intersection { operand, .. } => operand.support_point(direction),
		}
	}

	fn bounding_box(&self) -> Result<(Array1<N>, Array1<N>)> {
		let n = self.dim();
		let mut lo = Array1::zeros(n);
		let mut hi = Array1::zeros(n);
		let mut direction = Array1::zeros(n);
		for i in 0..n {
			direction[i] = N::one();
			hi[i] = self.support(&direction.view())?;
			direction[i] = -N::one();
			lo[i] = -self.support(&direction.view())?;
			direction[i] = N::zero();
		}
		Ok((lo, hi))
	}

	fn linear_map(matrix: Array2<N>, operand: Self) -> Result<Self> {
		if matrix.ncols() != operand.dim() {
			return Err(EngineError::shape(format!(
				"linear map with {} columns applied to a {}-dimensional set",
				matrix.ncols(),
				operand.dim()
			)));
		}
		match operand {
			Self::Zero { .. } => Ok(Self::Zero {
				dim: matrix.nrows(),
			}),
			Self::Singleton { point } => Ok(Self::Singleton {
				point: matrix.dot(&point),
			}),
			other => Ok(Self::LinearMap {
				matrix,
				operand: Box::new(other),
			}),
		}
	}

	fn minkowski_sum(lhs: Self, rhs: Self) -> Result<Self> {
		if lhs.dim() != rhs.dim() {
			return Err(EngineError::shape(format!(
				"Minkowski sum of sets with dimensions {} and {}",
				lhs.dim(),
				rhs.dim()
			)));
		}
		match (lhs, rhs) {
			(Self::Zero { .. }, other) | (other, Self::Zero { .. }) => Ok(other),
			(lhs, rhs) => Ok(Self::MinkowskiSum {
				lhs: Box::new(lhs),
				rhs: Box::new(rhs),
			}),
		}
	}

	fn cartesian(blocks: Vec<Self>) -> Self {
		Self::CartesianArray { blocks }
	}

	fn is_disjoint_from(&self, half: &HalfSpace<N>) -> Result<bool> {
		if half.dim() != self.dim() {
			return Err(EngineError::shape(format!(
				"half-space of dimension {} tested against a {}-dimensional set",
				half.dim(),
				self.dim()
			)));
		}
		let negated = half.normal.mapv(|v| -v);
		let min = -self.support(&negated.view())?;
		Ok(min > half.offset)
	}

	fn may_intersect_any(&self, halves: &[HalfSpace<N>]) -> Result<bool> {
		for half in halves {
			if !self.is_disjoint_from(half)? {
				return Ok(true);
			}
		}
		Ok(false)
	}

	fn ensure_finite(&self) -> Result<()> {
		let finite_arr = |arr: &Array1<N>| arr.iter().all(|v| v.is_finite());
		match self {
			Self::Interval { lo, hi } => {
				if !lo.is_finite() || !hi.is_finite() {
					return Err(EngineError::numeric("non-finite interval bound"));
				}
				if lo > hi {
					return Err(EngineError::numeric("empty interval where a set was expected"));
				}
			}
			Self::Hyperrectangle { center, radius } => {
				if !finite_arr(center) || !finite_arr(radius) {
					return Err(EngineError::numeric("non-finite hyperrectangle"));
				}
				if radius.iter().any(|r| *r < N::zero()) {
					return Err(EngineError::numeric("negative hyperrectangle radius"));
				}
			}
			Self::Zonotope { center, generators } => {
				if !finite_arr(center) || generators.iter().any(|v| !v.is_finite()) {
					return Err(EngineError::numeric("non-finite zonotope"));
				}
			}
			Self::Polygon { vertices } => {
				if vertices.iter().any(|v| !finite_arr(v)) {
					return Err(EngineError::numeric("non-finite polygon vertex"));
				}
			}
			Self::TemplatePolytope {
				offsets,
				box_lo,
				box_hi,
				..
			} => {
				if offsets.iter().any(|v| !v.is_finite())
					|| !finite_arr(box_lo) || !finite_arr(box_hi)
				{
					return Err(EngineError::numeric("non-finite template polytope"));
				}
			}
			Self::Singleton { point } => {
				if !finite_arr(point) {
					return Err(EngineError::numeric("non-finite singleton"));
				}
			}
			Self::Zero { .. } => {}
			Self::LinearMap { matrix, operand } => {
				if matrix.iter().any(|v| !v.is_finite()) {
					return Err(EngineError::numeric("non-finite linear-map matrix"));
				}
				operand.ensure_finite()?;
			}
			Self::MinkowskiSum { lhs, rhs } => {
				lhs.ensure_finite()?;
				rhs.ensure_finite()?;
			}
			Self::SumArray(arr) => {
				for term in arr.terms() {
					term.ensure_finite()?;
				}
			}
			Self::CartesianArray { blocks } => {
				for block in blocks {
					block.ensure_finite()?;
				}
			}
			Self::Intersection {
				operand,
				constraints,
			} => {
				operand.ensure_finite()?;
				for half in constraints {
					if !finite_arr(&half.normal) || !half.offset.is_finite() {
						return Err(EngineError::numeric("non-finite invariant constraint"));
					}
				}
			}
		}
		Ok(())
	}
}
