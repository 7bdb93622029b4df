use std::cmp::Ordering;

use ndarray::{Array1, Array2};
use vector_map::VecMap;

use crate::error::{EngineError, Result};
use crate::sets::{LazySet, SetOps, SetScalar, SumArray};

/// Per-block overapproximation choice. `Passthrough` and `Keep` both leave
/// the lazy value untouched; the former is an init-time policy participating
/// in the single-block shortcut, the latter an iter-time one.
#[derive(Debug, Clone, PartialEq)]
pub enum SetPolicy<N>
where
	N: SetScalar,
{
	/// Tight 1-dimensional interval from two support queries.
	Interval,
	/// Axis-aligned bounding hyperrectangle.
	Hyperrectangle,
	/// A polygon within Hausdorff distance epsilon of the set (2-D blocks).
	EpsPolygon(N),
	/// Template-direction polytope.
	Template(TemplateKind),
	/// No overapproximation; the lazy value is the result.
	Passthrough,
	/// Keep the lazy expression as-is.
	Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
	/// The 2n axis directions.
	Box,
	/// Axis directions plus all pairwise diagonal combinations.
	Octagon,
	/// Axis directions plus the 2^n corner diagonals.
	BoxDiag,
}

impl<N> SetPolicy<N>
where
	N: SetScalar,
{
	/// Whether the policy evaluates a fixed direction template, which makes
	/// it safe to forget prior summands after a collapse. Epsilon-close
	/// refinement depends on all summands and must retain them.
	pub fn has_constant_directions(&self) -> bool {
		matches!(
			self,
			Self::Interval | Self::Hyperrectangle | Self::Template(_)
		)
	}
}

/// Uniform and per-block policy assignment. An explicit per-block entry
/// takes precedence over the uniform policy; blocks with neither get the
/// interval default in one dimension and the hyperrectangle default above.
#[derive(Clone)]
pub struct BlockOptions<N>
where
	N: SetScalar,
{
	uniform: Option<SetPolicy<N>>,
	overrides: VecMap<usize, SetPolicy<N>>,
}

impl<N> Default for BlockOptions<N>
where
	N: SetScalar,
{
	fn default() -> Self {
		Self {
			uniform: None,
			overrides: VecMap::new(),
		}
	}
}

impl<N> BlockOptions<N>
where
	N: SetScalar,
{
	pub fn uniform(policy: SetPolicy<N>) -> Self {
		Self {
			uniform: Some(policy),
			overrides: VecMap::new(),
		}
	}

	pub fn with_override(mut self, block: usize, policy: SetPolicy<N>) -> Self {
		self.overrides.insert(block, policy);
		self
	}

	pub fn resolve(&self, block: usize, block_dim: usize) -> SetPolicy<N> {
		if let Some(policy) = self.overrides.get(&block) {
			return policy.clone();
		}
		if let Some(policy) = &self.uniform {
			return policy.clone();
		}
		if block_dim == 1 {
			SetPolicy::Interval
		} else {
			SetPolicy::Hyperrectangle
		}
	}
}

/// Overapproximates `set` under the given policy. Only outward error is
/// introduced; the result is always a superset.
pub fn overapproximate<N>(set: &LazySet<N>, policy: &SetPolicy<N>) -> Result<LazySet<N>>
where
	N: SetScalar,
{
	match policy {
		SetPolicy::Passthrough | SetPolicy::Keep => Ok(set.clone()),
		SetPolicy::Interval => {
			if set.dim() != 1 {
				return Err(EngineError::shape(format!(
					"interval policy on a {}-dimensional block",
					set.dim()
				)));
			}
			interval_hull(set)
		}
		SetPolicy::Hyperrectangle => box_hull(set),
		SetPolicy::EpsPolygon(eps) => match set.dim() {
			1 => interval_hull(set),
			2 => eps_polygon(set, *eps),
			d => Err(EngineError::shape(format!(
				"epsilon-close polygon policy on a {d}-dimensional block"
			))),
		},
		SetPolicy::Template(kind) => match set.dim() {
			1 => interval_hull(set),
			2 => {
				let pairs = support_pairs(set, template_directions(*kind, 2))?;
				polygon_from_supports(pairs)
			}
			_ => {
				let directions = template_directions(*kind, set.dim());
				let mut offsets = Vec::with_capacity(directions.len());
				for dir in &directions {
					offsets.push(set.support(&dir.view())?);
				}
				let (box_lo, box_hi) = set.bounding_box()?;
				Ok(LazySet::TemplatePolytope {
					directions,
					offsets,
					box_lo,
					box_hi,
				})
			}
		},
	}
}

impl<N> SumArray<N>
where
	N: SetScalar,
{
	/// Overapproximates the whole array to a fresh set. Policies with
	/// constant directions allow the arena to forget its history; all other
	/// policies keep every summand for later refinement.
	pub fn collapse(&mut self, policy: &SetPolicy<N>) -> Result<LazySet<N>> {
		let approx = overapproximate(&self.current(), policy)?;
		if policy.has_constant_directions() {
			self.replace_with(approx.clone());
		}
		Ok(approx)
	}
}

/// The direction set of a template kind in the given dimension.
pub fn template_directions<N>(kind: TemplateKind, dim: usize) -> Vec<Array1<N>>
where
	N: SetScalar,
{
	let mut directions = Vec::new();
	for i in 0..dim {
		for sign in [N::one(), -N::one()] {
			let mut d = Array1::zeros(dim);
			d[i] = sign;
			directions.push(d);
		}
	}
	match kind {
		TemplateKind::Box => {}
		TemplateKind::Octagon => {
			for i in 0..dim {
				for j in (i + 1)..dim {
					for si in [N::one(), -N::one()] {
						for sj in [N::one(), -N::one()] {
							let mut d = Array1::zeros(dim);
							d[i] = si;
							d[j] = sj;
							directions.push(d);
						}
					}
				}
			}
		}
		TemplateKind::BoxDiag => {
			if dim > 1 {
				for mask in 0..(1usize << dim) {
					let mut d = Array1::zeros(dim);
					for i in 0..dim {
						d[i] = if mask & (1 << i) != 0 {
							-N::one()
						} else {
							N::one()
						};
					}
					directions.push(d);
				}
			}
		}
	}
	directions
}

fn support_pairs<N>(
	set: &LazySet<N>,
	directions: Vec<Array1<N>>,
) -> Result<Vec<(Array1<N>, N)>>
where
	N: SetScalar,
{
	let mut pairs = Vec::with_capacity(directions.len());
	for dir in directions {
		let offset = set.support(&dir.view())?;
		pairs.push((dir, offset));
	}
	Ok(pairs)
}

/// Tight interval hull of a 1-dimensional set.
fn interval_hull<N>(set: &LazySet<N>) -> Result<LazySet<N>>
where
	N: SetScalar,
{
	let up = Array1::from_elem(1, N::one());
	let down = Array1::from_elem(1, -N::one());
	let hi = set.support(&up.view())?;
	let lo = -set.support(&down.view())?;
	if lo > hi {
		// Rounding can invert degenerate hulls by a hair; wider gaps mean
		// the expression was empty.
		let tol = N::epsilon().sqrt() * (N::one() + hi.abs());
		if lo - hi > tol {
			return Err(EngineError::numeric("empty interval hull"));
		}
		let mid = (lo + hi) / N::from_f64(2.0).unwrap();
		return LazySet::interval(mid, mid);
	}
	LazySet::interval(lo, hi)
}

/// Axis-aligned bounding hyperrectangle.
fn box_hull<N>(set: &LazySet<N>) -> Result<LazySet<N>>
where
	N: SetScalar,
{
	let (lo, hi) = set.bounding_box()?;
	let half = N::from_f64(0.5).unwrap();
	let center = (&lo + &hi).mapv(|v| v * half);
	let radius = (&hi - &lo).mapv(|v| {
		let r = v * half;
		// Clamp hairline negatives from rounding.
		if r < N::zero() && -r <= N::epsilon().sqrt() {
			N::zero()
		} else {
			r
		}
	});
	LazySet::hyperrectangle(center, radius)
}

/// Builds the polygon whose edges are the supporting lines
/// `direction · x = offset`, with vertices from adjacent constraint pairs.
fn polygon_from_supports<N>(mut pairs: Vec<(Array1<N>, N)>) -> Result<LazySet<N>>
where
	N: SetScalar,
{
	if pairs.len() < 3 {
		return Err(EngineError::numeric(
			"cannot bound a polygon with fewer than three constraints",
		));
	}
	pairs.sort_by(|a, b| {
		let aa = a.0[1].atan2(a.0[0]);
		let ab = b.0[1].atan2(b.0[0]);
		aa.partial_cmp(&ab).unwrap_or(Ordering::Equal)
	});
	let tiny = N::epsilon().sqrt();
	let mut vertices: Vec<Array1<N>> = Vec::with_capacity(pairs.len());
	for i in 0..pairs.len() {
		let (a1, b1) = &pairs[i];
		let (a2, b2) = &pairs[(i + 1) % pairs.len()];
		let det = a1[0] * a2[1] - a1[1] * a2[0];
		if det.abs() <= tiny {
			continue;
		}
		let x = (*b1 * a2[1] - *b2 * a1[1]) / det;
		let y = (a1[0] * *b2 - a2[0] * *b1) / det;
		let vertex = Array1::from_vec(vec![x, y]);
		if let Some(last) = vertices.last() {
			if (&vertex - last).iter().map(|v| v.abs()).sum::<N>() <= tiny {
				continue;
			}
		}
		vertices.push(vertex);
	}
	if vertices.len() > 1 {
		let first = vertices[0].clone();
		let last = vertices.last().unwrap();
		if (&first - last).iter().map(|v| v.abs()).sum::<N>() <= tiny {
			vertices.pop();
		}
	}
	LazySet::polygon(vertices)
}

/// Sector of the refinement: the arc between two directions with their
/// support points.
struct Sector<N>
where
	N: SetScalar,
{
	d1: Array1<N>,
	p1: Array1<N>,
	d2: Array1<N>,
	p2: Array1<N>,
}

/// Polygonal overapproximation within Hausdorff distance `eps`, by
/// splitting sectors until the supporting line and the chord of each arc
/// are closer than `eps`. The refinement cap keeps adversarial inputs from
/// looping; hitting it only loosens the result, never unsounds it.
fn eps_polygon<N>(set: &LazySet<N>, eps: N) -> Result<LazySet<N>>
where
	N: SetScalar,
{
	let east = Array1::from_vec(vec![N::one(), N::zero()]);
	let north = Array1::from_vec(vec![N::zero(), N::one()]);
	let west = Array1::from_vec(vec![-N::one(), N::zero()]);
	let south = Array1::from_vec(vec![N::zero(), -N::one()]);
	let pe = set.support_point(&east.view())?;
	let pn = set.support_point(&north.view())?;
	let pw = set.support_point(&west.view())?;
	let ps = set.support_point(&south.view())?;

	// Pushed in reverse so the eastmost sector pops first and the emitted
	// constraints stay in counterclockwise order.
	let mut stack = vec![
		Sector {
			d1: south.clone(),
			p1: ps.clone(),
			d2: east.clone(),
			p2: pe.clone(),
		},
		Sector {
			d1: west.clone(),
			p1: pw.clone(),
			d2: south,
			p2: ps,
		},
		Sector {
			d1: north.clone(),
			p1: pn.clone(),
			d2: west,
			p2: pw,
		},
		Sector {
			d1: east,
			p1: pe,
			d2: north,
			p2: pn,
		},
	];

	let mut out: Vec<(Array1<N>, N)> = Vec::new();
	let mut cap = 4096usize;
	let mut capped = false;
	let tiny = N::epsilon().sqrt();
	while let Some(sector) = stack.pop() {
		let chord = &sector.p2 - &sector.p1;
		let chord_norm = (chord[0] * chord[0] + chord[1] * chord[1]).sqrt();
		if chord_norm <= tiny {
			// Both directions see the same point; the sector is exact.
			let offset = sector.d1.dot(&sector.p1);
			out.push((sector.d1, offset));
			continue;
		}
		let ndir = Array1::from_vec(vec![chord[1] / chord_norm, -chord[0] / chord_norm]);
		let q = set.support_point(&ndir.view())?;
		let err = ndir.dot(&q) - ndir.dot(&sector.p1);
		if err <= eps || cap == 0 {
			if err > eps {
				capped = true;
			}
			let offset = sector.d1.dot(&sector.p1);
			out.push((sector.d1, offset));
			continue;
		}
		cap -= 1;
		stack.push(Sector {
			d1: ndir.clone(),
			p1: q.clone(),
			d2: sector.d2,
			p2: sector.p2,
		});
		stack.push(Sector {
			d1: sector.d1,
			p1: sector.p1,
			d2: ndir,
			p2: q,
		});
	}
	if capped {
		log::warn!("epsilon-close refinement hit its cap; result is looser than {eps}");
	}
	polygon_from_supports(out)
}

#[cfg(test)]
mod approx_tests {
	use ndarray::{arr1, arr2};

	use super::*;

	fn close(a: f64, b: f64) {
		assert!((a - b).abs() < 1e-9, "{a} vs {b}");
	}

	#[test]
	fn policy_resolution_precedence() {
		let opts = BlockOptions::uniform(SetPolicy::<f64>::Hyperrectangle)
			.with_override(1, SetPolicy::Template(TemplateKind::Octagon));
		assert_eq!(opts.resolve(0, 2), SetPolicy::Hyperrectangle);
		assert_eq!(
			opts.resolve(1, 2),
			SetPolicy::Template(TemplateKind::Octagon)
		);
		let defaults = BlockOptions::<f64>::default();
		assert_eq!(defaults.resolve(0, 1), SetPolicy::Interval);
		assert_eq!(defaults.resolve(3, 2), SetPolicy::Hyperrectangle);
	}

	#[test]
	fn box_hull_of_rotated_square() {
		let square = LazySet::hyperrectangle(arr1(&[0.0, 0.0]), arr1(&[1.0, 1.0])).unwrap();
		let c = std::f64::consts::FRAC_1_SQRT_2;
		let rot = arr2(&[[c, -c], [c, c]]);
		let turned = LazySet::linear_map(rot, square).unwrap();
		let hull = overapproximate(&turned, &SetPolicy::Hyperrectangle).unwrap();
		match hull {
			LazySet::Hyperrectangle { center, radius } => {
				close(center[0], 0.0);
				close(center[1], 0.0);
				close(radius[0], 2.0 * c);
				close(radius[1], 2.0 * c);
			}
			other => panic!("expected a hyperrectangle, got {other:?}"),
		}
	}

	#[test]
	fn interval_policy_needs_one_dimension() {
		let square = LazySet::hyperrectangle(arr1(&[0.0, 0.0]), arr1(&[1.0, 1.0])).unwrap();
		assert!(matches!(
			overapproximate(&square, &SetPolicy::Interval),
			Err(EngineError::Shape(_))
		));
	}

	#[test]
	fn template_direction_counts() {
		assert_eq!(template_directions::<f64>(TemplateKind::Box, 3).len(), 6);
		assert_eq!(template_directions::<f64>(TemplateKind::Octagon, 2).len(), 8);
		assert_eq!(
			template_directions::<f64>(TemplateKind::BoxDiag, 3).len(),
			6 + 8
		);
		assert_eq!(template_directions::<f64>(TemplateKind::BoxDiag, 1).len(), 2);
	}

	#[test]
	fn box_template_recovers_square() {
		let square = LazySet::hyperrectangle(arr1(&[1.0, 2.0]), arr1(&[1.0, 1.0])).unwrap();
		let poly = overapproximate(&square, &SetPolicy::Template(TemplateKind::Box)).unwrap();
		match &poly {
			LazySet::Polygon { vertices } => assert_eq!(vertices.len(), 4),
			other => panic!("expected a polygon, got {other:?}"),
		}
		for d in [[1.0, 0.0], [0.0, 1.0], [-1.0, -1.0]] {
			let dir = arr1(&d);
			close(
				poly.support(&dir.view()).unwrap(),
				square.support(&dir.view()).unwrap(),
			);
		}
	}

	#[test]
	fn octagon_tightens_the_diagonal() {
		let square = LazySet::hyperrectangle(arr1(&[0.0, 0.0]), arr1(&[1.0, 1.0])).unwrap();
		let c = std::f64::consts::FRAC_1_SQRT_2;
		let rot = arr2(&[[c, -c], [c, c]]);
		let turned = LazySet::linear_map(rot, square).unwrap();
		let boxed = overapproximate(&turned, &SetPolicy::Hyperrectangle).unwrap();
		let oct = overapproximate(&turned, &SetPolicy::Template(TemplateKind::Octagon)).unwrap();
		let diag = arr1(&[1.0, 1.0]);
		let true_sup = turned.support(&diag.view()).unwrap();
		let oct_sup = oct.support(&diag.view()).unwrap();
		let box_sup = boxed.support(&diag.view()).unwrap();
		assert!(oct_sup >= true_sup - 1e-9);
		assert!(oct_sup < box_sup - 1e-6);
	}

	#[test]
	fn high_dimensional_template_keeps_box_bounds() {
		let cube =
			LazySet::hyperrectangle(arr1(&[0.0, 0.0, 0.0]), arr1(&[1.0, 2.0, 3.0])).unwrap();
		let poly = overapproximate(&cube, &SetPolicy::Template(TemplateKind::BoxDiag)).unwrap();
		let dir = arr1(&[1.0, 0.0, 0.0]);
		close(poly.support(&dir.view()).unwrap(), 1.0);
		// An off-template direction falls back on the bounding box.
		let skew = arr1(&[0.5, 1.0, 0.0]);
		close(poly.support(&skew.view()).unwrap(), 2.5);
	}

	#[test]
	fn eps_polygon_is_close_and_outer() {
		let zono = LazySet::zonotope(
			arr1(&[0.0, 0.0]),
			arr2(&[[1.0, 0.0, 0.5], [0.0, 1.0, 0.5]]),
		)
		.unwrap();
		let eps = 0.01;
		let poly = overapproximate(&zono, &SetPolicy::EpsPolygon(eps)).unwrap();
		for k in 0..16 {
			let theta = (k as f64) * std::f64::consts::PI / 8.0;
			let dir = arr1(&[theta.cos(), theta.sin()]);
			let true_sup = zono.support(&dir.view()).unwrap();
			let poly_sup = poly.support(&dir.view()).unwrap();
			assert!(poly_sup >= true_sup - 1e-9, "not outer at {theta}");
			assert!(poly_sup <= true_sup + 2.0 * eps, "not close at {theta}");
		}
	}

	#[test]
	fn collapse_forgets_only_with_constant_directions() {
		let terms = vec![
			LazySet::singleton(arr1(&[1.0, 0.0])),
			LazySet::singleton(arr1(&[0.0, 1.0])),
		];
		let mut boxy = SumArray::from_terms(terms.clone()).unwrap();
		let collapsed = boxy.collapse(&SetPolicy::Hyperrectangle).unwrap();
		assert_eq!(boxy.len(), 1);
		assert_eq!(boxy.collapsed_len(), 1);
		close(collapsed.support(&arr1(&[1.0, 0.0]).view()).unwrap(), 1.0);

		let mut eps = SumArray::from_terms(terms).unwrap();
		let _ = eps.collapse(&SetPolicy::EpsPolygon(0.1)).unwrap();
		assert_eq!(eps.len(), 2);
		assert_eq!(eps.collapsed_len(), 0);
	}
}
