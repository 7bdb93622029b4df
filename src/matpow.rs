use std::ops::Range;

use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array2};
use sprs::CsMat;

use crate::error::{EngineError, Result};
use crate::sets::SetScalar;

/// A handle producing row blocks of successive powers of the discretised
/// transition matrix. After `k - 1` calls to [`advance`](Self::advance) the
/// handle yields rows of the k-th power.
pub trait MatrixPower<N>
where
	N: SetScalar,
{
	/// The number of rows (and columns) of the matrix.
	fn dim(&self) -> usize;

	/// Moves the handle from the k-th to the (k+1)-th power.
	fn advance(&mut self) -> Result<()>;

	/// The dense row block `rows` of the current power, all columns.
	fn row_block(&mut self, rows: Range<usize>) -> Result<Array2<N>>;

	/// The sub-block `rows x cols` of the current power, or `None` when the
	/// block is structurally zero and can be skipped.
	fn sub_block(&mut self, rows: Range<usize>, cols: Range<usize>) -> Result<Option<Array2<N>>>;
}

fn require_square(rows: usize, cols: usize) -> Result<()> {
	if rows != cols {
		return Err(EngineError::shape(format!(
			"transition matrix must be square, got {rows}x{cols}"
		)));
	}
	Ok(())
}

/// Sparse backend: the current power is stored explicitly in CSR form and
/// advanced by a sparse-by-sparse product.
pub struct SparsePower<N>
where
	N: SetScalar,
{
	step: CsMat<N>,
	current: CsMat<N>,
}

impl<N> SparsePower<N>
where
	N: SetScalar,
{
	pub fn new(phi: CsMat<N>) -> Result<Self> {
		require_square(phi.rows(), phi.cols())?;
		let step = phi.to_csr();
		let current = step.clone();
		Ok(Self { step, current })
	}
}

impl<N> MatrixPower<N> for SparsePower<N>
where
	N: SetScalar,
{
	fn dim(&self) -> usize {
		self.step.rows()
	}

	fn advance(&mut self) -> Result<()> {
		let next = &self.current * &self.step;
		self.current = next;
		Ok(())
	}

	fn row_block(&mut self, rows: Range<usize>) -> Result<Array2<N>> {
		let mut block = Array2::zeros((rows.len(), self.dim()));
		for (out_row, row) in rows.enumerate() {
			if let Some(view) = self.current.outer_view(row) {
				for (col, &value) in view.iter() {
					block[[out_row, col]] = value;
				}
			}
		}
		Ok(block)
	}

	fn sub_block(&mut self, rows: Range<usize>, cols: Range<usize>) -> Result<Option<Array2<N>>> {
		let mut block = Array2::zeros((rows.len(), cols.len()));
		let mut stored = false;
		for (out_row, row) in rows.enumerate() {
			if let Some(view) = self.current.outer_view(row) {
				for (col, &value) in view.iter() {
					if cols.contains(&col) {
						block[[out_row, col - cols.start]] = value;
						stored = true;
					}
				}
			}
		}
		Ok(if stored { Some(block) } else { None })
	}
}

/// Dense backend: the current power and a scratch buffer are allocated once;
/// advancing multiplies into the scratch and swaps. Nothing allocates inside
/// the loop.
pub struct DensePower<N>
where
	N: SetScalar,
{
	step: Array2<N>,
	current: Array2<N>,
	scratch: Array2<N>,
}

impl<N> DensePower<N>
where
	N: SetScalar,
{
	pub fn new(phi: Array2<N>) -> Result<Self> {
		require_square(phi.nrows(), phi.ncols())?;
		let scratch = Array2::zeros(phi.raw_dim());
		let current = phi.clone();
		Ok(Self {
			step: phi,
			current,
			scratch,
		})
	}
}

impl<N> MatrixPower<N> for DensePower<N>
where
	N: SetScalar,
{
	fn dim(&self) -> usize {
		self.step.nrows()
	}

	fn advance(&mut self) -> Result<()> {
		general_mat_mul(
			N::one(),
			&self.current,
			&self.step,
			N::zero(),
			&mut self.scratch,
		);
		std::mem::swap(&mut self.current, &mut self.scratch);
		Ok(())
	}

	fn row_block(&mut self, rows: Range<usize>) -> Result<Array2<N>> {
		Ok(self.current.slice(s![rows, ..]).to_owned())
	}

	fn sub_block(&mut self, rows: Range<usize>, cols: Range<usize>) -> Result<Option<Array2<N>>> {
		// Dense powers fill in; the dense micro-strategy never skips a slot.
		Ok(Some(self.current.slice(s![rows, cols]).to_owned()))
	}
}

/// The external collaborator computing rows of a matrix exponential.
pub trait ExpRowsOracle<N>
where
	N: SetScalar,
{
	/// The rows `rows` of `exp(m)`.
	fn rows_of_exp(&self, m: &Array2<N>, rows: Range<usize>) -> Result<Array2<N>>;
}

/// Lazy-exponential backend: stores the logarithm `A * delta * k` and
/// advances by adding `A * delta` to it, so the handle at step k always
/// satisfies `current power = exp(A * delta * k)`. Rows are materialised on
/// demand through the oracle.
pub struct LazyExpPower<N, O>
where
	N: SetScalar,
	O: ExpRowsOracle<N>,
{
	log_step: Array2<N>,
	accumulated: Array2<N>,
	oracle: O,
	assume_sparse: bool,
}

impl<N, O> LazyExpPower<N, O>
where
	N: SetScalar,
	O: ExpRowsOracle<N>,
{
	pub fn new(a_delta: Array2<N>, oracle: O, assume_sparse: bool) -> Result<Self> {
		require_square(a_delta.nrows(), a_delta.ncols())?;
		let accumulated = a_delta.clone();
		Ok(Self {
			log_step: a_delta,
			accumulated,
			oracle,
			assume_sparse,
		})
	}
}

impl<N, O> MatrixPower<N> for LazyExpPower<N, O>
where
	N: SetScalar,
	O: ExpRowsOracle<N>,
{
	fn dim(&self) -> usize {
		self.log_step.nrows()
	}

	fn advance(&mut self) -> Result<()> {
		self.accumulated += &self.log_step;
		Ok(())
	}

	fn row_block(&mut self, rows: Range<usize>) -> Result<Array2<N>> {
		let expected = (rows.len(), self.dim());
		let block = self.oracle.rows_of_exp(&self.accumulated, rows)?;
		if block.dim() != expected {
			return Err(EngineError::shape(format!(
				"exponential oracle returned a {}x{} block, expected {}x{}",
				block.nrows(),
				block.ncols(),
				expected.0,
				expected.1
			)));
		}
		Ok(block)
	}

	fn sub_block(&mut self, rows: Range<usize>, cols: Range<usize>) -> Result<Option<Array2<N>>> {
		let full = self.row_block(rows)?;
		let block = full.slice(s![.., cols]).to_owned();
		if self.assume_sparse && block.iter().all(|v| *v == N::zero()) {
			return Ok(None);
		}
		Ok(Some(block))
	}
}

#[cfg(test)]
mod matpow_tests {
	use ndarray::arr2;
	use sprs::TriMat;

	use super::*;

	fn fib_sparse() -> SparsePower<f64> {
		let mut tri = TriMat::new((2, 2));
		tri.add_triplet(0, 1, 1.0);
		tri.add_triplet(1, 0, 1.0);
		tri.add_triplet(1, 1, 1.0);
		SparsePower::new(tri.to_csr()).unwrap()
	}

	#[test]
	fn sparse_and_dense_powers_agree() {
		let mut sparse = fib_sparse();
		let mut dense = DensePower::new(arr2(&[[0.0, 1.0], [1.0, 1.0]])).unwrap();
		for _ in 0..3 {
			sparse.advance().unwrap();
			dense.advance().unwrap();
		}
		let s = sparse.row_block(0..2).unwrap();
		let d = dense.row_block(0..2).unwrap();
		// Both hold the fourth Fibonacci power.
		assert_eq!(d, arr2(&[[2.0, 3.0], [3.0, 5.0]]));
		assert_eq!(s, d);
	}

	#[test]
	fn sparse_sub_blocks_report_structural_zeros() {
		let mut tri = TriMat::new((2, 2));
		tri.add_triplet(0, 0, 2.0);
		tri.add_triplet(1, 1, 3.0);
		let mut power = SparsePower::new(tri.to_csr()).unwrap();
		assert!(power.sub_block(0..1, 1..2).unwrap().is_none());
		assert_eq!(
			power.sub_block(0..1, 0..1).unwrap(),
			Some(arr2(&[[2.0]]))
		);
		power.advance().unwrap();
		assert!(power.sub_block(0..1, 1..2).unwrap().is_none());
		assert_eq!(
			power.sub_block(1..2, 1..2).unwrap(),
			Some(arr2(&[[9.0]]))
		);
	}

	#[test]
	fn dense_sub_blocks_never_skip() {
		let mut power = DensePower::new(arr2(&[[2.0, 0.0], [0.0, 3.0]])).unwrap();
		assert_eq!(
			power.sub_block(0..1, 1..2).unwrap(),
			Some(arr2(&[[0.0]]))
		);
	}

	#[test]
	fn rejects_rectangular_matrices() {
		assert!(DensePower::new(arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]])).is_err());
	}

	/// Truncated Taylor series, good enough for well-scaled test matrices.
	struct TaylorOracle;

	impl ExpRowsOracle<f64> for TaylorOracle {
		fn rows_of_exp(&self, m: &Array2<f64>, rows: Range<usize>) -> Result<Array2<f64>> {
			let n = m.nrows();
			let mut sum = Array2::<f64>::eye(n);
			let mut term = Array2::<f64>::eye(n);
			for k in 1..30 {
				term = term.dot(m).mapv(|v| v / k as f64);
				sum += &term;
			}
			Ok(sum.slice(s![rows, ..]).to_owned())
		}
	}

	#[test]
	fn lazy_exponential_advances_by_addition() {
		let theta = std::f64::consts::FRAC_PI_2;
		let log = arr2(&[[0.0, -theta], [theta, 0.0]]);
		let mut power = LazyExpPower::new(log, TaylorOracle, false).unwrap();
		// exp at step 1 is the quarter rotation.
		let r1 = power.row_block(0..2).unwrap();
		assert!((r1[[0, 0]]).abs() < 1e-9);
		assert!((r1[[0, 1]] + 1.0).abs() < 1e-9);
		power.advance().unwrap();
		// Two quarter turns make the half rotation.
		let r2 = power.row_block(0..2).unwrap();
		assert!((r2[[0, 0]] + 1.0).abs() < 1e-9);
		assert!((r2[[0, 1]]).abs() < 1e-8);
	}

	#[test]
	fn lazy_exponential_sparsity_flag() {
		let zero = arr2(&[[0.0, 0.0], [0.0, 0.0]]);
		// exp(0) is the identity, whose off-diagonal block is all zero.
		let mut sparse = LazyExpPower::new(zero.clone(), TaylorOracle, true).unwrap();
		assert!(sparse.sub_block(0..1, 1..2).unwrap().is_none());
		let mut dense = LazyExpPower::new(zero, TaylorOracle, false).unwrap();
		assert!(dense.sub_block(0..1, 1..2).unwrap().is_some());
	}
}
