use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl FaerStorage<'_> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy view of an ndarray matrix as a faer matrix when the memory layout
/// allows it, otherwise an owned copy.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let borrowed = array.as_slice_memory_order().and_then(|slice| {
            if array.is_standard_layout() {
                Some(MatRef::from_row_major_slice(slice, rows, cols))
            } else if array.t().is_standard_layout() {
                Some(MatRef::from_column_major_slice(slice, rows, cols))
            } else {
                None
            }
        });
        let storage = match borrowed {
            Some(view) => FaerStorage::Borrowed(view),
            None => FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

/// Column-vector counterpart of [`FaerArrayView`].
pub struct FaerColView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerColView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let storage = match array.as_slice() {
            Some(slice) => FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, len, 1)),
            None => FaerStorage::Owned(Mat::from_fn(len, 1, |i, _| array[i])),
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub trait FaerEigh {
    /// Eigenvalues (ascending) and eigenvectors of a symmetric matrix.
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        Ok((diag_to_array(eigen.S()), mat_to_array(eigen.U())))
    }
}

/// Log pseudo-determinant of a symmetric positive semi-definite matrix: the sum of
/// the logs of the eigenvalues above `relative_tolerance * max_eigenvalue`.
/// Returns the log-determinant and the numerical rank.
pub fn log_pseudo_determinant(
    matrix: &Array2<f64>,
    relative_tolerance: f64,
) -> Result<(f64, usize), FaerLinalgError> {
    if matrix.nrows() == 0 {
        return Ok((0.0, 0));
    }
    let (eigenvalues, _) = matrix.eigh(Side::Lower)?;
    let max_eig = eigenvalues.iter().fold(0.0_f64, |acc, &v| acc.max(v));
    if max_eig <= 0.0 {
        return Ok((0.0, 0));
    }
    let threshold = max_eig * relative_tolerance;
    let (log_det, rank) = eigenvalues
        .iter()
        .filter(|&&v| v > threshold)
        .fold((0.0, 0usize), |(sum, count), &v| (sum + v.ln(), count + 1));
    Ok((log_det, rank))
}

/// A Cholesky factor `A = L L'` that can solve, invert and report on `A`.
pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let rhs_view = FaerColView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        mat_to_array(sol.as_ref())
    }

    /// Diagonal of the lower-triangular factor `L`.
    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }

    /// `log|A| = 2 * sum(log(diag(L)))`.
    pub fn log_determinant(&self) -> f64 {
        2.0 * self.diag().mapv(f64::ln).sum()
    }

    /// Ratio of the smallest to the largest pivot of `L`. Values near machine
    /// precision mean `A` is numerically singular.
    pub fn pivot_ratio(&self) -> f64 {
        let diag = self.diag();
        let (min, max) = diag
            .iter()
            .fold((f64::INFINITY, 0.0_f64), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if max > 0.0 { min / max } else { 0.0 }
    }

    pub fn inverse(&self) -> Array2<f64> {
        let n = self.factor.L().nrows();
        self.solve_mat(&Array2::eye(n))
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

pub trait FaerQr {
    /// Full `Q` and `R` of a QR decomposition.
    fn qr(&self) -> (Array2<f64>, Array2<f64>);
}

impl<S: Data<Elem = f64>> FaerQr for ArrayBase<S, Ix2> {
    fn qr(&self) -> (Array2<f64>, Array2<f64>) {
        let faer_view = FaerArrayView::new(self);
        let qr = faer_view.as_ref().qr();
        let q = qr.compute_Q();
        let r = qr.R();
        (mat_to_array(q.as_ref()), mat_to_array(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn cholesky_solves_and_inverts_spd_system() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let factor = a.cholesky(Side::Lower).unwrap();
        let b = array![1.0, 2.0, 3.0];
        let x = factor.solve_vec(&b);
        let residual = a.dot(&x) - &b;
        assert!(residual.iter().all(|r| r.abs() < 1e-12));

        let product = a.dot(&factor.inverse());
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(product[(i, j)], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn log_determinant_matches_diagonal_matrix() {
        let a = array![[2.0, 0.0], [0.0, 8.0]];
        let factor = a.cholesky(Side::Lower).unwrap();
        assert_abs_diff_eq!(factor.log_determinant(), 16.0_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(factor.pivot_ratio(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn pseudo_determinant_ignores_null_space() {
        // Rank-one matrix v v' with v = (1, 2): the only nonzero eigenvalue is 5.
        let s = array![[1.0, 2.0], [2.0, 4.0]];
        let (log_det, rank) = log_pseudo_determinant(&s, 1e-10).unwrap();
        assert_eq!(rank, 1);
        assert_abs_diff_eq!(log_det, 5.0_f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn qr_first_column_spans_input_vector() {
        let c = array![[1.0], [1.0], [1.0], [1.0]];
        let (q, r) = c.qr();
        assert_eq!(q.shape(), &[4, 4]);
        assert_abs_diff_eq!(r[(0, 0)].abs(), 2.0, epsilon = 1e-12);
        // Remaining columns are orthogonal to c.
        for j in 1..4 {
            assert_abs_diff_eq!(q.column(j).sum(), 0.0, epsilon = 1e-12);
        }
    }
}
