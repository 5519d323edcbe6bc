use crate::gam::faer_ndarray::FaerQr;
use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for a single B-spline basis expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasisConfig {
    pub num_knots: usize,
    pub degree: usize,
}

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("Data range is invalid: start ({0}) must be strictly less than end ({1}).")]
    InvalidRange(f64, f64),

    #[error("Knot vector of length {knots} is too short for a degree {degree} spline.")]
    InvalidKnotVector { knots: usize, degree: usize },

    #[error(
        "Penalty order ({order}) must be positive and less than the number of basis functions ({num_basis})."
    )]
    InvalidPenaltyOrder { order: usize, num_basis: usize },

    #[error("Tensor product marginals have {left} and {right} rows; they must match.")]
    MarginalRowMismatch { left: usize, right: usize },
}

/// Creates a B-spline basis matrix over uniformly spaced knots and returns it with
/// the full knot vector.
///
/// `data_range` fixes the boundary knots. It must be the range of the training
/// data, also when evaluating new data, so that the basis stays identical between
/// fitting and prediction. The basis has `num_internal_knots + degree + 1` columns.
pub fn create_bspline_basis(
    data: ArrayView1<f64>,
    data_range: (f64, f64),
    num_internal_knots: usize,
    degree: usize,
) -> Result<(Array2<f64>, Array1<f64>), BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if !(data_range.0 < data_range.1) {
        return Err(BasisError::InvalidRange(data_range.0, data_range.1));
    }

    let knot_vector = internal::generate_full_knot_vector(data_range, num_internal_knots, degree);
    let basis_matrix = create_bspline_basis_with_knots(data, knot_vector.view(), degree)?;
    Ok((basis_matrix, knot_vector))
}

/// Evaluates a B-spline basis on a previously generated knot vector. Points
/// outside the boundary knots are evaluated at the nearest boundary.
pub fn create_bspline_basis_with_knots(
    data: ArrayView1<f64>,
    knot_vector: ArrayView1<f64>,
    degree: usize,
) -> Result<Array2<f64>, BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if knot_vector.len() < 2 * (degree + 1) {
        return Err(BasisError::InvalidKnotVector {
            knots: knot_vector.len(),
            degree,
        });
    }

    // For a knot vector of length k and degree d there are k - d - 1 basis functions.
    let num_basis_functions = knot_vector.len() - degree - 1;
    let mut basis_matrix = Array2::zeros((data.len(), num_basis_functions));
    for (i, &x) in data.iter().enumerate() {
        let basis_row = internal::evaluate_splines_at_point(x, degree, knot_vector);
        basis_matrix.row_mut(i).assign(&basis_row);
    }
    Ok(basis_matrix)
}

/// Creates the P-spline penalty `S = D' D`, where `D` takes `order`-th differences
/// of adjacent coefficients.
pub fn create_difference_penalty_matrix(
    num_basis_functions: usize,
    order: usize,
) -> Result<Array2<f64>, BasisError> {
    if order == 0 || order >= num_basis_functions {
        return Err(BasisError::InvalidPenaltyOrder {
            order,
            num_basis: num_basis_functions,
        });
    }

    let mut d = Array2::<f64>::eye(num_basis_functions);
    for _ in 0..order {
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }
    Ok(d.t().dot(&d))
}

/// Reparameterizes a basis so that every column sums to zero over the data,
/// removing its confounding with the model intercept.
///
/// Returns the constrained basis (one fewer column) and the transform `Z` with
/// `B_constrained = B Z`. `Z` spans the null space of `c = B' 1`, taken from the
/// trailing columns of the QR decomposition of `c`.
pub fn apply_sum_to_zero_constraint(basis_matrix: ArrayView2<f64>) -> (Array2<f64>, Array2<f64>) {
    let c = basis_matrix.sum_axis(Axis(0)).insert_axis(Axis(1));
    let (q, _) = c.qr();
    let z_transform = q.slice(s![.., 1..]).to_owned();
    let constrained_basis = basis_matrix.dot(&z_transform);
    (constrained_basis, z_transform)
}

/// Row-wise Kronecker product of two marginal bases. Column `a * kb + b` of the
/// result is the product of column `a` of `left` and column `b` of `right`.
pub fn row_wise_tensor_product(
    left: ArrayView2<f64>,
    right: ArrayView2<f64>,
) -> Result<Array2<f64>, BasisError> {
    if left.nrows() != right.nrows() {
        return Err(BasisError::MarginalRowMismatch {
            left: left.nrows(),
            right: right.nrows(),
        });
    }
    let (n, ka) = left.dim();
    let kb = right.ncols();
    let mut out = Array2::zeros((n, ka * kb));
    for (mut out_row, (l_row, r_row)) in out
        .axis_iter_mut(Axis(0))
        .zip(left.axis_iter(Axis(0)).zip(right.axis_iter(Axis(0))))
    {
        for (a, &la) in l_row.iter().enumerate() {
            if la == 0.0 {
                continue;
            }
            out_row
                .slice_mut(s![a * kb..(a + 1) * kb])
                .zip_mut_with(&r_row, |o, &rb| *o = la * rb);
        }
    }
    Ok(out)
}

/// Computes the Kronecker product `A (x) B`.
pub fn kronecker_product(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let (a_rows, a_cols) = a.dim();
    let (b_rows, b_cols) = b.dim();
    let mut result = Array2::zeros((a_rows * b_rows, a_cols * b_cols));
    for ((i, j), &a_val) in a.indexed_iter() {
        if a_val == 0.0 {
            continue;
        }
        result
            .slice_mut(s![i * b_rows..(i + 1) * b_rows, j * b_cols..(j + 1) * b_cols])
            .assign(&(b * a_val));
    }
    result
}

/// Builds the two marginal penalties of an anisotropic tensor-product smooth:
/// `S_left (x) I` penalizes roughness along the first axis and `I (x) S_right`
/// along the second, each with its own smoothing parameter.
pub fn tensor_product_penalties(
    left_penalty: &Array2<f64>,
    right_penalty: &Array2<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let left_eye = Array2::<f64>::eye(left_penalty.nrows());
    let right_eye = Array2::<f64>::eye(right_penalty.nrows());
    (
        kronecker_product(left_penalty, &right_eye),
        kronecker_product(&left_eye, right_penalty),
    )
}

mod internal {
    use super::*;

    /// Generates the full knot vector with `degree + 1` repeated boundary knots.
    pub(super) fn generate_full_knot_vector(
        data_range: (f64, f64),
        num_internal_knots: usize,
        degree: usize,
    ) -> Array1<f64> {
        let (min_val, max_val) = data_range;
        let h = (max_val - min_val) / (num_internal_knots as f64 + 1.0);
        let internal_knots =
            Array::from_iter((1..=num_internal_knots).map(|i| min_val + i as f64 * h));

        let mut knots = Vec::with_capacity(num_internal_knots + 2 * (degree + 1));
        knots.extend(std::iter::repeat_n(min_val, degree + 1));
        knots.extend(internal_knots.iter().copied());
        knots.extend(std::iter::repeat_n(max_val, degree + 1));
        Array1::from_vec(knots)
    }

    /// Evaluates all B-spline basis functions at a single point with the Cox-de Boor
    /// recurrence on the knot span containing `x`.
    pub(super) fn evaluate_splines_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
    ) -> Array1<f64> {
        let num_basis = knots.len() - degree - 1;
        let x = x.clamp(knots[degree], knots[num_basis]);

        // Span `mu` with knots[mu] <= x < knots[mu + 1]; the right boundary belongs
        // to the last non-degenerate span.
        let mut mu = degree;
        while mu < num_basis - 1 && knots[mu + 1] <= x {
            mu += 1;
        }

        let mut b = vec![0.0; degree + 1];
        let mut left = vec![0.0; degree + 1];
        let mut right = vec![0.0; degree + 1];
        b[0] = 1.0;
        for j in 1..=degree {
            left[j] = x - knots[mu + 1 - j];
            right[j] = knots[mu + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom > 1e-12 { b[r] / denom } else { 0.0 };
                b[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            b[j] = saved;
        }

        let mut basis_values = Array1::zeros(num_basis);
        for (i, &value) in b.iter().enumerate() {
            basis_values[mu - degree + i] = value;
        }
        basis_values
    }
}
