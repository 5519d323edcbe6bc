use crate::gam::basis::{
    self, BasisConfig, apply_sum_to_zero_constraint, create_bspline_basis,
    create_bspline_basis_with_knots, create_difference_penalty_matrix, row_wise_tensor_product,
    tensor_product_penalties,
};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

/// The covariate structure of a model. One tag selects between the plain GLM and
/// the spatial GAM so that both are fitted through the same entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    /// Intercept plus a polynomial in standardized depth.
    Linear { depth_degree: usize },
    /// The depth polynomial plus an anisotropic tensor-product smooth of (x, y).
    AdditiveSpatial {
        depth_degree: usize,
        x_basis: BasisConfig,
        y_basis: BasisConfig,
        penalty_order: usize,
    },
}

impl ModelSpec {
    pub fn depth_degree(&self) -> usize {
        match self {
            ModelSpec::Linear { depth_degree } => *depth_degree,
            ModelSpec::AdditiveSpatial { depth_degree, .. } => *depth_degree,
        }
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self, ModelSpec::AdditiveSpatial { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error("Underlying basis function generation failed: {0}")]
    Basis(#[from] basis::BasisError),

    #[error("Covariate columns have mismatched lengths: x={x}, y={y}, depth={depth}.")]
    LengthMismatch { x: usize, y: usize, depth: usize },

    #[error("Covariate '{0}' has no variation; its terms cannot be estimated.")]
    ConstantCovariate(&'static str),

    #[error("No rows were supplied to build the design matrix.")]
    Empty,

    #[error("Design has {found} columns but the blueprint expects {expected}.")]
    ColumnCountMismatch { found: usize, expected: usize },
}

/// Column-oriented covariates for fitting and prediction.
#[derive(Debug, Clone)]
pub struct Covariates {
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub depth: Array1<f64>,
}

impl Covariates {
    pub fn new(x: Array1<f64>, y: Array1<f64>, depth: Array1<f64>) -> Result<Self, ConstructionError> {
        if x.len() != y.len() || x.len() != depth.len() {
            return Err(ConstructionError::LengthMismatch {
                x: x.len(),
                y: y.len(),
                depth: depth.len(),
            });
        }
        Ok(Self { x, y, depth })
    }

    pub fn len(&self) -> usize {
        self.depth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth.is_empty()
    }
}

/// Centering and scaling applied to depth before the polynomial expansion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthScaling {
    pub center: f64,
    pub scale: f64,
}

impl DepthScaling {
    fn from_data(depth: ArrayView1<f64>, degree: usize) -> Result<Self, ConstructionError> {
        let n = depth.len() as f64;
        let center = depth.mean().ok_or(ConstructionError::Empty)?;
        let scale = if depth.len() > 1 {
            (depth.mapv(|d| (d - center).powi(2)).sum() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        if degree == 0 {
            return Ok(Self {
                center,
                scale: if scale > 0.0 { scale } else { 1.0 },
            });
        }
        if !(scale > 0.0) {
            return Err(ConstructionError::ConstantCovariate("depth"));
        }
        Ok(Self { center, scale })
    }
}

/// Everything needed to rebuild the spatial smooth columns for new locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialBlueprint {
    pub x_knots: Array1<f64>,
    pub y_knots: Array1<f64>,
    pub x_degree: usize,
    pub y_degree: usize,
    pub x_range: (f64, f64),
    pub y_range: (f64, f64),
    /// Sum-to-zero transform applied to the raw tensor-product basis.
    pub z_transform: Array2<f64>,
}

impl SpatialBlueprint {
    /// Constrained tensor-product columns for the given locations. Locations outside
    /// the training rectangle are clamped to its boundary; the count is returned.
    fn columns(
        &self,
        x: ArrayView1<f64>,
        y: ArrayView1<f64>,
    ) -> Result<(Array2<f64>, usize), ConstructionError> {
        let mut clamped = 0usize;
        let mut clamp = |v: f64, range: (f64, f64)| {
            if v < range.0 || v > range.1 {
                clamped += 1;
            }
            v.clamp(range.0, range.1)
        };
        let xc = x.mapv(|v| clamp(v, self.x_range));
        let yc = y.mapv(|v| clamp(v, self.y_range));
        let bx = create_bspline_basis_with_knots(xc.view(), self.x_knots.view(), self.x_degree)?;
        let by = create_bspline_basis_with_knots(yc.view(), self.y_knots.view(), self.y_degree)?;
        let tensor = row_wise_tensor_product(bx.view(), by.view())?;
        if tensor.ncols() != self.z_transform.nrows() {
            return Err(ConstructionError::ColumnCountMismatch {
                found: tensor.ncols(),
                expected: self.z_transform.nrows(),
            });
        }
        Ok((tensor.dot(&self.z_transform), clamped))
    }
}

/// The data-dependent pieces of a model's design, saved with the fitted model so
/// prediction reproduces the training basis exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignBlueprint {
    pub spec: ModelSpec,
    pub depth_scaling: DepthScaling,
    pub spatial: Option<SpatialBlueprint>,
}

impl DesignBlueprint {
    /// Builds the design matrix for new covariates in the canonical column order:
    /// intercept, depth polynomial, spatial smooth.
    pub fn design_matrix(&self, covariates: &Covariates) -> Result<Array2<f64>, ConstructionError> {
        let n = covariates.len();
        let degree = self.spec.depth_degree();
        let depth_block = polynomial_columns(covariates.depth.view(), &self.depth_scaling, degree);

        let spatial_block = match &self.spatial {
            Some(spatial) => {
                let (cols, clamped) = spatial.columns(covariates.x.view(), covariates.y.view())?;
                if clamped > 0 {
                    log::warn!(
                        "{clamped} coordinate values fell outside the fitted spatial range and were clamped to its boundary"
                    );
                }
                Some(cols)
            }
            None => None,
        };

        let spatial_cols = spatial_block.as_ref().map_or(0, |block| block.ncols());
        let mut x = Array2::zeros((n, 1 + degree + spatial_cols));
        x.column_mut(0).fill(1.0);
        x.slice_mut(s![.., 1..1 + degree]).assign(&depth_block);
        if let Some(block) = spatial_block {
            x.slice_mut(s![.., 1 + degree..]).assign(&block);
        }
        Ok(x)
    }
}

fn polynomial_columns(depth: ArrayView1<f64>, scaling: &DepthScaling, degree: usize) -> Array2<f64> {
    let z = depth.mapv(|d| (d - scaling.center) / scaling.scale);
    let mut cols = Array2::zeros((depth.len(), degree));
    for (k, mut col) in cols.axis_iter_mut(Axis(1)).enumerate() {
        let power = (k + 1) as i32;
        col.assign(&z.mapv(|v| v.powi(power)));
    }
    cols
}

/// Holds the layout of the design matrix `X` and penalty matrices `S_i`.
#[derive(Clone, Debug)]
pub struct ModelLayout {
    pub intercept_col: usize,
    pub depth_cols: Range<usize>,
    pub spatial_cols: Option<Range<usize>>,
    pub penalty_map: Vec<PenalizedBlock>,
    pub total_coeffs: usize,
    pub num_penalties: usize,
}

/// Information about a single penalized block of coefficients.
#[derive(Clone, Debug)]
pub struct PenalizedBlock {
    pub term_name: String,
    pub col_range: Range<usize>,
    pub penalty_idx: usize,
}

impl ModelLayout {
    pub fn new(depth_degree: usize, spatial_basis_ncols: Option<usize>) -> Self {
        let intercept_col = 0;
        let depth_cols = 1..1 + depth_degree;
        let mut current_col = depth_cols.end;
        let mut penalty_map = Vec::new();

        let spatial_cols = spatial_basis_ncols.map(|ncols| {
            let range = current_col..current_col + ncols;
            current_col += ncols;
            // One penalty per axis over the same coefficients.
            for (penalty_idx, axis) in ["x", "y"].iter().enumerate() {
                penalty_map.push(PenalizedBlock {
                    term_name: format!("te(x,y):{axis}"),
                    col_range: range.clone(),
                    penalty_idx,
                });
            }
            range
        });

        let num_penalties = penalty_map.len();
        Self {
            intercept_col,
            depth_cols,
            spatial_cols,
            penalty_map,
            total_coeffs: current_col,
            num_penalties,
        }
    }
}

fn frobenius_norm(matrix: &Array2<f64>) -> f64 {
    matrix.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn observed_range(values: ArrayView1<f64>, name: &'static str) -> Result<(f64, f64), ConstructionError> {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !(lo < hi) {
        return Err(ConstructionError::ConstantCovariate(name));
    }
    Ok((lo, hi))
}

/// Constructs the design matrix `X`, the list of block-sized penalty matrices `S_i`,
/// the layout tying them together, and the blueprint needed to rebuild `X` for new
/// data.
pub fn build_design_and_penalty_matrices(
    covariates: &Covariates,
    spec: &ModelSpec,
) -> Result<(Array2<f64>, Vec<Array2<f64>>, ModelLayout, DesignBlueprint), ConstructionError> {
    if covariates.is_empty() {
        return Err(ConstructionError::Empty);
    }
    let depth_degree = spec.depth_degree();
    let depth_scaling = DepthScaling::from_data(covariates.depth.view(), depth_degree)?;

    let (spatial, s_list) = match spec {
        ModelSpec::Linear { .. } => (None, Vec::new()),
        ModelSpec::AdditiveSpatial {
            x_basis,
            y_basis,
            penalty_order,
            ..
        } => {
            let x_range = observed_range(covariates.x.view(), "x")?;
            let y_range = observed_range(covariates.y.view(), "y")?;
            let (bx, x_knots) = create_bspline_basis(
                covariates.x.view(),
                x_range,
                x_basis.num_knots,
                x_basis.degree,
            )?;
            let (by, y_knots) = create_bspline_basis(
                covariates.y.view(),
                y_range,
                y_basis.num_knots,
                y_basis.degree,
            )?;
            let tensor = row_wise_tensor_product(bx.view(), by.view())?;
            let (constrained, z_transform) = apply_sum_to_zero_constraint(tensor.view());

            let sx = create_difference_penalty_matrix(bx.ncols(), *penalty_order)?;
            let sy = create_difference_penalty_matrix(by.ncols(), *penalty_order)?;
            let (sx_full, sy_full) = tensor_product_penalties(&sx, &sy);

            // Project the penalties into the constrained basis and scale them to
            // the magnitude of X'X for that block.
            let xtx_norm = frobenius_norm(&constrained.t().dot(&constrained));
            let s_list = [sx_full, sy_full]
                .into_iter()
                .map(|s_full| {
                    let s_c = z_transform.t().dot(&s_full).dot(&z_transform);
                    let norm = frobenius_norm(&s_c);
                    if norm > 0.0 { s_c * (xtx_norm / norm) } else { s_c }
                })
                .collect::<Vec<_>>();

            log::debug!(
                "Spatial smooth: {} x {} marginal bases, {} constrained columns",
                bx.ncols(),
                by.ncols(),
                constrained.ncols()
            );

            let blueprint = SpatialBlueprint {
                x_knots,
                y_knots,
                x_degree: x_basis.degree,
                y_degree: y_basis.degree,
                x_range,
                y_range,
                z_transform,
            };
            (Some(blueprint), s_list)
        }
    };

    let blueprint = DesignBlueprint {
        spec: spec.clone(),
        depth_scaling,
        spatial,
    };
    let x_matrix = blueprint.design_matrix(covariates)?;
    let spatial_ncols = blueprint.spatial.as_ref().map(|sp| sp.z_transform.ncols());
    let layout = ModelLayout::new(depth_degree, spatial_ncols);

    if x_matrix.ncols() != layout.total_coeffs {
        return Err(ConstructionError::ColumnCountMismatch {
            found: x_matrix.ncols(),
            expected: layout.total_coeffs,
        });
    }

    Ok((x_matrix, s_list, layout, blueprint))
}
