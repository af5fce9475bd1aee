use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayViewD, Axis};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use serde::{Deserialize, Serialize};

use super::error::{Result, ScaeError};
use super::params::{Decayable, NamedParam};

/// Nombre de paramètres d'une pose affine [a, b, tx, c, d, ty]
pub const AFFINE_POSE_DIM: usize = 6;

/// Seuil en dessous duquel `safe_log` renvoie une constante
pub const LOG_EPS: f32 = 1e-16;

/// Valeur de `safe_log` pour les entrées quasi nulles
pub const LOG_FLOOR: f32 = -1e8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    ReLU,
    Sigmoid,
    Tanh,
    None,
}

impl Activation {
    pub fn apply(&self, v: f32) -> f32 {
        match self {
            Activation::ReLU => v.max(0.0),
            Activation::Sigmoid => sigmoid(v),
            Activation::Tanh => v.tanh(),
            Activation::None => v,
        }
    }
}

/// Couche dense `y = act(x·W + b)`
///
/// Seuls les poids `W` sont exposés à la régularisation, jamais les biais.
#[derive(Debug, Clone)]
pub struct Linear {
    pub name: String,
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,
}

impl Linear {
    pub fn new(
        name: impl Into<String>,
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(ScaeError::Config(format!(
                "couche dense de taille nulle ({} -> {})",
                in_dim, out_dim
            )));
        }

        // Initialisation He uniforme
        let scale = (2.0 / in_dim as f32).sqrt();
        let dist = Uniform::new(-scale, scale)
            .map_err(|e| ScaeError::Config(format!("distribution uniforme invalide: {}", e)))?;
        let weights = Array2::random_using((in_dim, out_dim), dist, rng);

        Ok(Self {
            name: name.into(),
            weights,
            biases: Array1::zeros(out_dim),
            activation,
        })
    }

    /// Remplace les biais (ex: pose identité)
    pub fn with_biases(mut self, biases: Array1<f32>) -> Result<Self> {
        if biases.len() != self.out_dim() {
            return Err(ScaeError::shape(self.out_dim(), biases.len()));
        }
        self.biases = biases;
        Ok(self)
    }

    pub fn in_dim(&self) -> usize {
        self.weights.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.weights.ncols()
    }

    pub fn forward(&self, input: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.in_dim() {
            return Err(ScaeError::shape(
                format!("{}: [_, {}]", self.name, self.in_dim()),
                input.dim(),
            ));
        }
        let mut out = input.dot(&self.weights) + &self.biases;
        let activation = self.activation;
        out.mapv_inplace(|v| activation.apply(v));
        Ok(out)
    }

    /// Applique la couche sur le dernier axe d'un tenseur [B, N, in]
    pub fn forward3(&self, input: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let (b, n, d) = input.dim();
        // Les vues concaténées ne sont pas contiguës: recopie en ordre standard
        let flat = input.as_standard_layout().into_owned().into_shape_with_order((b * n, d))?;
        let out = self.forward(&flat.view())?;
        Ok(out.into_shape_with_order((b, n, self.out_dim()))?)
    }
}

impl Decayable for Linear {
    fn decayable(&self) -> Vec<NamedParam<'_>> {
        vec![NamedParam::new(
            format!("{}/w", self.name),
            self.weights.view().into_dyn(),
        )]
    }
}

pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

pub fn softplus(v: f32) -> f32 {
    // Stabilité numérique pour les grandes valeurs
    if v > 20.0 {
        v
    } else {
        v.exp().ln_1p()
    }
}

pub fn safe_log(v: f32) -> f32 {
    if v < LOG_EPS {
        LOG_FLOOR
    } else {
        v.ln()
    }
}

pub fn logsumexp(values: &[f32]) -> f32 {
    let max_val = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max_val.is_finite() {
        return max_val;
    }
    let sum: f32 = values.iter().map(|v| (v - max_val).exp()).sum();
    max_val + sum.ln()
}

/// Log-densité d'une gaussienne isotrope de moyenne `mu` et d'écart-type `sigma`
pub fn gaussian_log_prob(x: f32, mu: f32, sigma: f32) -> f32 {
    let z = (x - mu) / sigma;
    -0.5 * z * z - sigma.ln() - 0.5 * (2.0 * std::f32::consts::PI).ln()
}

/// Divise par la somme le long de `axis` (avec epsilon)
pub fn normalize(x: &ArrayView2<f32>, axis: Axis) -> Array2<f32> {
    let sums = x.sum_axis(axis).insert_axis(axis);
    x.to_owned() / (sums + 1e-8)
}

/// Somme sur toutes les dimensions sauf le lot, puis moyenne sur le lot
pub fn flat_reduce(x: &ArrayViewD<f32>) -> f32 {
    let batch_size = x.shape().first().copied().unwrap_or(0);
    if batch_size == 0 {
        return 0.0;
    }
    x.sum() / batch_size as f32
}

/// Pose de référence: identité affine, zéros sinon
pub fn identity_pose(dim: usize) -> Array1<f32> {
    let mut pose = Array1::zeros(dim);
    if dim == AFFINE_POSE_DIM {
        pose[0] = 1.0;
        pose[4] = 1.0;
    }
    pose
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use ndarray_rand::rand::SeedableRng;

    #[test]
    fn test_linear_dimensions() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Linear::new("dense", 4, 3, Activation::ReLU, &mut rng).unwrap();
        let out = layer.forward(&Array2::ones((5, 4)).view()).unwrap();

        assert_eq!(out.dim(), (5, 3));
        assert!(out.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Linear::new("dense", 4, 3, Activation::None, &mut rng).unwrap();
        let err = layer.forward(&Array2::ones((5, 2)).view()).unwrap_err();

        assert!(matches!(err, ScaeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_forward3_accepts_concatenated_input() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Linear::new("dense", 7, 4, Activation::None, &mut rng).unwrap();
        let left = Array3::<f32>::ones((2, 3, 6));
        let right = Array3::<f32>::zeros((2, 3, 1));
        let joined = ndarray::concatenate(Axis(2), &[left.view(), right.view()]).unwrap();

        let out = layer.forward3(&joined.view()).unwrap();
        assert_eq!(out.dim(), (2, 3, 4));

        // Même résultat que la couche dense ligne par ligne
        let rows = joined.as_standard_layout().into_owned().into_shape_with_order((6, 7)).unwrap();
        let expected = layer.forward(&rows.view()).unwrap();
        for (r, row) in expected.outer_iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert!((out[[r / 3, r % 3, j]] - v).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_safe_log_floor() {
        assert_eq!(safe_log(0.0), LOG_FLOOR);
        assert!((safe_log(1.0)).abs() < 1e-7);
    }

    #[test]
    fn test_logsumexp_matches_naive() {
        let values = [0.5f32, -1.0, 2.0];
        let naive = values.iter().map(|v| v.exp()).sum::<f32>().ln();
        assert!((logsumexp(&values) - naive).abs() < 1e-5);
    }

    #[test]
    fn test_flat_reduce() {
        let x = array![[1.0f32, 2.0], [3.0, 4.0]];
        assert!((flat_reduce(&x.view().into_dyn()) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_rows() {
        let x = array![[1.0f32, 3.0], [2.0, 2.0]];
        let n = normalize(&x.view(), Axis(1));
        assert!((n[[0, 1]] - 0.75).abs() < 1e-5);
        assert!((n.row(1).sum() - 1.0).abs() < 1e-5);
    }
}
