use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::Serialize;
use std::collections::BTreeMap;

use super::error::{Result, ScaeError};

/// Nombre moyen de parties attribuées à chaque capsule.
///
/// `is_from_capsule` vaut -1 pour les parties non attribuées; ces parties
/// ne comptent pour aucune capsule.
pub fn votes_per_capsule(is_from_capsule: &ArrayView2<isize>, n_caps: usize) -> Result<Array1<f32>> {
    let batch_size = is_from_capsule.nrows();
    if let Some(&bad) = is_from_capsule.iter().find(|&&c| c < -1 || c >= n_caps as isize) {
        return Err(ScaeError::InvalidInput(format!(
            "indice de capsule {} hors de [-1, {})",
            bad, n_caps
        )));
    }

    // Décalage de 1: la colonne 0 (non attribuée) est ensuite ignorée
    let mut counts = Array2::<f32>::zeros((batch_size, n_caps + 1));
    for (b, row) in is_from_capsule.outer_iter().enumerate() {
        for &cap in row.iter() {
            counts[[b, (cap + 1) as usize]] += 1.0;
        }
    }

    let per_capsule = counts.slice(ndarray::s![.., 1..]).to_owned();
    Ok(per_capsule.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(n_caps)))
}

/// Masse expliquée divisée par son maximum par exemple
pub fn normalized_mass(mass: &ArrayView2<f32>) -> Array2<f32> {
    let max = mass.fold_axis(Axis(1), f32::NEG_INFINITY, |acc, &v| acc.max(v));
    mass / &max.mapv(|m| m + 1e-8).insert_axis(Axis(1))
}

fn abs_pearson(x: &ArrayView1<f32>, y: &ArrayView1<f32>) -> f32 {
    let n = x.len() as f32;
    if n == 0.0 {
        return 0.0;
    }
    let (mx, my) = (x.sum() / n, y.sum() / n);
    let mut cov = 0.0f32;
    let (mut vx, mut vy) = (0.0f32, 0.0f32);
    for (&a, &b) in x.iter().zip(y.iter()) {
        cov += (a - mx) * (b - my);
        vx += (a - mx) * (a - mx);
        vy += (b - my) * (b - my);
    }
    let denom = (vx * vy).sqrt();
    // Variance nulle: pas de corrélation mesurable
    if denom <= f32::EPSILON {
        0.0
    } else {
        (cov / denom).abs()
    }
}

/// |corrélation de Pearson| entre activations [B, n_caps] et étiquettes one-hot
pub fn label_correlation(
    activations: &ArrayView2<f32>,
    labels: &ArrayView1<usize>,
    n_classes: usize,
) -> Result<Array2<f32>> {
    let (batch_size, n_caps) = activations.dim();
    if labels.len() != batch_size {
        return Err(ScaeError::shape(batch_size, labels.len()));
    }

    let one_hot = Array2::from_shape_fn((batch_size, n_classes), |(b, k)| {
        if labels[b] == k {
            1.0f32
        } else {
            0.0
        }
    });

    Ok(Array2::from_shape_fn((n_caps, n_classes), |(c, k)| {
        abs_pearson(&activations.column(c), &one_hot.column(k))
    }))
}

/// Rapport d'une passe, sérialisable en JSON
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub scalars: BTreeMap<String, f32>,
    pub votes_per_capsule: Vec<f32>,
    pub normalized_mass: Vec<Vec<f32>>,
    pub posterior_label_correlation: Option<Vec<Vec<f32>>>,
    pub prior_label_correlation: Option<Vec<Vec<f32>>>,
}

pub(crate) fn rows(array: &Array2<f32>) -> Vec<Vec<f32>> {
    array.outer_iter().map(|row| row.to_vec()).collect()
}

impl Report {
    pub fn insert(&mut self, name: impl Into<String>, value: f32) {
        self.scalars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.scalars.get(name).copied()
    }

    pub fn set_votes_per_capsule(&mut self, votes: &Array1<f32>) {
        for (k, &v) in votes.iter().enumerate() {
            self.insert(format!("votes_per_capsule_{}", k), v);
        }
        self.votes_per_capsule = votes.to_vec();
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_votes_per_capsule_ignores_unassigned() {
        let is_from = array![[0isize, 0, 1, -1], [1, 1, -1, -1]];
        let votes = votes_per_capsule(&is_from.view(), 3).unwrap();

        assert_eq!(votes.len(), 3);
        assert!((votes[0] - 1.0).abs() < 1e-6);
        assert!((votes[1] - 1.5).abs() < 1e-6);
        assert_eq!(votes[2], 0.0);
    }

    #[test]
    fn test_votes_per_capsule_rejects_bad_index() {
        let is_from = array![[0isize, 4]];
        assert!(votes_per_capsule(&is_from.view(), 3).is_err());
    }

    #[test]
    fn test_normalized_mass_peaks_at_one() {
        let mass = array![[0.2f32, 0.4, 0.1], [0.5, 0.5, 0.0]];
        let norm = normalized_mass(&mass.view());
        assert!((norm[[0, 1]] - 1.0).abs() < 1e-5);
        assert!((norm[[0, 0]] - 0.5).abs() < 1e-5);
        assert!((norm[[1, 0]] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_perfect_label_correlation() {
        let activations = array![[1.0f32, 0.5], [0.0, 0.5], [1.0, 0.5], [0.0, 0.5]];
        let labels = array![1usize, 0, 1, 0];
        let corr = label_correlation(&activations.view(), &labels.view(), 2).unwrap();

        assert_eq!(corr.dim(), (2, 2));
        assert!((corr[[0, 0]] - 1.0).abs() < 1e-5);
        assert!((corr[[0, 1]] - 1.0).abs() < 1e-5);
        // Activation constante: corrélation nulle
        assert_eq!(corr[[1, 0]], 0.0);
    }

    #[test]
    fn test_report_json_lists_votes() {
        let mut report = Report::default();
        report.insert("loss", 1.5);
        report.set_votes_per_capsule(&array![2.0f32, 0.5]);

        let json = report.to_json().unwrap();
        assert!(json.contains("votes_per_capsule_1"));
        assert_eq!(report.get("votes_per_capsule_0"), Some(2.0));
    }
}
