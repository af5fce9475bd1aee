use ndarray::{Array1, ArrayView2, ArrayView3, Axis};

use super::config::SparsityLossType;
use super::error::{Result, ScaeError};
use super::layers::{normalize, safe_log};

/// Perte intra-exemple et inter-exemples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparsityLoss {
    pub within: f32,
    pub between: f32,
}

/// Les quatre termes de parcimonie d'une passe
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SparsityTerms {
    pub posterior_within: f32,
    pub posterior_between: f32,
    pub prior_within: f32,
    pub prior_between: f32,
}

/// `mean(-Σ labels · safe_log(probs))` sur le dernier axe
fn safe_ce(labels: &ArrayView2<f32>, probs: &ArrayView2<f32>) -> f32 {
    let per_row: Array1<f32> = labels
        .outer_iter()
        .zip(probs.outer_iter())
        .map(|(l, p)| -l.iter().zip(p.iter()).map(|(&li, &pi)| li * safe_log(pi)).sum::<f32>())
        .collect();
    per_row.mean().unwrap_or(0.0)
}

/// Entropie des activations, intra et inter exemples; `k` rescale la prédiction
fn capsule_entropy(probs: &ArrayView2<f32>, k: f32) -> (f32, f32) {
    let within = normalize(probs, Axis(1));
    let within_loss = safe_ce(&within.view(), &within.mapv(|v| v * k).view());

    let totals = probs.sum_axis(Axis(0)).insert_axis(Axis(0));
    let between = normalize(&totals.view(), Axis(1));
    let between_loss = safe_ce(&between.view(), &between.mapv(|v| v * k).view());

    (within_loss, between_loss)
}

fn l2_loss(values: &Array1<f32>) -> f32 {
    0.5 * values.iter().map(|v| v * v).sum::<f32>()
}

/// Pénalise l'écart du nombre de capsules actives à une cible
fn capsule_presence_l2(
    probs: &ArrayView2<f32>,
    num_classes: f32,
    within_example_constant: f32,
) -> (f32, f32) {
    let (batch_size, num_caps) = probs.dim();
    let within_constant = if within_example_constant == 0.0 {
        num_caps as f32 / num_classes
    } else {
        within_example_constant
    };
    let between_constant = batch_size as f32 / num_classes;

    let within = l2_loss(&probs.sum_axis(Axis(1)).mapv(|v| v - within_constant)) / batch_size as f32 * 2.0;
    let between = l2_loss(&probs.sum_axis(Axis(0)).mapv(|v| v - between_constant)) / num_caps as f32 * 2.0;

    // L'inter-exemples doit être grand: signe inversé
    (within, -between)
}

/// Pertes de parcimonie sur des probabilités [B, n_caps]
pub fn sparsity_loss(
    loss_type: SparsityLossType,
    probs: &ArrayView2<f32>,
    num_classes: f32,
    within_example_constant: f32,
) -> Result<SparsityLoss> {
    let (batch_size, num_caps) = probs.dim();
    if batch_size == 0 || num_caps == 0 {
        return Err(ScaeError::InvalidInput(format!(
            "probabilités de capsules vides {:?}",
            probs.dim()
        )));
    }
    if !(num_classes > 0.0) {
        return Err(ScaeError::Config(format!(
            "num_classes doit être > 0 (reçu {})",
            num_classes
        )));
    }

    let (within, between) = match loss_type {
        SparsityLossType::Entropy => capsule_entropy(probs, 1.0),
        SparsityLossType::Kl => capsule_entropy(probs, num_caps as f32),
        SparsityLossType::L2 => capsule_presence_l2(probs, num_classes, within_example_constant),
    };

    Ok(SparsityLoss { within, between })
}

/// Régularisation de parcimonie sur le postérieur et le prior
#[derive(Debug, Clone)]
pub struct SparsityRegularizer {
    pub posterior_loss_type: SparsityLossType,
    pub prior_loss_type: SparsityLossType,
    pub num_classes: f32,
    pub prior_within_example_constant: f32,
}

impl SparsityRegularizer {
    /// Masse expliquée par capsule, normalisée par le nombre de points [B, n_caps]
    pub fn mass_explained(posterior_mixing_probs: &ArrayView3<f32>) -> ndarray::Array2<f32> {
        let n_points = posterior_mixing_probs.dim().1.max(1);
        posterior_mixing_probs.sum_axis(Axis(1)) / n_points as f32
    }

    pub fn apply(
        &self,
        posterior_mixing_probs: &ArrayView3<f32>,
        caps_presence_prob: &ArrayView2<f32>,
    ) -> Result<SparsityTerms> {
        let mass = Self::mass_explained(posterior_mixing_probs);
        let posterior = sparsity_loss(self.posterior_loss_type, &mass.view(), self.num_classes, 0.0)?;
        let prior = sparsity_loss(
            self.prior_loss_type,
            caps_presence_prob,
            self.num_classes,
            self.prior_within_example_constant,
        )?;

        Ok(SparsityTerms {
            posterior_within: posterior.within,
            posterior_between: posterior.between,
            prior_within: prior.within,
            prior_between: prior.between,
        })
    }
}
