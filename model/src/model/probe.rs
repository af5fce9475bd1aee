use ndarray::{ArrayView1, ArrayView2};
use ndarray_rand::rand::rngs::StdRng;

use super::error::{Result, ScaeError};
use super::layers::{logsumexp, Activation, Linear};
use super::params::{Decayable, NamedParam};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutput {
    pub cross_entropy: f32,
    pub accuracy: f32,
}

/// Sonde de classification auxiliaire
pub trait ClassificationProbe: Decayable + Send + Sync {
    fn n_classes(&self) -> usize;
    fn evaluate(
        &self,
        features: &ArrayView2<f32>,
        labels: &ArrayView1<usize>,
        labeled: Option<&ArrayView1<bool>>,
    ) -> Result<ProbeOutput>;
}

/// Classifieur linéaire sur une statistique par capsule
pub struct LinearProbe {
    linear: Linear,
}

impl LinearProbe {
    pub fn new(name: &str, n_features: usize, n_classes: usize, rng: &mut StdRng) -> Result<Self> {
        Ok(Self {
            linear: Linear::new(format!("probe/{}", name), n_features, n_classes, Activation::None, rng)?,
        })
    }
}

impl ClassificationProbe for LinearProbe {
    fn n_classes(&self) -> usize {
        self.linear.out_dim()
    }

    fn evaluate(
        &self,
        features: &ArrayView2<f32>,
        labels: &ArrayView1<usize>,
        labeled: Option<&ArrayView1<bool>>,
    ) -> Result<ProbeOutput> {
        let batch_size = features.nrows();
        if labels.len() != batch_size {
            return Err(ScaeError::shape(batch_size, labels.len()));
        }
        if let Some(mask) = labeled {
            if mask.len() != batch_size {
                return Err(ScaeError::shape(batch_size, mask.len()));
            }
        }
        let n_classes = self.n_classes();
        if let Some(&bad) = labels.iter().find(|&&l| l >= n_classes) {
            return Err(ScaeError::InvalidInput(format!(
                "étiquette {} hors de [0, {})",
                bad, n_classes
            )));
        }

        let logits = self.linear.forward(features)?;

        let mut xe_sum = 0.0f32;
        let mut n_labeled = 0.0f32;
        let mut correct = 0usize;
        for (b, row) in logits.outer_iter().enumerate() {
            let values = row.to_vec();
            let xe = logsumexp(&values) - values[labels[b]];

            // Pas de masque: tous les exemples sont étiquetés
            let weight = match labeled {
                Some(mask) if !mask[b] => 0.0,
                _ => 1.0,
            };
            xe_sum += xe * weight;
            n_labeled += weight;

            let mut predicted = 0;
            for c in 1..n_classes {
                if values[c] > values[predicted] {
                    predicted = c;
                }
            }
            if predicted == labels[b] {
                correct += 1;
            }
        }

        Ok(ProbeOutput {
            cross_entropy: xe_sum / (n_labeled + 1e-8),
            accuracy: if batch_size > 0 {
                correct as f32 / batch_size as f32
            } else {
                0.0
            },
        })
    }
}

impl Decayable for LinearProbe {
    fn decayable(&self) -> Vec<NamedParam<'_>> {
        self.linear.decayable()
    }
}
