use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayView4};
use rayon::prelude::*;

use super::error::{Result, ScaeError};
use super::layers::{gaussian_log_prob, logsumexp, safe_log};

/// Logit et log-densité de la composante factice (-2·ln 10)
pub fn dummy_log_prob() -> f32 {
    -2.0 * 10f32.ln()
}

/// Sortie du mélange de votes
#[derive(Debug, Clone)]
pub struct MixtureOutput {
    /// Log-vraisemblance moyenne par exemple
    pub log_prob: f32,
    /// [B, n_points, vote_dim]
    pub winner: Array3<f32>,
    /// [B, n_points]
    pub winner_pres: Array2<f32>,
    /// [B, n_points, vote_dim]
    pub soft_winner: Array3<f32>,
    /// [B, n_points]
    pub soft_winner_pres: Array2<f32>,
    /// [B, n_points, n_caps], somme <= 1 par point (reste: composante factice)
    pub posterior_mixing_probs: Array3<f32>,
    /// [B, n_points], -1 quand la composante factice l'emporte
    pub is_from_capsule: Array2<isize>,
    /// [B, n_caps * n_votes + 1]
    pub mixing_log_prob: Array2<f32>,
    /// [B, n_caps, n_votes], 1 si le vote domine la composante factice
    pub vote_presence: Array3<f32>,
}

/// Résultat intermédiaire pour un exemple
struct ExampleMixture {
    log_prob: f32,
    winner: Array2<f32>,
    winner_pres: Array1<f32>,
    soft_winner: Array2<f32>,
    soft_winner_pres: Array1<f32>,
    posterior: Array2<f32>,
    is_from_capsule: Array1<isize>,
    mixing_log_prob: Array1<f32>,
    vote_presence: Array1<f32>,
}

/// Vraisemblance d'un mélange gaussien invariant à l'ordre.
///
/// Chaque point est expliqué par l'ensemble des votes de toutes les capsules,
/// plus une composante factice qui absorbe les points inexpliqués.
#[derive(Debug, Clone)]
pub struct CapsuleLikelihood {
    pub dummy_vote: Array1<f32>,
}

impl CapsuleLikelihood {
    pub fn new(vote_dim: usize) -> Self {
        Self {
            dummy_vote: Array1::zeros(vote_dim),
        }
    }

    pub fn evaluate(
        &self,
        votes: &ArrayView4<f32>,
        scales: &ArrayView3<f32>,
        vote_presence: &ArrayView3<f32>,
        x: &ArrayView3<f32>,
        presence: Option<&ArrayView2<f32>>,
    ) -> Result<MixtureOutput> {
        let (batch_size, n_caps, n_votes, vote_dim) = votes.dim();
        let (x_batch, n_points, point_dim) = x.dim();

        if x_batch != batch_size || point_dim != vote_dim {
            return Err(ScaeError::shape(
                (batch_size, "_", vote_dim),
                (x_batch, n_points, point_dim),
            ));
        }
        if scales.dim() != (batch_size, n_caps, n_votes) {
            return Err(ScaeError::shape((batch_size, n_caps, n_votes), scales.dim()));
        }
        if vote_presence.dim() != (batch_size, n_caps, n_votes) {
            return Err(ScaeError::shape((batch_size, n_caps, n_votes), vote_presence.dim()));
        }
        if let Some(pres) = presence {
            if pres.dim() != (batch_size, n_points) {
                return Err(ScaeError::shape((batch_size, n_points), pres.dim()));
            }
        }
        if self.dummy_vote.len() != vote_dim {
            return Err(ScaeError::shape(vote_dim, self.dummy_vote.len()));
        }
        if scales.iter().any(|&s| !(s > 0.0)) {
            return Err(ScaeError::InvalidInput(
                "les échelles des votes doivent être > 0".to_string(),
            ));
        }

        // Parallélisation par exemple
        let examples = (0..batch_size)
            .into_par_iter()
            .map(|b| -> Result<ExampleMixture> {
                let flat_votes = votes
                    .index_axis(ndarray::Axis(0), b)
                    .as_standard_layout()
                    .into_owned()
                    .into_shape_with_order((n_caps * n_votes, vote_dim))?;
                let flat_scales = scales
                    .index_axis(ndarray::Axis(0), b)
                    .as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(n_caps * n_votes)?;
                let flat_pres = vote_presence
                    .index_axis(ndarray::Axis(0), b)
                    .as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(n_caps * n_votes)?;
                let point_pres = presence.map(|p| p.row(b));

                Ok(self.evaluate_example(
                    &flat_votes.view(),
                    &flat_scales.view(),
                    &flat_pres.view(),
                    &x.index_axis(ndarray::Axis(0), b),
                    point_pres,
                    n_caps,
                    n_votes,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let n_components = n_caps * n_votes + 1;
        let mut output = MixtureOutput {
            log_prob: 0.0,
            winner: Array3::zeros((batch_size, n_points, vote_dim)),
            winner_pres: Array2::zeros((batch_size, n_points)),
            soft_winner: Array3::zeros((batch_size, n_points, vote_dim)),
            soft_winner_pres: Array2::zeros((batch_size, n_points)),
            posterior_mixing_probs: Array3::zeros((batch_size, n_points, n_caps)),
            is_from_capsule: Array2::zeros((batch_size, n_points)),
            mixing_log_prob: Array2::zeros((batch_size, n_components)),
            vote_presence: Array3::zeros((batch_size, n_caps, n_votes)),
        };

        let mut total_log_prob = 0.0;
        for (b, example) in examples.into_iter().enumerate() {
            total_log_prob += example.log_prob;
            output.winner.index_axis_mut(ndarray::Axis(0), b).assign(&example.winner);
            output.winner_pres.row_mut(b).assign(&example.winner_pres);
            output.soft_winner.index_axis_mut(ndarray::Axis(0), b).assign(&example.soft_winner);
            output.soft_winner_pres.row_mut(b).assign(&example.soft_winner_pres);
            output
                .posterior_mixing_probs
                .index_axis_mut(ndarray::Axis(0), b)
                .assign(&example.posterior);
            output.is_from_capsule.row_mut(b).assign(&example.is_from_capsule);
            output.mixing_log_prob.row_mut(b).assign(&example.mixing_log_prob);
            output
                .vote_presence
                .index_axis_mut(ndarray::Axis(0), b)
                .assign(&example.vote_presence.into_shape_with_order((n_caps, n_votes))?);
        }
        output.log_prob = if batch_size > 0 {
            total_log_prob / batch_size as f32
        } else {
            0.0
        };

        Ok(output)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_example(
        &self,
        votes: &ArrayView2<f32>,
        scales: &ArrayView1<f32>,
        vote_presence: &ArrayView1<f32>,
        x: &ArrayView2<f32>,
        point_presence: Option<ArrayView1<f32>>,
        n_caps: usize,
        n_votes: usize,
    ) -> ExampleMixture {
        let n_real = n_caps * n_votes;
        let (n_points, vote_dim) = x.dim();

        // Logits de mélange: indépendants des points
        let mut mixing_logits: Vec<f32> = vote_presence.iter().map(|&p| safe_log(p)).collect();
        mixing_logits.push(dummy_log_prob());
        let norm = logsumexp(&mixing_logits);
        let mixing_log_prob: Vec<f32> = mixing_logits.iter().map(|l| l - norm).collect();

        let mut example = ExampleMixture {
            log_prob: 0.0,
            winner: Array2::zeros((n_points, vote_dim)),
            winner_pres: Array1::zeros(n_points),
            soft_winner: Array2::zeros((n_points, vote_dim)),
            soft_winner_pres: Array1::zeros(n_points),
            posterior: Array2::zeros((n_points, n_caps)),
            is_from_capsule: Array1::zeros(n_points),
            mixing_log_prob: Array1::from_vec(mixing_log_prob.clone()),
            vote_presence: Array1::from_iter(
                mixing_logits[..n_real]
                    .iter()
                    .map(|&l| if l > mixing_logits[n_real] { 1.0 } else { 0.0 }),
            ),
        };

        let mut posterior_logits = vec![0.0f32; n_real + 1];
        for n in 0..n_points {
            let point = x.row(n);
            for m in 0..n_real {
                let vote = votes.row(m);
                let scale = scales[m];
                let vote_log_prob: f32 = point
                    .iter()
                    .zip(vote.iter())
                    .map(|(&xi, &mu)| gaussian_log_prob(xi, mu, scale))
                    .sum();
                posterior_logits[m] = mixing_log_prob[m] + vote_log_prob;
            }
            posterior_logits[n_real] = mixing_log_prob[n_real] + dummy_log_prob();

            let point_log_prob = logsumexp(&posterior_logits);
            let weight = point_presence.as_ref().map(|p| p[n]).unwrap_or(1.0);
            example.log_prob += point_log_prob * weight;

            // Softmax stable sur les composantes
            let posterior: Vec<f32> = posterior_logits
                .iter()
                .map(|l| (l - point_log_prob).exp())
                .collect();

            let mut best = 0;
            for m in 1..n_real {
                if posterior_logits[m] > posterior_logits[best] {
                    best = m;
                }
            }
            example.winner.row_mut(n).assign(&votes.row(best));
            example.winner_pres[n] = vote_presence[best];
            example.is_from_capsule[n] = if posterior_logits[n_real] > posterior_logits[best] {
                -1
            } else {
                (best / n_votes) as isize
            };

            for d in 0..vote_dim {
                let mut sum = posterior[n_real] * self.dummy_vote[d];
                for m in 0..n_real {
                    sum += posterior[m] * votes[[m, d]];
                }
                example.soft_winner[[n, d]] = sum;
            }
            // La composante factice a une présence nulle
            example.soft_winner_pres[n] = (0..n_real).map(|m| posterior[m] * vote_presence[m]).sum();

            for c in 0..n_caps {
                example.posterior[[n, c]] = posterior[c * n_votes..(c + 1) * n_votes].iter().sum();
            }
        }

        example
    }
}
