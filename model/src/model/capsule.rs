use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use ndarray_rand::rand::rngs::StdRng;
use tracing::debug;

use super::error::{Result, ScaeError};
use super::layers::{identity_pose, softplus, Activation, Linear};
use super::params::{Decayable, NamedParam};
use super::routing::{CapsuleLikelihood, MixtureOutput};

/// Sortie brute de la couche de capsules objets
#[derive(Debug, Clone)]
pub struct CapsuleLayerOutput {
    /// [B, n_caps, n_votes, vote_dim + 1], dernier champ homogène
    pub vote: Array4<f32>,
    /// [B, n_caps, n_votes]
    pub scale: Array3<f32>,
    /// [B, n_caps, n_votes]
    pub vote_presence: Array3<f32>,
    pub dynamic_weights_l2: f32,
}

/// Couche de capsules objets: une tête dense par capsule
pub struct CapsuleLayer {
    pub n_caps: usize,
    pub n_votes: usize,
    pub vote_dim: usize,
    votes: Vec<Linear>,
    scales: Vec<Linear>,
    presences: Vec<Linear>,
}

impl CapsuleLayer {
    pub fn new(
        enc_dim: usize,
        n_caps: usize,
        n_votes: usize,
        vote_dim: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut votes = Vec::with_capacity(n_caps);
        let mut scales = Vec::with_capacity(n_caps);
        let mut presences = Vec::with_capacity(n_caps);

        for cap in 0..n_caps {
            votes.push(Linear::new(
                format!("capsule_layer/{}/vote", cap),
                enc_dim,
                n_votes * vote_dim,
                Activation::None,
                rng,
            )?);
            scales.push(Linear::new(
                format!("capsule_layer/{}/scale", cap),
                enc_dim,
                n_votes,
                Activation::None,
                rng,
            )?);
            presences.push(Linear::new(
                format!("capsule_layer/{}/presence", cap),
                enc_dim,
                n_votes,
                Activation::Sigmoid,
                rng,
            )?);
        }

        Ok(Self {
            n_caps,
            n_votes,
            vote_dim,
            votes,
            scales,
            presences,
        })
    }

    pub fn enc_dim(&self) -> usize {
        self.votes.first().map(Linear::in_dim).unwrap_or(0)
    }

    pub fn forward(&self, h: &ArrayView2<f32>) -> Result<CapsuleLayerOutput> {
        let batch_size = h.nrows();
        let identity = identity_pose(self.vote_dim);

        let mut vote = Array4::zeros((batch_size, self.n_caps, self.n_votes, self.vote_dim + 1));
        let mut scale = Array3::zeros((batch_size, self.n_caps, self.n_votes));
        let mut vote_presence = Array3::zeros((batch_size, self.n_caps, self.n_votes));
        let mut offsets_sq = 0.0f32;

        for cap in 0..self.n_caps {
            // Poids dynamiques: écarts à la pose identité prédits depuis h
            let offsets = self.votes[cap]
                .forward(h)?
                .into_shape_with_order((batch_size, self.n_votes, self.vote_dim))?;
            offsets_sq += offsets.iter().map(|v| v * v).sum::<f32>();

            let mut cap_votes = vote.slice_mut(s![.., cap, .., ..self.vote_dim]);
            cap_votes.assign(&(&offsets + &identity));
            vote.slice_mut(s![.., cap, .., self.vote_dim]).fill(1.0);

            let raw_scale = self.scales[cap].forward(h)?;
            scale
                .slice_mut(s![.., cap, ..])
                .assign(&raw_scale.mapv(|v| softplus(v + 0.5) + 1e-2));

            vote_presence
                .slice_mut(s![.., cap, ..])
                .assign(&self.presences[cap].forward(h)?);
        }

        let dynamic_weights_l2 = if batch_size > 0 {
            0.5 * offsets_sq / batch_size as f32
        } else {
            0.0
        };

        Ok(CapsuleLayerOutput {
            vote,
            scale,
            vote_presence,
            dynamic_weights_l2,
        })
    }
}

impl Decayable for CapsuleLayer {
    fn decayable(&self) -> Vec<NamedParam<'_>> {
        self.votes
            .iter()
            .chain(self.scales.iter())
            .chain(self.presences.iter())
            .flat_map(Linear::decayable)
            .collect()
    }
}

/// Sortie du routage des votes
#[derive(Debug, Clone)]
pub struct RoutingOutput {
    /// [B, n_caps, n_votes, vote_dim]
    pub vote: Array4<f32>,
    /// [B, n_caps, n_votes]
    pub scale: Array3<f32>,
    /// [B, n_caps, n_votes]
    pub vote_presence_prob: Array3<f32>,
    /// [B, n_caps], max des présences des votes de chaque capsule
    pub caps_presence_prob: Array2<f32>,
    pub dynamic_weights_l2: f32,
    pub mixture: MixtureOutput,
}

/// Couche de routage: capsules objets -> votes -> mélange sur les parties
pub struct VoteRoutingLayer {
    layer: CapsuleLayer,
    likelihood: CapsuleLikelihood,
}

impl VoteRoutingLayer {
    pub fn new(
        enc_dim: usize,
        n_caps: usize,
        n_votes: usize,
        vote_dim: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        Ok(Self {
            layer: CapsuleLayer::new(enc_dim, n_caps, n_votes, vote_dim, rng)?,
            likelihood: CapsuleLikelihood::new(vote_dim),
        })
    }

    pub fn n_caps(&self) -> usize {
        self.layer.n_caps
    }

    pub fn n_votes(&self) -> usize {
        self.layer.n_votes
    }

    pub fn vote_dim(&self) -> usize {
        self.layer.vote_dim
    }

    pub fn enc_dim(&self) -> usize {
        self.layer.enc_dim()
    }

    pub fn apply(
        &self,
        h: &ArrayView2<f32>,
        x: &ArrayView3<f32>,
        presence: Option<&ArrayView2<f32>>,
    ) -> Result<RoutingOutput> {
        let (batch_size, enc_dim) = h.dim();
        let (x_batch, n_points, point_dim) = x.dim();

        // Vérifications avant tout calcul de vraisemblance
        if enc_dim != self.enc_dim() {
            return Err(ScaeError::shape((batch_size, self.enc_dim()), h.dim()));
        }
        if x_batch != batch_size || point_dim != self.vote_dim() {
            return Err(ScaeError::shape(
                (batch_size, n_points, self.vote_dim()),
                x.dim(),
            ));
        }
        if let Some(pres) = presence {
            if pres.dim() != (batch_size, n_points) {
                return Err(ScaeError::shape((batch_size, n_points), pres.dim()));
            }
        }

        let raw = self.layer.forward(h)?;
        let expected = (batch_size, self.n_caps(), self.n_votes(), self.vote_dim() + 1);
        if raw.vote.dim() != expected {
            return Err(ScaeError::shape(expected, raw.vote.dim()));
        }

        // Le champ homogène est retiré: les consommateurs ne voient que vote_dim champs
        let vote = raw.vote.slice(s![.., .., .., ..self.vote_dim()]).to_owned();

        let mixture = self.likelihood.evaluate(
            &vote.view(),
            &raw.scale.view(),
            &raw.vote_presence.view(),
            x,
            presence,
        )?;

        let caps_presence_prob = raw
            .vote_presence
            .fold_axis(Axis(2), f32::NEG_INFINITY, |acc, &p| acc.max(p));

        debug!(
            batch_size,
            n_caps = self.n_caps(),
            log_prob = mixture.log_prob,
            dynamic_weights_l2 = raw.dynamic_weights_l2,
            "routage des votes"
        );

        Ok(RoutingOutput {
            vote,
            scale: raw.scale,
            vote_presence_prob: raw.vote_presence,
            caps_presence_prob,
            dynamic_weights_l2: raw.dynamic_weights_l2,
            mixture,
        })
    }
}

impl Decayable for VoteRoutingLayer {
    fn decayable(&self) -> Vec<NamedParam<'_>> {
        self.layer.decayable()
    }
}
