use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayView4, Axis};
use ndarray_rand::rand::rngs::StdRng;

use super::error::{Result, ScaeError};
use super::layers::{identity_pose, Activation, Linear};
use super::params::{Decayable, NamedParam};

/// Capsules primaires (parties) extraites d'une image
#[derive(Debug, Clone)]
pub struct PrimaryCaps {
    /// [B, n_parts, pose_dim]
    pub pose: Array3<f32>,
    /// [B, n_parts]
    pub presence: Array2<f32>,
    /// [B, n_parts, feature_dim]
    pub feature: Option<Array3<f32>>,
    /// [B, embedding_dim]
    pub img_embedding: Option<Array2<f32>>,
}

impl PrimaryCaps {
    pub fn batch_size(&self) -> usize {
        self.pose.dim().0
    }

    pub fn n_parts(&self) -> usize {
        self.pose.dim().1
    }

    /// Vérifie la cohérence des tenseurs entre eux
    pub fn check(&self, n_parts: usize, pose_dim: usize) -> Result<()> {
        let (b, p, d) = self.pose.dim();
        if p != n_parts || d != pose_dim {
            return Err(ScaeError::shape((b, n_parts, pose_dim), (b, p, d)));
        }
        if self.presence.dim() != (b, p) {
            return Err(ScaeError::shape((b, p), self.presence.dim()));
        }
        if let Some(feature) = &self.feature {
            let (fb, fp, _) = feature.dim();
            if (fb, fp) != (b, p) {
                return Err(ScaeError::shape((b, p, "_"), feature.dim()));
            }
        }
        if let Some(embedding) = &self.img_embedding {
            if embedding.nrows() != b {
                return Err(ScaeError::shape((b, "_"), embedding.dim()));
            }
        }
        Ok(())
    }
}

/// Encodeur d'images en capsules primaires
pub trait PrimaryEncoder: Decayable + Send + Sync {
    fn n_parts(&self) -> usize;
    fn pose_dim(&self) -> usize;
    fn feature_dim(&self) -> Option<usize>;
    fn embedding_dim(&self) -> Option<usize>;
    fn encode(&self, images: &ArrayView4<f32>) -> Result<PrimaryCaps>;
}

/// Encodeur d'ensembles vers l'encodage des capsules objets.
///
/// `accepts_presence` déclare si la présence des parties est un argument
/// séparé; sinon l'encodeur ne reçoit que les poses.
pub trait ObjectEncoder: Decayable + Send + Sync {
    fn accepts_presence(&self) -> bool;
    fn input_dim(&self) -> usize;
    fn output_dim(&self) -> usize;
    fn encode(
        &self,
        inputs: &ArrayView3<f32>,
        presence: Option<&ArrayView2<f32>>,
    ) -> Result<Array2<f32>>;
}

/// Encodeur primaire dense: image aplatie -> poses, présences, traits
pub struct LinearPrimaryEncoder {
    input_shape: (usize, usize, usize),
    n_parts: usize,
    pose_dim: usize,
    pose: Linear,
    presence: Linear,
    feature: Option<(usize, Linear)>,
    embedding: Option<Linear>,
}

impl LinearPrimaryEncoder {
    pub fn new(
        input_shape: (usize, usize, usize),
        n_parts: usize,
        pose_dim: usize,
        feature_dim: Option<usize>,
        embedding_dim: Option<usize>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let (c, h, w) = input_shape;
        let in_dim = c * h * w;

        let pose_bias = Array1::from_iter(
            (0..n_parts).flat_map(|_| identity_pose(pose_dim).to_vec()),
        );
        let pose = Linear::new("primary_encoder/pose", in_dim, n_parts * pose_dim, Activation::None, rng)?
            .with_biases(pose_bias)?;
        let presence = Linear::new("primary_encoder/presence", in_dim, n_parts, Activation::Sigmoid, rng)?;

        let feature = match feature_dim {
            Some(dim) => Some((
                dim,
                Linear::new("primary_encoder/feature", in_dim, n_parts * dim, Activation::ReLU, rng)?,
            )),
            None => None,
        };
        let embedding = match embedding_dim {
            Some(dim) => Some(Linear::new("primary_encoder/embedding", in_dim, dim, Activation::ReLU, rng)?),
            None => None,
        };

        Ok(Self {
            input_shape,
            n_parts,
            pose_dim,
            pose,
            presence,
            feature,
            embedding,
        })
    }
}

impl PrimaryEncoder for LinearPrimaryEncoder {
    fn n_parts(&self) -> usize {
        self.n_parts
    }

    fn pose_dim(&self) -> usize {
        self.pose_dim
    }

    fn feature_dim(&self) -> Option<usize> {
        self.feature.as_ref().map(|(dim, _)| *dim)
    }

    fn embedding_dim(&self) -> Option<usize> {
        self.embedding.as_ref().map(Linear::out_dim)
    }

    fn encode(&self, images: &ArrayView4<f32>) -> Result<PrimaryCaps> {
        let (batch_size, c, h, w) = images.dim();
        if (c, h, w) != self.input_shape {
            return Err(ScaeError::shape(self.input_shape, (c, h, w)));
        }

        let flat = images.as_standard_layout().into_owned().into_shape_with_order((batch_size, c * h * w))?;
        let flat = flat.view();

        let pose = self
            .pose
            .forward(&flat)?
            .into_shape_with_order((batch_size, self.n_parts, self.pose_dim))?;
        let presence = self.presence.forward(&flat)?;

        let feature = match &self.feature {
            Some((dim, layer)) => Some(
                layer
                    .forward(&flat)?
                    .into_shape_with_order((batch_size, self.n_parts, *dim))?,
            ),
            None => None,
        };
        let img_embedding = match &self.embedding {
            Some(layer) => Some(layer.forward(&flat)?),
            None => None,
        };

        Ok(PrimaryCaps {
            pose,
            presence,
            feature,
            img_embedding,
        })
    }
}

impl Decayable for LinearPrimaryEncoder {
    fn decayable(&self) -> Vec<NamedParam<'_>> {
        let mut params = self.pose.decayable();
        params.extend(self.presence.decayable());
        if let Some((_, layer)) = &self.feature {
            params.extend(layer.decayable());
        }
        if let Some(layer) = &self.embedding {
            params.extend(layer.decayable());
        }
        params
    }
}

/// Encodeur d'ensemble: MLP par partie, agrégation pondérée par la présence
pub struct SetPoolEncoder {
    element: Linear,
    output: Linear,
    use_presence: bool,
}

impl SetPoolEncoder {
    pub fn new(
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        use_presence: bool,
        rng: &mut StdRng,
    ) -> Result<Self> {
        Ok(Self {
            element: Linear::new("set_encoder/element", input_dim, hidden_dim, Activation::ReLU, rng)?,
            output: Linear::new("set_encoder/output", hidden_dim, output_dim, Activation::ReLU, rng)?,
            use_presence,
        })
    }
}

impl ObjectEncoder for SetPoolEncoder {
    fn accepts_presence(&self) -> bool {
        self.use_presence
    }

    fn input_dim(&self) -> usize {
        self.element.in_dim()
    }

    fn output_dim(&self) -> usize {
        self.output.out_dim()
    }

    fn encode(
        &self,
        inputs: &ArrayView3<f32>,
        presence: Option<&ArrayView2<f32>>,
    ) -> Result<Array2<f32>> {
        let (batch_size, n_elements, _) = inputs.dim();
        let hidden = self.element.forward3(inputs)?;

        let weights = match presence {
            Some(pres) if self.use_presence => {
                if pres.dim() != (batch_size, n_elements) {
                    return Err(ScaeError::shape((batch_size, n_elements), pres.dim()));
                }
                pres.to_owned()
            }
            Some(_) => {
                return Err(ScaeError::InvalidInput(
                    "cet encodeur n'accepte pas la présence".to_string(),
                ))
            }
            None => Array2::ones((batch_size, n_elements)),
        };

        // Moyenne pondérée sur les éléments
        let norm = weights.sum_axis(Axis(1)).mapv(|s| s + 1e-8);
        let pooled = (hidden * &weights.insert_axis(Axis(2))).sum_axis(Axis(1))
            / &norm.insert_axis(Axis(1));

        self.output.forward(&pooled.view())
    }
}

impl Decayable for SetPoolEncoder {
    fn decayable(&self) -> Vec<NamedParam<'_>> {
        let mut params = self.element.decayable();
        params.extend(self.output.decayable());
        params
    }
}
