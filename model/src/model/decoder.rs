use ndarray::{
    Array1, Array2, Array3, Array4, Array5, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Axis,
};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rayon::prelude::*;
use std::sync::Arc;

use super::error::{Result, ScaeError};
use super::layers::{gaussian_log_prob, logsumexp, safe_log, sigmoid, Activation, Linear, AFFINE_POSE_DIM};
use super::params::{Decayable, NamedParam};

/// Gabarits partagés par tous les décodages d'une même passe.
///
/// Le tenseur est [T, n_templates, Ht, Wt] avec T = 1 (gabarits fixes) ou
/// T = B (gabarits dépendant de l'exemple). Le clonage partage le tenseur.
#[derive(Debug, Clone)]
pub struct Templates {
    data: Arc<Array4<f32>>,
}

impl Templates {
    pub fn new(data: Array4<f32>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn batch(&self) -> usize {
        self.data.dim().0
    }

    pub fn n_templates(&self) -> usize {
        self.data.dim().1
    }

    pub fn size(&self) -> (usize, usize) {
        let (_, _, h, w) = self.data.dim();
        (h, w)
    }

    /// Même tenseur (identité, pas seulement égalité des valeurs)
    pub fn same_as(&self, other: &Templates) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Ligne de gabarits pour la ligne `row` d'un lot de `n_rows` lignes.
    ///
    /// Un lot agrandi (B·n_caps) est ordonné exemple par exemple.
    pub fn row_index(&self, row: usize, n_rows: usize) -> Result<usize> {
        let batch = self.batch();
        if batch == 1 {
            return Ok(0);
        }
        if batch == 0 || n_rows % batch != 0 {
            return Err(ScaeError::shape(format!("multiple de {}", batch), n_rows));
        }
        Ok(row / (n_rows / batch))
    }

    /// [B, n_templates, Ht·Wt], répété sur le lot si les gabarits sont fixes
    pub fn flattened(&self, batch_size: usize) -> Result<Array3<f32>> {
        let (_, k, h, w) = self.data.dim();
        let mut out = Array3::zeros((batch_size, k, h * w));
        for b in 0..batch_size {
            let src = self.data.index_axis(Axis(0), self.row_index(b, batch_size)?);
            let flat = src.as_standard_layout().into_owned().into_shape_with_order((k, h * w))?;
            out.index_axis_mut(Axis(0), b).assign(&flat);
        }
        Ok(out)
    }
}

/// Entrées de conditionnement issues de l'encodeur primaire
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderContext<'a> {
    /// [N, n_templates, feature_dim]
    pub template_feature: Option<ArrayView3<'a, f32>>,
    /// [N, embedding_dim]
    pub img_embedding: Option<ArrayView2<'a, f32>>,
}

/// Mélange par pixel: une composante par gabarit plus le fond
#[derive(Debug, Clone)]
pub struct PixelMixture {
    /// [N, K + 1, C, H, W]
    pub means: Array5<f32>,
    /// [N, K + 1, H, W], log-probabilités normalisées
    pub log_mix: Array4<f32>,
    pub scale: f32,
}

impl PixelMixture {
    pub fn n_components(&self) -> usize {
        self.log_mix.dim().1
    }

    /// Espérance par pixel [N, C, H, W]
    pub fn mean(&self) -> Array4<f32> {
        let (n, k, c, h, w) = self.means.dim();
        Array4::from_shape_fn((n, c, h, w), |(b, ch, y, x)| {
            (0..k)
                .map(|comp| self.log_mix[[b, comp, y, x]].exp() * self.means[[b, comp, ch, y, x]])
                .sum()
        })
    }

    /// Moyenne de la composante la plus probable [N, C, H, W]
    pub fn mode(&self) -> Array4<f32> {
        let (n, k, c, h, w) = self.means.dim();
        Array4::from_shape_fn((n, c, h, w), |(b, ch, y, x)| {
            let mut best = 0;
            for comp in 1..k {
                if self.log_mix[[b, comp, y, x]] > self.log_mix[[b, best, y, x]] {
                    best = comp;
                }
            }
            self.means[[b, best, ch, y, x]]
        })
    }

    /// Log-densité par pixel [N, H, W]
    pub fn log_prob(&self, target: &ArrayView4<f32>) -> Result<Array3<f32>> {
        let (n, k, c, h, w) = self.means.dim();
        if target.dim() != (n, c, h, w) {
            return Err(ScaeError::shape((n, c, h, w), target.dim()));
        }

        let mut out = Array3::zeros((n, h, w));
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                let mut per_comp = vec![0.0f32; k];
                for y in 0..h {
                    for x in 0..w {
                        for (comp, slot) in per_comp.iter_mut().enumerate() {
                            let mut lp = self.log_mix[[b, comp, y, x]];
                            for ch in 0..c {
                                lp += gaussian_log_prob(
                                    target[[b, ch, y, x]],
                                    self.means[[b, comp, ch, y, x]],
                                    self.scale,
                                );
                            }
                            *slot = lp;
                        }
                        out_batch[[y, x]] = logsumexp(&per_comp);
                    }
                }
            });

        Ok(out)
    }
}

/// Reconstruction produite par un appel au décodeur
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub pdf: PixelMixture,
    /// [N, K, H, W] gabarits transformés par leur pose
    pub transformed_templates: Array4<f32>,
    /// Gabarits utilisés (partagés)
    pub templates: Templates,
}

/// Décodeur à gabarits
pub trait TemplateDecoder: Decayable + Send + Sync {
    fn n_templates(&self) -> usize;
    fn template_size(&self) -> (usize, usize);
    fn output_shape(&self) -> (usize, usize, usize);
    fn make_templates(
        &self,
        n_templates: usize,
        feature: Option<&ArrayView3<f32>>,
    ) -> Result<Templates>;
    fn decode(
        &self,
        templates: &Templates,
        pose: &ArrayView3<f32>,
        presence: &ArrayView2<f32>,
        ctx: &DecoderContext<'_>,
    ) -> Result<Reconstruction>;
}

/// Échantillonnage bilinéaire d'un gabarit sous une pose affine.
///
/// La pose [a, b, tx, c, d, ty] envoie les coordonnées normalisées de sortie
/// (u, v) ∈ [-1, 1]² vers les coordonnées du gabarit; hors gabarit: 0.
pub fn render_affine(
    template: &ArrayView2<f32>,
    pose: &ArrayView1<f32>,
    out_h: usize,
    out_w: usize,
) -> Array2<f32> {
    let (th, tw) = template.dim();
    let norm = |i: usize, n: usize| {
        if n > 1 {
            2.0 * i as f32 / (n - 1) as f32 - 1.0
        } else {
            0.0
        }
    };
    let sample = |yi: isize, xi: isize| -> f32 {
        if yi < 0 || xi < 0 || yi >= th as isize || xi >= tw as isize {
            0.0
        } else {
            template[[yi as usize, xi as usize]]
        }
    };

    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let u = norm(x, out_w);
        let v = norm(y, out_h);
        let tu = pose[0] * u + pose[1] * v + pose[2];
        let tv = pose[3] * u + pose[4] * v + pose[5];

        let px = (tu + 1.0) * 0.5 * (tw as f32 - 1.0);
        let py = (tv + 1.0) * 0.5 * (th as f32 - 1.0);
        let (x0, y0) = (px.floor(), py.floor());
        let (fx, fy) = (px - x0, py - y0);
        let (x0, y0) = (x0 as isize, y0 as isize);

        sample(y0, x0) * (1.0 - fx) * (1.0 - fy)
            + sample(y0, x0 + 1) * fx * (1.0 - fy)
            + sample(y0 + 1, x0) * (1.0 - fx) * fy
            + sample(y0 + 1, x0 + 1) * fx * fy
    })
}

/// Décodage d'une ligne du lot
struct RowDecode {
    means: Array4<f32>,
    log_mix: Array3<f32>,
    alpha: Array3<f32>,
}

/// Décodeur d'images par gabarits appris et mélange de pixels
pub struct TemplateImageDecoder {
    output_shape: (usize, usize, usize),
    templates: Array3<f32>,
    modulation: Option<Linear>,
    color: Option<Linear>,
    background: Option<Linear>,
    background_bias: Array1<f32>,
    background_logit: f32,
    output_scale: f32,
}

impl TemplateImageDecoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_templates: usize,
        template_size: (usize, usize),
        output_shape: (usize, usize, usize),
        feature_dim: Option<usize>,
        embedding_dim: Option<usize>,
        output_scale: f32,
        background_logit: f32,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let (th, tw) = template_size;
        let channels = output_shape.0;
        let dist = Uniform::new(0.0f32, 1.0)
            .map_err(|e| ScaeError::Config(format!("distribution uniforme invalide: {}", e)))?;
        let templates = Array3::random_using((n_templates, th, tw), dist, rng);

        let (modulation, color) = match feature_dim {
            Some(dim) => (
                Some(Linear::new("template_decoder/modulation", dim, 1, Activation::Sigmoid, rng)?),
                Some(Linear::new("template_decoder/color", dim, channels, Activation::Sigmoid, rng)?),
            ),
            None => (None, None),
        };
        let background = match embedding_dim {
            Some(dim) => Some(Linear::new("template_decoder/background", dim, channels, Activation::None, rng)?),
            None => None,
        };

        Ok(Self {
            output_shape,
            templates,
            modulation,
            color,
            background,
            background_bias: Array1::from_elem(channels, -3.0),
            background_logit,
            output_scale,
        })
    }

    fn decode_row(
        &self,
        template_row: &ArrayView3<f32>,
        pose: &ArrayView2<f32>,
        presence: &ArrayView1<f32>,
        color: Option<&Array2<f32>>,
        background: &Array1<f32>,
    ) -> RowDecode {
        let (channels, h, w) = self.output_shape;
        let k = pose.nrows();

        let mut means = Array4::zeros((k + 1, channels, h, w));
        let mut logits = Array3::zeros((k + 1, h, w));
        let mut alpha = Array3::zeros((k, h, w));

        for comp in 0..k {
            let rendered = render_affine(&template_row.index_axis(Axis(0), comp), &pose.row(comp), h, w);
            for ch in 0..channels {
                let tint = color.map(|c| c[[comp, ch]]).unwrap_or(1.0);
                means
                    .index_axis_mut(Axis(0), comp)
                    .index_axis_mut(Axis(0), ch)
                    .assign(&rendered.mapv(|a| a * tint));
            }
            let pres = presence[comp];
            logits
                .index_axis_mut(Axis(0), comp)
                .assign(&rendered.mapv(|a| safe_log(pres * a)));
            alpha.index_axis_mut(Axis(0), comp).assign(&rendered);
        }

        for ch in 0..channels {
            means
                .index_axis_mut(Axis(0), k)
                .index_axis_mut(Axis(0), ch)
                .fill(background[ch]);
        }
        logits.index_axis_mut(Axis(0), k).fill(self.background_logit);

        // Normalisation des logits par pixel
        let mut log_mix = logits.clone();
        let mut column = vec![0.0f32; k + 1];
        for y in 0..h {
            for x in 0..w {
                for (comp, slot) in column.iter_mut().enumerate() {
                    *slot = logits[[comp, y, x]];
                }
                let norm = logsumexp(&column);
                for comp in 0..=k {
                    log_mix[[comp, y, x]] -= norm;
                }
            }
        }

        RowDecode {
            means,
            log_mix,
            alpha,
        }
    }
}

impl TemplateDecoder for TemplateImageDecoder {
    fn n_templates(&self) -> usize {
        self.templates.dim().0
    }

    fn template_size(&self) -> (usize, usize) {
        let (_, h, w) = self.templates.dim();
        (h, w)
    }

    fn output_shape(&self) -> (usize, usize, usize) {
        self.output_shape
    }

    fn make_templates(
        &self,
        n_templates: usize,
        feature: Option<&ArrayView3<f32>>,
    ) -> Result<Templates> {
        let (k, th, tw) = self.templates.dim();
        if n_templates != k {
            return Err(ScaeError::shape(k, n_templates));
        }

        match (feature, &self.modulation) {
            (Some(feature), Some(modulation)) => {
                let (batch_size, fk, _) = feature.dim();
                if fk != k {
                    return Err(ScaeError::shape((batch_size, k, "_"), feature.dim()));
                }
                // Gabarits modulés par exemple
                let gain = modulation.forward3(feature)?;
                let data = Array4::from_shape_fn((batch_size, k, th, tw), |(b, t, y, x)| {
                    self.templates[[t, y, x]] * gain[[b, t, 0]]
                });
                Ok(Templates::new(data))
            }
            _ => Ok(Templates::new(self.templates.clone().insert_axis(Axis(0)))),
        }
    }

    fn decode(
        &self,
        templates: &Templates,
        pose: &ArrayView3<f32>,
        presence: &ArrayView2<f32>,
        ctx: &DecoderContext<'_>,
    ) -> Result<Reconstruction> {
        let (n_rows, k, pose_dim) = pose.dim();
        let (channels, h, w) = self.output_shape;

        if pose_dim != AFFINE_POSE_DIM || k != templates.n_templates() {
            return Err(ScaeError::shape(
                (n_rows, templates.n_templates(), AFFINE_POSE_DIM),
                pose.dim(),
            ));
        }
        if presence.dim() != (n_rows, k) {
            return Err(ScaeError::shape((n_rows, k), presence.dim()));
        }

        let colors = match (ctx.template_feature.as_ref(), &self.color) {
            (Some(feature), Some(layer)) => {
                if feature.dim().0 != n_rows || feature.dim().1 != k {
                    return Err(ScaeError::shape((n_rows, k, "_"), feature.dim()));
                }
                Some(layer.forward3(feature)?)
            }
            _ => None,
        };

        let backgrounds = match (ctx.img_embedding.as_ref(), &self.background) {
            (Some(embedding), Some(layer)) => {
                if embedding.nrows() != n_rows {
                    return Err(ScaeError::shape((n_rows, "_"), embedding.dim()));
                }
                layer.forward(embedding)? + &self.background_bias
            }
            _ => Array2::from_shape_fn((n_rows, channels), |(_, ch)| self.background_bias[ch]),
        }
        .mapv(sigmoid);

        let row_templates = (0..n_rows)
            .map(|row| templates.row_index(row, n_rows))
            .collect::<Result<Vec<_>>>()?;
        let template_view = templates.view();

        // Parallélisation par ligne du lot
        let rows: Vec<RowDecode> = (0..n_rows)
            .into_par_iter()
            .map(|row| {
                let color = colors
                    .as_ref()
                    .map(|c| c.index_axis(Axis(0), row).to_owned());
                self.decode_row(
                    &template_view.index_axis(Axis(0), row_templates[row]),
                    &pose.index_axis(Axis(0), row),
                    &presence.row(row),
                    color.as_ref(),
                    &backgrounds.row(row).to_owned(),
                )
            })
            .collect();

        let mut means = Array5::zeros((n_rows, k + 1, channels, h, w));
        let mut log_mix = Array4::zeros((n_rows, k + 1, h, w));
        let mut transformed = Array4::zeros((n_rows, k, h, w));
        for (row, decoded) in rows.into_iter().enumerate() {
            means.index_axis_mut(Axis(0), row).assign(&decoded.means);
            log_mix.index_axis_mut(Axis(0), row).assign(&decoded.log_mix);
            transformed.index_axis_mut(Axis(0), row).assign(&decoded.alpha);
        }

        Ok(Reconstruction {
            pdf: PixelMixture {
                means,
                log_mix,
                scale: self.output_scale,
            },
            transformed_templates: transformed,
            templates: templates.clone(),
        })
    }
}

impl Decayable for TemplateImageDecoder {
    fn decayable(&self) -> Vec<NamedParam<'_>> {
        [&self.modulation, &self.color, &self.background]
            .into_iter()
            .flatten()
            .flat_map(Linear::decayable)
            .collect()
    }
}
