use ndarray::{concatenate, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use tracing::debug;

use super::capsule::{RoutingOutput, VoteRoutingLayer};
use super::config::{AutoencoderConfig, DecodeSource};
use super::decoder::{DecoderContext, Reconstruction, TemplateDecoder, Templates};
use super::encoder::{ObjectEncoder, PrimaryCaps, PrimaryEncoder};
use super::error::{Result, ScaeError};
use super::layers::flat_reduce;
use super::loss::{ClassificationTerms, LossBreakdown, LossTerms, ObjectiveAssembler};
use super::params::ParamRegistry;
use super::preprocess::prepare_target;
use super::probe::{ClassificationProbe, ProbeOutput};
use super::report::{label_correlation, normalized_mass, rows, votes_per_capsule, Report};
use super::sparsity::{SparsityRegularizer, SparsityTerms};
use crate::train_data::DataRecord;

/// Sondes sur la masse expliquée (postérieur) et la présence des capsules (prior)
pub struct Probes {
    pub posterior: Box<dyn ClassificationProbe>,
    pub prior: Box<dyn ClassificationProbe>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationOutput {
    pub posterior: ProbeOutput,
    pub prior: ProbeOutput,
}

/// Résultat complet d'une passe avant
#[derive(Debug, Clone)]
pub struct AutoencoderOutput {
    /// Cible de reconstruction (après prétraitement)
    pub target: Array4<f32>,
    pub primary: PrimaryCaps,
    /// Entrée effective de l'encodeur d'objets [B, n_parts, _]
    pub encoder_input: Array3<f32>,
    /// Encodage des capsules objets [B, enc_dim]
    pub h: Array2<f32>,
    pub routing: RoutingOutput,
    pub templates: Templates,
    pub bottom_up_rec: Reconstruction,
    pub top_down_rec: Reconstruction,
    pub rec: Reconstruction,
    /// Une ligne par (exemple, capsule), ligne b·n_caps + c
    pub top_down_per_caps_rec: Reconstruction,
    pub template_pres: Array2<f32>,
    pub rec_mode: Array4<f32>,
    pub rec_mean: Array4<f32>,
    pub mse_per_pixel: Array4<f32>,
    pub mse: f32,
    pub rec_ll_per_pixel: Array3<f32>,
    pub rec_ll: f32,
    /// Somme du postérieur sur les parties [B, n_caps]
    pub mass_explained: Array2<f32>,
    pub primary_caps_l1: f32,
    pub sparsity: SparsityTerms,
    pub labels: Option<Array1<usize>>,
    pub classification: Option<ClassificationOutput>,
    pub best_cls_acc: Option<f32>,
    pub weight_decay_loss: f32,
    pub breakdown: LossBreakdown,
    pub loss: f32,
}

impl AutoencoderOutput {
    pub fn log_prob(&self) -> f32 {
        self.routing.mixture.log_prob
    }

    pub fn dynamic_weights_l2(&self) -> f32 {
        self.routing.dynamic_weights_l2
    }

    pub fn primary_presence(&self) -> &Array2<f32> {
        &self.primary.presence
    }

    /// Gabarits transformés du décodage principal
    pub fn used_templates(&self) -> &Array4<f32> {
        &self.rec.transformed_templates
    }
}

/// Autoencodeur à capsules empilées
pub struct ImageAutoencoder {
    config: AutoencoderConfig,
    primary_encoder: Box<dyn PrimaryEncoder>,
    object_encoder: Box<dyn ObjectEncoder>,
    routing: VoteRoutingLayer,
    decoder: Box<dyn TemplateDecoder>,
    probes: Option<Probes>,
    sparsity: SparsityRegularizer,
    objective: ObjectiveAssembler,
}

/// Répète chaque ligne `n` fois d'affilée: la ligne b·n + c vient de l'exemple b
fn repeat_rows3(x: &ArrayView3<f32>, n: usize) -> Array3<f32> {
    let (b, p, d) = x.dim();
    Array3::from_shape_fn((b * n, p, d), |(row, i, j)| x[[row / n, i, j]])
}

fn repeat_rows2(x: &ArrayView2<f32>, n: usize) -> Array2<f32> {
    let (b, d) = x.dim();
    Array2::from_shape_fn((b * n, d), |(row, j)| x[[row / n, j]])
}

impl ImageAutoencoder {
    pub(crate) fn new(
        config: AutoencoderConfig,
        primary_encoder: Box<dyn PrimaryEncoder>,
        object_encoder: Box<dyn ObjectEncoder>,
        routing: VoteRoutingLayer,
        decoder: Box<dyn TemplateDecoder>,
        probes: Option<Probes>,
    ) -> Result<Self> {
        let sparsity = SparsityRegularizer {
            posterior_loss_type: config.sparsity.posterior_loss_type,
            prior_loss_type: config.sparsity.prior_loss_type,
            num_classes: config.sparsity_classes(),
            prior_within_example_constant: config.sparsity.prior_within_example_constant,
        };
        let objective = ObjectiveAssembler::new(config.weights.clone())?;

        Ok(Self {
            config,
            primary_encoder,
            object_encoder,
            routing,
            decoder,
            probes,
            sparsity,
            objective,
        })
    }

    pub fn config(&self) -> &AutoencoderConfig {
        &self.config
    }

    pub fn n_caps(&self) -> usize {
        self.routing.n_caps()
    }

    /// Registre de tous les poids soumis à la décroissance
    pub fn registry(&self) -> ParamRegistry<'_> {
        let mut registry = ParamRegistry::new();
        registry.register(self.primary_encoder.as_ref());
        registry.register(self.object_encoder.as_ref());
        registry.register(&self.routing);
        registry.register(self.decoder.as_ref());
        if let Some(probes) = &self.probes {
            registry.register(probes.posterior.as_ref());
            registry.register(probes.prior.as_ref());
        }
        registry
    }

    /// Encodage des capsules objets, avec présence séparée si l'encodeur l'accepte
    fn encode_objects(
        &self,
        input_pose: Array3<f32>,
        presence: &ArrayView2<f32>,
        templates: &Templates,
    ) -> Result<(Array3<f32>, Array2<f32>)> {
        if self.object_encoder.accepts_presence() {
            let input = if self.config.feed_templates {
                let flat = templates.flattened(input_pose.dim().0)?;
                concatenate(Axis(2), &[input_pose.view(), flat.view()])?
            } else {
                input_pose
            };
            let h = self.object_encoder.encode(&input.view(), Some(presence))?;
            Ok((input, h))
        } else {
            // Sans présence séparée: poses seules, sans gabarits
            let h = self.object_encoder.encode(&input_pose.view(), None)?;
            Ok((input_pose, h))
        }
    }

    /// Décodage par capsule: le lot est agrandi à B·n_caps lignes
    fn decode_per_capsule(
        &self,
        routing: &RoutingOutput,
        primary: &PrimaryCaps,
        templates: &Templates,
    ) -> Result<Reconstruction> {
        let (batch_size, n_caps, n_votes, vote_dim) = routing.vote.dim();
        let n_rows = batch_size * n_caps;
        if primary.n_parts() != n_votes {
            return Err(ScaeError::shape(primary.n_parts(), n_votes));
        }

        let vote = routing
            .vote
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n_rows, n_votes, vote_dim))?;
        let vote_presence = routing
            .vote_presence_prob
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n_rows, n_votes))?;
        let presence = vote_presence * repeat_rows2(&primary.presence.view(), n_caps);

        let feature = primary
            .feature
            .as_ref()
            .map(|f| repeat_rows3(&f.view(), n_caps));
        let embedding = primary
            .img_embedding
            .as_ref()
            .map(|e| repeat_rows2(&e.view(), n_caps));
        let ctx = DecoderContext {
            template_feature: feature.as_ref().map(|f| f.view()),
            img_embedding: embedding.as_ref().map(|e| e.view()),
        };

        self.decoder
            .decode(templates, &vote.view(), &presence.view(), &ctx)
    }

    pub fn forward(&self, data: &DataRecord) -> Result<AutoencoderOutput> {
        let config = &self.config;
        let images = data.image(&config.input_key)?;
        let (batch_size, c, h, w) = images.dim();
        if (c, h, w) != config.image_shape {
            return Err(ScaeError::shape(config.image_shape, (c, h, w)));
        }

        let target = prepare_target(&images, config.prep);

        let primary = self.primary_encoder.encode(&images)?;
        primary.check(config.n_parts, config.pose_dim)?;
        if primary.batch_size() != batch_size {
            return Err(ScaeError::shape(batch_size, primary.batch_size()));
        }
        let presence = primary.presence.view();

        // Entrée de l'encodeur d'objets: pose, 1 - présence, traits
        let absence = primary.presence.mapv(|p| 1.0 - p).insert_axis(Axis(2));
        let mut parts = vec![primary.pose.view(), absence.view()];
        if let Some(feature) = &primary.feature {
            parts.push(feature.view());
        }
        let input_pose = concatenate(Axis(2), &parts)?;

        let feature = primary.feature.as_ref().map(|f| f.view());
        let templates = self
            .decoder
            .make_templates(primary.n_parts(), feature.as_ref())?;

        let (encoder_input, h) = self.encode_objects(input_pose, &presence, &templates)?;
        let routing = self
            .routing
            .apply(&h.view(), &primary.pose.view(), Some(&presence))?;
        let mixture = &routing.mixture;

        let vote = match config.vote_type {
            DecodeSource::Enc => primary.pose.view(),
            DecodeSource::Soft => mixture.soft_winner.view(),
            DecodeSource::Hard => mixture.winner.view(),
        };
        let vote_pres = match config.pres_type {
            DecodeSource::Enc => primary.presence.view(),
            DecodeSource::Soft => mixture.soft_winner_pres.view(),
            DecodeSource::Hard => mixture.winner_pres.view(),
        };

        let ctx = DecoderContext {
            template_feature: feature,
            img_embedding: primary.img_embedding.as_ref().map(|e| e.view()),
        };

        let bottom_up_rec = self
            .decoder
            .decode(&templates, &primary.pose.view(), &presence, &ctx)?;
        let top_down_rec = self
            .decoder
            .decode(&templates, &mixture.winner.view(), &presence, &ctx)?;
        let rec = self.decoder.decode(&templates, &vote, &vote_pres, &ctx)?;
        let top_down_per_caps_rec = self.decode_per_capsule(&routing, &primary, &templates)?;

        let rec_mode = rec.pdf.mode();
        let rec_mean = rec.pdf.mean();
        if rec_mode.dim() != target.dim() {
            return Err(ScaeError::shape(target.dim(), rec_mode.dim()));
        }
        let mse_per_pixel = (&target - &rec_mode).mapv(|d| d * d);
        let mse = flat_reduce(&mse_per_pixel.view().into_dyn());
        let rec_ll_per_pixel = rec.pdf.log_prob(&target.view())?;
        let rec_ll = flat_reduce(&rec_ll_per_pixel.view().into_dyn());

        let mass_explained = mixture.posterior_mixing_probs.sum_axis(Axis(1));
        let sparsity = self.sparsity.apply(
            &mixture.posterior_mixing_probs.view(),
            &routing.caps_presence_prob.view(),
        )?;

        let labels = match &config.label_key {
            Some(key) => data.labels(key)?.map(|l| l.to_owned()),
            None => None,
        };
        let classification = match (&labels, &self.probes) {
            (Some(labels), Some(probes)) => {
                let labeled = data.labeled();
                Some(ClassificationOutput {
                    posterior: probes.posterior.evaluate(
                        &mass_explained.view(),
                        &labels.view(),
                        labeled.as_ref(),
                    )?,
                    prior: probes.prior.evaluate(
                        &routing.caps_presence_prob.view(),
                        &labels.view(),
                        labeled.as_ref(),
                    )?,
                })
            }
            _ => None,
        };
        let best_cls_acc = classification
            .as_ref()
            .map(|c| c.posterior.accuracy.max(c.prior.accuracy));

        let primary_caps_l1 = flat_reduce(&primary.presence.view().into_dyn());

        let weight_decay_loss = if self.objective.weight_decay_enabled() {
            self.registry().weight_decay_sum()
        } else {
            0.0
        };

        let terms = LossTerms {
            rec_ll,
            caps_log_prob: mixture.log_prob,
            dynamic_weights_l2: routing.dynamic_weights_l2,
            primary_caps_l1,
            sparsity,
            weight_decay: weight_decay_loss,
            classification: classification.as_ref().map(|c| ClassificationTerms {
                posterior_xe: c.posterior.cross_entropy,
                prior_xe: c.prior.cross_entropy,
            }),
        };
        let breakdown = self.objective.breakdown(&terms);

        debug!(
            batch_size,
            n_parts = primary.n_parts(),
            n_caps = self.n_caps(),
            rec_ll,
            log_prob = mixture.log_prob,
            loss = breakdown.total,
            "passe avant"
        );

        // Présence des capsules primaires, quel que soit pres_type
        let template_pres = primary.presence.clone();
        Ok(AutoencoderOutput {
            target,
            encoder_input,
            h,
            templates,
            bottom_up_rec,
            top_down_rec,
            rec,
            top_down_per_caps_rec,
            template_pres,
            rec_mode,
            rec_mean,
            mse_per_pixel,
            mse,
            rec_ll_per_pixel,
            rec_ll,
            mass_explained,
            primary_caps_l1,
            sparsity,
            labels,
            classification,
            best_cls_acc,
            weight_decay_loss,
            loss: breakdown.total,
            breakdown,
            routing,
            primary,
        })
    }

    /// Rapport scalaire d'une passe; n'influence jamais la perte
    pub fn report(&self, out: &AutoencoderOutput) -> Result<Report> {
        let mut report = Report::default();

        report.insert("loss", out.loss);
        report.insert("rec_ll", out.rec_ll);
        report.insert("mse", out.mse);
        report.insert("log_prob", out.log_prob());
        report.insert("dynamic_weights_l2", out.dynamic_weights_l2());
        report.insert("posterior_within_sparsity_loss", out.sparsity.posterior_within);
        report.insert("posterior_between_sparsity_loss", out.sparsity.posterior_between);
        report.insert("prior_within_sparsity_loss", out.sparsity.prior_within);
        report.insert("prior_between_sparsity_loss", out.sparsity.prior_between);
        report.insert("primary_caps_l1", out.primary_caps_l1);
        report.insert("weight_decay_loss", out.weight_decay_loss);

        if let Some(cls) = &out.classification {
            report.insert("posterior_cls_xe", cls.posterior.cross_entropy);
            report.insert("posterior_cls_acc", cls.posterior.accuracy);
            report.insert("prior_cls_xe", cls.prior.cross_entropy);
            report.insert("prior_cls_acc", cls.prior.accuracy);
        }
        if let Some(acc) = out.best_cls_acc {
            report.insert("best_cls_acc", acc);
        }

        let votes = votes_per_capsule(&out.routing.mixture.is_from_capsule.view(), self.n_caps())?;
        report.set_votes_per_capsule(&votes);
        let mass = normalized_mass(&out.mass_explained.view());
        report.normalized_mass = rows(&mass);

        if let (Some(labels), Some(n_classes)) = (&out.labels, self.config.n_classes) {
            // Corrélation postérieure sur la masse normalisée par exemple
            let posterior = label_correlation(&mass.view(), &labels.view(), n_classes)?;
            let prior = label_correlation(&out.routing.caps_presence_prob.view(), &labels.view(), n_classes)?;
            report.posterior_label_correlation = Some(rows(&posterior));
            report.prior_label_correlation = Some(rows(&prior));
        }

        Ok(report)
    }

    /// Diagnostic rapide
    pub fn diagnostic(&self) -> Result<()> {
        let (c, h, w) = self.config.image_shape;
        println!("🔍 DIAGNOSTIC RAPIDE");
        println!("   Image: {:?}", self.config.image_shape);
        println!(
            "   Parties: {} | Capsules objets: {} x {} votes",
            self.config.n_parts,
            self.n_caps(),
            self.routing.n_votes()
        );
        println!("   Poids régularisables: {}", self.registry().len());

        let record = DataRecord::new().with_image(self.config.input_key.clone(), Array4::zeros((1, c, h, w)));
        let out = self.forward(&record)?;
        println!("   Reconstruction: {:?}", out.rec_mode.dim());
        println!("   Perte sur une image nulle: {:.4}", out.loss);
        println!("✅ Modèle opérationnel");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::builder::AutoencoderBuilder;
    use crate::model::config::TargetPrep;
    use crate::model::params::{Decayable, NamedParam};
    use crate::model::preprocess::normalized_sobel_edges;
    use crate::train_data::SyntheticLoader;
    use ndarray::{array, s, ArrayView4};

    fn small_config() -> AutoencoderConfig {
        let mut config = AutoencoderConfig::default();
        config.image_shape = (1, 8, 8);
        config.n_parts = 3;
        config.n_votes = 3;
        config.n_object_caps = 2;
        config.template_size = (3, 3);
        config.n_classes = Some(3);
        config.part_feature_dim = Some(2);
        config.img_embedding_dim = Some(2);
        config.object_encoder.hidden_dim = 8;
        config.object_encoder.enc_dim = 6;
        config.seed = 7;
        config
    }

    fn build(config: AutoencoderConfig) -> ImageAutoencoder {
        AutoencoderBuilder::new().with_config(config).build().unwrap()
    }

    fn record(config: &AutoencoderConfig, batch_size: usize, labels: bool) -> DataRecord {
        let mut loader = SyntheticLoader::new(config.image_shape, 3, 1).unwrap();
        let label_key = if labels { config.label_key.as_deref() } else { None };
        loader.next_record(batch_size, &config.input_key, label_key)
    }

    /// Encodeur primaire fixe: présence 1, poses identité translatées
    struct FixedPrimary {
        n_parts: usize,
    }

    impl Decayable for FixedPrimary {
        fn decayable(&self) -> Vec<NamedParam<'_>> {
            Vec::new()
        }
    }

    impl PrimaryEncoder for FixedPrimary {
        fn n_parts(&self) -> usize {
            self.n_parts
        }

        fn pose_dim(&self) -> usize {
            6
        }

        fn feature_dim(&self) -> Option<usize> {
            None
        }

        fn embedding_dim(&self) -> Option<usize> {
            None
        }

        fn encode(&self, images: &ArrayView4<f32>) -> Result<PrimaryCaps> {
            let batch_size = images.dim().0;
            let pose = Array3::from_shape_fn((batch_size, self.n_parts, 6), |(b, p, d)| match d {
                0 | 4 => 1.0,
                2 => 0.2 * p as f32,
                5 => 0.1 * b as f32,
                _ => 0.0,
            });
            Ok(PrimaryCaps {
                pose,
                presence: Array2::ones((batch_size, self.n_parts)),
                feature: None,
                img_embedding: None,
            })
        }
    }

    #[test]
    fn test_forward_shapes() {
        let config = small_config();
        let model = build(config.clone());
        let out = model.forward(&record(&config, 4, true)).unwrap();

        assert_eq!(out.rec_mode.dim(), (4, 1, 8, 8));
        assert_eq!(out.rec_mean.dim(), (4, 1, 8, 8));
        assert_eq!(out.rec_ll_per_pixel.dim(), (4, 8, 8));
        assert_eq!(out.h.dim(), (4, 6));
        // pose + absence + traits + gabarits aplatis
        assert_eq!(out.encoder_input.dim(), (4, 3, 6 + 1 + 2 + 9));
        assert_eq!(out.routing.vote.dim(), (4, 2, 3, 6));
        assert_eq!(out.top_down_per_caps_rec.pdf.means.dim().0, 8);
        assert_eq!(out.used_templates().dim(), (4, 3, 8, 8));
        assert_eq!(out.primary_presence().dim(), (4, 3));
        assert!(out.loss.is_finite());
        assert!(out.mse >= 0.0);
    }

    #[test]
    fn test_templates_shared_across_decodes() {
        let config = small_config();
        let out = build(config.clone())
            .forward(&record(&config, 2, false))
            .unwrap();

        assert!(out.bottom_up_rec.templates.same_as(&out.templates));
        assert!(out.top_down_rec.templates.same_as(&out.templates));
        assert!(out.rec.templates.same_as(&out.templates));
        assert!(out.top_down_per_caps_rec.templates.same_as(&out.templates));
    }

    #[test]
    fn test_decode_sources_leave_other_paths_unchanged() {
        let base = small_config();
        let data = record(&base, 3, true);
        let reference = build(base.clone()).forward(&data).unwrap();

        let sources = [DecodeSource::Enc, DecodeSource::Soft, DecodeSource::Hard];
        for vote_type in sources {
            for pres_type in sources {
                let mut config = base.clone();
                config.vote_type = vote_type;
                config.pres_type = pres_type;
                let out = build(config).forward(&data).unwrap();

                assert_eq!(out.bottom_up_rec.pdf.means, reference.bottom_up_rec.pdf.means);
                assert_eq!(out.bottom_up_rec.pdf.log_mix, reference.bottom_up_rec.pdf.log_mix);
                assert_eq!(out.top_down_rec.pdf.means, reference.top_down_rec.pdf.means);
                assert_eq!(out.top_down_rec.pdf.log_mix, reference.top_down_rec.pdf.log_mix);
            }
        }
    }

    #[test]
    fn test_enc_sources_decode_primary_capsules() {
        let mut config = small_config();
        config.vote_type = DecodeSource::Enc;
        config.pres_type = DecodeSource::Enc;
        let out = build(config.clone()).forward(&record(&config, 2, false)).unwrap();

        assert_eq!(out.rec.pdf.log_mix, out.bottom_up_rec.pdf.log_mix);
        assert_eq!(out.template_pres, out.primary.presence);
    }

    #[test]
    fn test_template_presence_is_primary_presence() {
        let mut config = small_config();
        config.pres_type = DecodeSource::Soft;
        let out = build(config.clone()).forward(&record(&config, 2, false)).unwrap();

        assert_eq!(out.template_pres, out.primary.presence);
        assert_ne!(out.template_pres, out.routing.mixture.soft_winner_pres);
    }

    #[test]
    fn test_absent_labels_drop_classification() {
        let config = small_config();
        let model = build(config.clone());
        let out = model.forward(&record(&config, 4, false)).unwrap();

        assert!(out.classification.is_none());
        assert!(out.best_cls_acc.is_none());
        assert!(out.breakdown.classification.is_none());

        let b = &out.breakdown;
        let expected = b.reconstruction
            + b.caps_likelihood
            + b.dynamic_l2
            + b.primary_sparsity
            + b.posterior_within
            + b.posterior_between
            + b.prior_within
            + b.prior_between
            + b.weight_decay;
        assert_eq!(out.loss, expected);

        let report = model.report(&out).unwrap();
        assert!(report.get("posterior_cls_xe").is_none());
        assert!(report.posterior_label_correlation.is_none());
    }

    #[test]
    fn test_labels_add_classification() {
        let config = small_config();
        let model = build(config.clone());
        let out = model.forward(&record(&config, 4, true)).unwrap();

        let cls = out.classification.unwrap();
        assert!(cls.posterior.cross_entropy > 0.0);
        assert_eq!(out.best_cls_acc, Some(cls.posterior.accuracy.max(cls.prior.accuracy)));

        let xe = out.breakdown.classification.unwrap();
        assert!((xe - cls.posterior.cross_entropy - cls.prior.cross_entropy).abs() < 1e-5);

        let report = model.report(&out).unwrap();
        assert!(report.get("best_cls_acc").is_some());
        let corr = report.prior_label_correlation.unwrap();
        assert_eq!((corr.len(), corr[0].len()), (2, 3));
    }

    #[test]
    fn test_fully_unlabeled_batch_has_zero_xe() {
        let config = small_config();
        let data = record(&config, 2, true).with_labeled_mask(array![false, false]);
        let out = build(config).forward(&data).unwrap();

        let cls = out.classification.unwrap();
        assert_eq!(cls.posterior.cross_entropy, 0.0);
        assert_eq!(cls.prior.cross_entropy, 0.0);
    }

    #[test]
    fn test_minimal_objective_is_reconstruction_plus_capsule_likelihood() {
        let mut config = AutoencoderConfig::default();
        config.image_shape = (1, 2, 2);
        config.n_parts = 2;
        config.n_votes = 2;
        config.n_object_caps = 2;
        config.template_size = (2, 2);
        config.part_feature_dim = None;
        config.img_embedding_dim = None;
        config.label_key = None;
        config.n_classes = None;

        let model = AutoencoderBuilder::new()
            .with_config(config)
            .with_primary_encoder(Box::new(FixedPrimary { n_parts: 2 }))
            .build()
            .unwrap();

        let images = Array4::from_shape_fn((4, 1, 2, 2), |(b, _, y, x)| ((b + y + x) % 2) as f32);
        let out = model
            .forward(&DataRecord::new().with_image("image", images))
            .unwrap();

        assert!(out.primary.presence.iter().all(|&p| p == 1.0));
        assert_eq!(out.loss, -out.rec_ll - out.log_prob());

        let b = &out.breakdown;
        for contribution in [
            b.dynamic_l2,
            b.primary_sparsity,
            b.posterior_within,
            b.posterior_between,
            b.prior_within,
            b.prior_between,
            b.weight_decay,
        ] {
            assert_eq!(contribution, 0.0);
        }
        assert!(b.classification.is_none());
        assert_eq!(out.weight_decay_loss, 0.0);
    }

    #[test]
    fn test_weight_decay_only_when_weighted() {
        let mut config = small_config();
        let data = record(&config, 2, false);

        let model = build(config.clone());
        assert_eq!(model.forward(&data).unwrap().weight_decay_loss, 0.0);

        config.weights.weight_decay = 0.1;
        let model = build(config);
        let out = model.forward(&data).unwrap();
        assert!(out.weight_decay_loss > 0.0);
        assert_eq!(out.weight_decay_loss, model.registry().weight_decay_sum());
        assert!((out.breakdown.weight_decay - 0.1 * out.weight_decay_loss).abs() < 1e-5);
    }

    #[test]
    fn test_registry_holds_weights_only() {
        let model = build(small_config());
        let registry = model.registry();
        assert!(!registry.is_empty());
        assert!(registry.names().iter().all(|name| name.ends_with("/w")));
    }

    #[test]
    fn test_repeated_forward_is_stateless() {
        let config = small_config();
        let model = build(config.clone());
        let data = record(&config, 3, true);

        let first = model.forward(&data).unwrap();
        let second = model.forward(&data).unwrap();
        assert_eq!(first.loss, second.loss);
        assert_eq!(first.rec_mean, second.rec_mean);
        assert_eq!(first.routing.mixture.is_from_capsule, second.routing.mixture.is_from_capsule);
    }

    #[test]
    fn test_sobel_prep_changes_target_only() {
        let mut config = small_config();
        let data = record(&config, 2, false);
        let plain = build(config.clone()).forward(&data).unwrap();

        config.prep = TargetPrep::Sobel;
        let out = build(config.clone()).forward(&data).unwrap();

        let image = data.image(&config.input_key).unwrap();
        assert_eq!(out.target, normalized_sobel_edges(&image));
        assert_eq!(out.h, plain.h);
    }

    #[test]
    fn test_encoder_without_presence_gets_poses_only() {
        let mut config = small_config();
        config.object_encoder.use_presence = false;
        let out = build(config.clone()).forward(&record(&config, 2, false)).unwrap();
        assert_eq!(out.encoder_input.dim(), (2, 3, 6 + 1 + 2));
    }

    #[test]
    fn test_per_capsule_rows_follow_examples() {
        let config = small_config();
        let model = build(config.clone());
        let out = model.forward(&record(&config, 2, false)).unwrap();
        assert_eq!(out.top_down_per_caps_rec.transformed_templates.dim(), (4, 3, 8, 8));

        // Ligne 3 = exemple 1, capsule 1
        let (b, c) = (1, 1);
        let vote = out.routing.vote.slice(s![b..b + 1, c, .., ..]).to_owned();
        let presence = Array2::from_shape_fn((1, 3), |(_, v)| {
            out.routing.vote_presence_prob[[b, c, v]] * out.primary.presence[[b, v]]
        });
        let feature = out.primary.feature.as_ref().unwrap().slice(s![b..b + 1, .., ..]).to_owned();
        let embedding = out.primary.img_embedding.as_ref().unwrap().slice(s![b..b + 1, ..]).to_owned();
        let templates = Templates::new(out.templates.view().slice(s![b..b + 1, .., .., ..]).to_owned());
        let ctx = DecoderContext {
            template_feature: Some(feature.view()),
            img_embedding: Some(embedding.view()),
        };
        let expected = model
            .decoder
            .decode(&templates, &vote.view(), &presence.view(), &ctx)
            .unwrap();

        let row = out.top_down_per_caps_rec.pdf.log_mix.slice(s![b * 2 + c, .., .., ..]).to_owned();
        let expected_row = expected.pdf.log_mix.slice(s![0, .., .., ..]).to_owned();
        for (a, e) in row.iter().zip(expected_row.iter()) {
            assert!((a - e).abs() < 1e-5);
        }
    }

    #[test]
    fn test_missing_image_field() {
        let model = build(small_config());
        let err = model.forward(&DataRecord::new()).unwrap_err();
        assert!(matches!(err, ScaeError::MissingField(_)));
    }

    #[test]
    fn test_wrong_image_shape_rejected() {
        let model = build(small_config());
        let data = DataRecord::new().with_image("image", Array4::zeros((2, 1, 4, 4)));
        assert!(matches!(model.forward(&data), Err(ScaeError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_report_lists_votes_per_capsule() {
        let config = small_config();
        let model = build(config.clone());
        let out = model.forward(&record(&config, 4, true)).unwrap();
        let report = model.report(&out).unwrap();

        let total: f32 = (0..2)
            .map(|k| report.get(&format!("votes_per_capsule_{}", k)).unwrap())
            .sum();
        assert!(total <= 3.0 + 1e-5);
        assert_eq!(report.get("loss"), Some(out.loss));
        assert_eq!(report.normalized_mass.len(), 4);
    }

    #[test]
    fn test_posterior_correlation_uses_normalized_mass() {
        let config = small_config();
        let model = build(config.clone());
        let out = model.forward(&record(&config, 4, true)).unwrap();
        let report = model.report(&out).unwrap();

        let labels = out.labels.clone().unwrap();
        let mass = normalized_mass(&out.mass_explained.view());
        let expected = label_correlation(&mass.view(), &labels.view(), 3).unwrap();
        assert_eq!(report.posterior_label_correlation, Some(rows(&expected)));
    }
}
