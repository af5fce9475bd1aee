use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use tracing::info;

use super::capsule::VoteRoutingLayer;
use super::config::AutoencoderConfig;
use super::core::{ImageAutoencoder, Probes};
use super::decoder::{TemplateDecoder, TemplateImageDecoder};
use super::encoder::{LinearPrimaryEncoder, ObjectEncoder, PrimaryEncoder, SetPoolEncoder};
use super::error::{Result, ScaeError};
use super::probe::{ClassificationProbe, LinearProbe};

/// Constructeur de modèle
///
/// Les collaborateurs non fournis sont créés depuis la configuration, dans un
/// ordre fixe et avec un générateur initialisé par `config.seed`.
pub struct AutoencoderBuilder {
    config: Option<AutoencoderConfig>,
    primary_encoder: Option<Box<dyn PrimaryEncoder>>,
    object_encoder: Option<Box<dyn ObjectEncoder>>,
    template_decoder: Option<Box<dyn TemplateDecoder>>,
    probes: Option<Probes>,
}

impl AutoencoderBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            primary_encoder: None,
            object_encoder: None,
            template_decoder: None,
            probes: None,
        }
    }

    pub fn with_config(mut self, config: AutoencoderConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_primary_encoder(mut self, encoder: Box<dyn PrimaryEncoder>) -> Self {
        self.primary_encoder = Some(encoder);
        self
    }

    pub fn with_object_encoder(mut self, encoder: Box<dyn ObjectEncoder>) -> Self {
        self.object_encoder = Some(encoder);
        self
    }

    pub fn with_template_decoder(mut self, decoder: Box<dyn TemplateDecoder>) -> Self {
        self.template_decoder = Some(decoder);
        self
    }

    pub fn with_probes(
        mut self,
        posterior: Box<dyn ClassificationProbe>,
        prior: Box<dyn ClassificationProbe>,
    ) -> Self {
        self.probes = Some(Probes { posterior, prior });
        self
    }

    /// Largeur attendue de l'entrée de l'encodeur d'objets
    fn encoder_input_dim(config: &AutoencoderConfig, accepts_presence: bool) -> usize {
        let mut dim = config.pose_dim + 1 + config.part_feature_dim.unwrap_or(0);
        if config.feed_templates && accepts_presence {
            let (th, tw) = config.template_size;
            dim += th * tw;
        }
        dim
    }

    fn check_primary(config: &AutoencoderConfig, encoder: &dyn PrimaryEncoder) -> Result<()> {
        if encoder.n_parts() != config.n_parts || encoder.pose_dim() != config.pose_dim {
            return Err(ScaeError::shape(
                (config.n_parts, config.pose_dim),
                (encoder.n_parts(), encoder.pose_dim()),
            ));
        }
        if encoder.feature_dim() != config.part_feature_dim {
            return Err(ScaeError::shape(config.part_feature_dim, encoder.feature_dim()));
        }
        if encoder.embedding_dim() != config.img_embedding_dim {
            return Err(ScaeError::shape(config.img_embedding_dim, encoder.embedding_dim()));
        }
        Ok(())
    }

    fn check_object(config: &AutoencoderConfig, encoder: &dyn ObjectEncoder) -> Result<()> {
        let expected = Self::encoder_input_dim(config, encoder.accepts_presence());
        if encoder.input_dim() != expected {
            return Err(ScaeError::shape(expected, encoder.input_dim()));
        }
        if encoder.output_dim() != config.object_encoder.enc_dim {
            return Err(ScaeError::shape(config.object_encoder.enc_dim, encoder.output_dim()));
        }
        Ok(())
    }

    fn check_decoder(config: &AutoencoderConfig, decoder: &dyn TemplateDecoder) -> Result<()> {
        if decoder.n_templates() != config.n_parts {
            return Err(ScaeError::shape(config.n_parts, decoder.n_templates()));
        }
        if decoder.template_size() != config.template_size {
            return Err(ScaeError::shape(config.template_size, decoder.template_size()));
        }
        if decoder.output_shape() != config.image_shape {
            return Err(ScaeError::shape(config.image_shape, decoder.output_shape()));
        }
        Ok(())
    }

    fn check_probes(config: &AutoencoderConfig, probes: &Option<Probes>) -> Result<()> {
        match (probes, config.label_key.as_ref(), config.n_classes) {
            (Some(probes), _, Some(n_classes)) => {
                for probe in [&probes.posterior, &probes.prior] {
                    if probe.n_classes() != n_classes {
                        return Err(ScaeError::shape(n_classes, probe.n_classes()));
                    }
                }
                Ok(())
            }
            (Some(_), _, None) => Err(ScaeError::Config(
                "des sondes exigent n_classes".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn build(self) -> Result<ImageAutoencoder> {
        let config = self
            .config
            .ok_or_else(|| ScaeError::Config("configuration requise".to_string()))?;

        // Validation avant toute allocation de tenseur
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.seed);

        let primary_encoder: Box<dyn PrimaryEncoder> = match self.primary_encoder {
            Some(encoder) => encoder,
            None => Box::new(LinearPrimaryEncoder::new(
                config.image_shape,
                config.n_parts,
                config.pose_dim,
                config.part_feature_dim,
                config.img_embedding_dim,
                &mut rng,
            )?),
        };
        Self::check_primary(&config, primary_encoder.as_ref())?;

        let decoder: Box<dyn TemplateDecoder> = match self.template_decoder {
            Some(decoder) => decoder,
            None => Box::new(TemplateImageDecoder::new(
                config.n_parts,
                config.template_size,
                config.image_shape,
                config.part_feature_dim,
                config.img_embedding_dim,
                config.output_scale,
                config.background_logit,
                &mut rng,
            )?),
        };
        Self::check_decoder(&config, decoder.as_ref())?;

        let object_encoder: Box<dyn ObjectEncoder> = match self.object_encoder {
            Some(encoder) => encoder,
            None => {
                let enc = &config.object_encoder;
                Box::new(SetPoolEncoder::new(
                    Self::encoder_input_dim(&config, enc.use_presence),
                    enc.hidden_dim,
                    enc.enc_dim,
                    enc.use_presence,
                    &mut rng,
                )?)
            }
        };
        Self::check_object(&config, object_encoder.as_ref())?;

        let routing = VoteRoutingLayer::new(
            config.object_encoder.enc_dim,
            config.n_object_caps,
            config.n_votes,
            config.pose_dim,
            &mut rng,
        )?;

        let probes = match (self.probes, &config.label_key, config.n_classes) {
            (Some(probes), _, _) => Some(probes),
            (None, Some(_), Some(n_classes)) => Some(Probes {
                posterior: Box::new(LinearProbe::new("posterior", config.n_object_caps, n_classes, &mut rng)?),
                prior: Box::new(LinearProbe::new("prior", config.n_object_caps, n_classes, &mut rng)?),
            }),
            _ => None,
        };
        Self::check_probes(&config, &probes)?;

        info!(
            n_parts = config.n_parts,
            n_object_caps = config.n_object_caps,
            n_votes = config.n_votes,
            vote_type = %config.vote_type,
            pres_type = %config.pres_type,
            probes = probes.is_some(),
            "modèle construit"
        );

        ImageAutoencoder::new(config, primary_encoder, object_encoder, routing, decoder, probes)
    }
}

impl Default for AutoencoderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
