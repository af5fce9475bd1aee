use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::error::{Result, ScaeError};
use super::layers::AFFINE_POSE_DIM;

/// Source d'un argument du décodage principal (vote ou présence)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeSource {
    /// Sortie directe de l'encodeur primaire
    Enc,
    /// Vote moyen pondéré par le postérieur
    Soft,
    /// Vote gagnant
    Hard,
}

impl FromStr for DecodeSource {
    type Err = ScaeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enc" => Ok(DecodeSource::Enc),
            "soft" => Ok(DecodeSource::Soft),
            "hard" => Ok(DecodeSource::Hard),
            other => Err(ScaeError::Config(format!(
                "type de source invalide \"{}\" (attendu enc|soft|hard)",
                other
            ))),
        }
    }
}

impl fmt::Display for DecodeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodeSource::Enc => "enc",
            DecodeSource::Soft => "soft",
            DecodeSource::Hard => "hard",
        };
        f.write_str(name)
    }
}

/// Famille de pertes de parcimonie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SparsityLossType {
    Entropy,
    Kl,
    L2,
}

impl FromStr for SparsityLossType {
    type Err = ScaeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "entropy" => Ok(SparsityLossType::Entropy),
            "kl" => Ok(SparsityLossType::Kl),
            "l2" => Ok(SparsityLossType::L2),
            other => Err(ScaeError::Config(format!(
                "perte de parcimonie invalide \"{}\"",
                other
            ))),
        }
    }
}

/// Prétraitement de la cible de reconstruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPrep {
    None,
    Sobel,
}

impl FromStr for TargetPrep {
    type Err = ScaeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(TargetPrep::None),
            "sobel" => Ok(TargetPrep::Sobel),
            other => Err(ScaeError::Config(format!(
                "prétraitement invalide \"{}\"",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectEncoderConfig {
    pub hidden_dim: usize,
    pub enc_dim: usize,
    /// L'encodeur reçoit la présence des parties en argument séparé
    pub use_presence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparsityConfig {
    pub prior_loss_type: SparsityLossType,
    pub posterior_loss_type: SparsityLossType,
    pub prior_within_example_constant: f32,
}

/// Poids des termes de l'objectif (0 désactive un terme)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveWeights {
    pub caps_ll: f32,
    pub dynamic_l2: f32,
    pub primary_caps_sparsity: f32,
    pub posterior_within_sparsity: f32,
    pub posterior_between_sparsity: f32,
    pub prior_within_sparsity: f32,
    pub prior_between_sparsity: f32,
    pub weight_decay: f32,
}

impl ObjectiveWeights {
    fn named(&self) -> [(&'static str, f32); 8] {
        [
            ("caps_ll", self.caps_ll),
            ("dynamic_l2", self.dynamic_l2),
            ("primary_caps_sparsity", self.primary_caps_sparsity),
            ("posterior_within_sparsity", self.posterior_within_sparsity),
            ("posterior_between_sparsity", self.posterior_between_sparsity),
            ("prior_within_sparsity", self.prior_within_sparsity),
            ("prior_between_sparsity", self.prior_between_sparsity),
            ("weight_decay", self.weight_decay),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        for (name, weight) in self.named() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ScaeError::Config(format!(
                    "le poids {} doit être fini et positif (reçu {})",
                    name, weight
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoencoderConfig {
    pub input_key: String,
    pub label_key: Option<String>,
    pub n_classes: Option<usize>,
    /// (canaux, hauteur, largeur)
    pub image_shape: (usize, usize, usize),
    pub n_parts: usize,
    pub pose_dim: usize,
    pub part_feature_dim: Option<usize>,
    pub img_embedding_dim: Option<usize>,
    pub template_size: (usize, usize),
    pub n_object_caps: usize,
    pub n_votes: usize,
    pub object_encoder: ObjectEncoderConfig,
    pub vote_type: DecodeSource,
    pub pres_type: DecodeSource,
    pub feed_templates: bool,
    pub prep: TargetPrep,
    pub sparsity: SparsityConfig,
    pub weights: ObjectiveWeights,
    /// Écart-type des composantes du mélange de pixels
    pub output_scale: f32,
    /// Logit du fond dans le mélange de pixels
    pub background_logit: f32,
    pub seed: u64,
}

impl AutoencoderConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Nombre de classes pour les pertes de parcimonie L2
    pub fn sparsity_classes(&self) -> f32 {
        self.n_classes.unwrap_or(10) as f32
    }

    pub fn validate(&self) -> Result<()> {
        let (c, h, w) = self.image_shape;
        let (th, tw) = self.template_size;
        let sizes = [
            ("image_shape.0", c),
            ("image_shape.1", h),
            ("image_shape.2", w),
            ("template_size.0", th),
            ("template_size.1", tw),
            ("n_parts", self.n_parts),
            ("n_object_caps", self.n_object_caps),
            ("n_votes", self.n_votes),
            ("object_encoder.hidden_dim", self.object_encoder.hidden_dim),
            ("object_encoder.enc_dim", self.object_encoder.enc_dim),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ScaeError::Config(format!("{} doit être > 0", name)));
            }
        }

        if self.input_key.is_empty() {
            return Err(ScaeError::Config("input_key vide".to_string()));
        }

        if self.pose_dim != AFFINE_POSE_DIM {
            return Err(ScaeError::Config(format!(
                "pose_dim doit valoir {} (pose affine), reçu {}",
                AFFINE_POSE_DIM, self.pose_dim
            )));
        }

        // Un vote par partie: les votes d'une capsule se décodent avec les gabarits des parties
        if self.n_votes != self.n_parts {
            return Err(ScaeError::Config(format!(
                "n_votes ({}) doit égaler n_parts ({})",
                self.n_votes, self.n_parts
            )));
        }

        if matches!(self.part_feature_dim, Some(0)) || matches!(self.img_embedding_dim, Some(0)) {
            return Err(ScaeError::Config(
                "les dimensions optionnelles doivent être > 0".to_string(),
            ));
        }

        if self.label_key.is_some() && self.n_classes.unwrap_or(0) < 2 {
            return Err(ScaeError::Config(
                "label_key exige n_classes >= 2".to_string(),
            ));
        }

        if !(self.output_scale.is_finite() && self.output_scale > 0.0) {
            return Err(ScaeError::Config(format!(
                "output_scale doit être > 0 (reçu {})",
                self.output_scale
            )));
        }

        if !self.background_logit.is_finite() {
            return Err(ScaeError::Config("background_logit non fini".to_string()));
        }

        if !self.sparsity.prior_within_example_constant.is_finite() {
            return Err(ScaeError::Config(
                "prior_within_example_constant non fini".to_string(),
            ));
        }

        self.weights.validate()
    }
}

impl Default for ObjectEncoderConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 32,
            enc_dim: 16,
            use_presence: true,
        }
    }
}

impl Default for SparsityConfig {
    fn default() -> Self {
        Self {
            prior_loss_type: SparsityLossType::Kl,
            posterior_loss_type: SparsityLossType::Kl,
            prior_within_example_constant: 0.0,
        }
    }
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            caps_ll: 1.0,
            dynamic_l2: 0.0,
            primary_caps_sparsity: 0.0,
            posterior_within_sparsity: 0.0,
            posterior_between_sparsity: 0.0,
            prior_within_sparsity: 0.0,
            prior_between_sparsity: 0.0,
            weight_decay: 0.0,
        }
    }
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            input_key: "image".to_string(),
            label_key: Some("label".to_string()),
            n_classes: Some(4),
            image_shape: (1, 16, 16),
            n_parts: 4,
            pose_dim: AFFINE_POSE_DIM,
            part_feature_dim: Some(4),
            img_embedding_dim: Some(4),
            template_size: (5, 5),
            n_object_caps: 3,
            n_votes: 4,
            object_encoder: ObjectEncoderConfig::default(),
            vote_type: DecodeSource::Soft,
            pres_type: DecodeSource::Enc,
            feed_templates: true,
            prep: TargetPrep::None,
            sparsity: SparsityConfig::default(),
            weights: ObjectiveWeights::default(),
            output_scale: 0.1,
            background_logit: -2.0,
            seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AutoencoderConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bogus_vote_type_is_config_error() {
        let err = "bogus".parse::<DecodeSource>().unwrap_err();
        assert!(matches!(err, ScaeError::Config(_)));

        let err = AutoencoderConfig::from_json_str(r#"{"vote_type": "bogus"}"#).unwrap_err();
        assert!(matches!(err, ScaeError::Config(_)));
    }

    #[test]
    fn test_bogus_sparsity_type_is_config_error() {
        let err = "l1".parse::<SparsityLossType>().unwrap_err();
        assert!(matches!(err, ScaeError::Config(_)));

        let json = r#"{"sparsity": {"prior_loss_type": "bogus"}}"#;
        assert!(matches!(
            AutoencoderConfig::from_json_str(json),
            Err(ScaeError::Config(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            AutoencoderConfig::from_json_str(r#"{"vote_type": "hard", "pres_type": "soft"}"#)
                .unwrap();
        assert_eq!(config.vote_type, DecodeSource::Hard);
        assert_eq!(config.pres_type, DecodeSource::Soft);
        assert_eq!(config.n_parts, AutoencoderConfig::default().n_parts);
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut config = AutoencoderConfig::default();
        config.weights.prior_between_sparsity = -1.0;
        assert!(matches!(config.validate(), Err(ScaeError::Config(_))));
    }

    #[test]
    fn test_votes_must_match_parts() {
        let mut config = AutoencoderConfig::default();
        config.n_votes = config.n_parts + 1;
        assert!(matches!(config.validate(), Err(ScaeError::Config(_))));
    }

    #[test]
    fn test_label_key_requires_classes() {
        let mut config = AutoencoderConfig::default();
        config.n_classes = None;
        assert!(config.validate().is_err());
        config.label_key = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_round_trip() {
        let mut config = AutoencoderConfig::default();
        config.prep = TargetPrep::Sobel;
        config.weights.weight_decay = 0.5;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_json().unwrap().as_bytes()).unwrap();

        let loaded = AutoencoderConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
