use tracing::debug;

use super::config::ObjectiveWeights;
use super::error::Result;
use super::sparsity::SparsityTerms;

/// Termes de classification, présents seulement si le lot est étiqueté
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationTerms {
    pub posterior_xe: f32,
    pub prior_xe: f32,
}

/// Termes bruts de l'objectif, calculés une fois par passe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossTerms {
    pub rec_ll: f32,
    pub caps_log_prob: f32,
    pub dynamic_weights_l2: f32,
    pub primary_caps_l1: f32,
    pub sparsity: SparsityTerms,
    pub weight_decay: f32,
    pub classification: Option<ClassificationTerms>,
}

/// Contribution signée de chaque terme à la perte totale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    pub reconstruction: f32,
    pub caps_likelihood: f32,
    pub dynamic_l2: f32,
    pub primary_sparsity: f32,
    pub posterior_within: f32,
    pub posterior_between: f32,
    pub prior_within: f32,
    pub prior_between: f32,
    pub weight_decay: f32,
    pub classification: Option<f32>,
    pub total: f32,
}

/// Combinaison pondérée des termes de l'objectif.
///
/// Les pertes inter-exemples sont soustraites (à maximiser), tous les
/// autres termes sont ajoutés.
#[derive(Debug, Clone)]
pub struct ObjectiveAssembler {
    weights: ObjectiveWeights,
}

impl ObjectiveAssembler {
    pub fn new(weights: ObjectiveWeights) -> Result<Self> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &ObjectiveWeights {
        &self.weights
    }

    pub fn weight_decay_enabled(&self) -> bool {
        self.weights.weight_decay > 0.0
    }

    pub fn breakdown(&self, terms: &LossTerms) -> LossBreakdown {
        let w = &self.weights;

        let reconstruction = -terms.rec_ll;
        let caps_likelihood = -w.caps_ll * terms.caps_log_prob;
        let dynamic_l2 = w.dynamic_l2 * terms.dynamic_weights_l2;
        let primary_sparsity = w.primary_caps_sparsity * terms.primary_caps_l1;
        let posterior_within = w.posterior_within_sparsity * terms.sparsity.posterior_within;
        let posterior_between = -w.posterior_between_sparsity * terms.sparsity.posterior_between;
        let prior_within = w.prior_within_sparsity * terms.sparsity.prior_within;
        let prior_between = -w.prior_between_sparsity * terms.sparsity.prior_between;
        let weight_decay = w.weight_decay * terms.weight_decay;

        let mut total = reconstruction
            + caps_likelihood
            + dynamic_l2
            + primary_sparsity
            + posterior_within
            + posterior_between
            + prior_within
            + prior_between
            + weight_decay;

        // Absents du lot: les termes de classification ne sont pas ajoutés du tout
        let classification = terms.classification.map(|c| c.posterior_xe + c.prior_xe);
        if let Some(xe) = classification {
            total += xe;
        }

        let breakdown = LossBreakdown {
            reconstruction,
            caps_likelihood,
            dynamic_l2,
            primary_sparsity,
            posterior_within,
            posterior_between,
            prior_within,
            prior_between,
            weight_decay,
            classification,
            total,
        };
        debug!(?breakdown, "objectif assemblé");
        breakdown
    }

    pub fn assemble(&self, terms: &LossTerms) -> f32 {
        self.breakdown(terms).total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::error::ScaeError;

    fn terms() -> LossTerms {
        LossTerms {
            rec_ll: -12.5,
            caps_log_prob: -3.0,
            dynamic_weights_l2: 0.7,
            primary_caps_l1: 2.0,
            sparsity: SparsityTerms {
                posterior_within: 0.4,
                posterior_between: 1.2,
                prior_within: 0.3,
                prior_between: 0.9,
            },
            weight_decay: 5.0,
            classification: None,
        }
    }

    fn all_weights(value: f32) -> ObjectiveWeights {
        ObjectiveWeights {
            caps_ll: value,
            dynamic_l2: value,
            primary_caps_sparsity: value,
            posterior_within_sparsity: value,
            posterior_between_sparsity: value,
            prior_within_sparsity: value,
            prior_between_sparsity: value,
            weight_decay: value,
        }
    }

    #[test]
    fn test_signs_of_terms() {
        let assembler = ObjectiveAssembler::new(all_weights(1.0)).unwrap();
        let loss = assembler.assemble(&terms());

        let expected = 12.5 + 3.0 + 0.7 + 2.0 + 0.4 - 1.2 + 0.3 - 0.9 + 5.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_zero_weight_matches_absent_term() {
        let mut weights = all_weights(0.5);
        weights.posterior_between_sparsity = 0.0;
        weights.weight_decay = 0.0;
        let assembler = ObjectiveAssembler::new(weights).unwrap();

        let with_terms = terms();
        let mut without = terms();
        without.sparsity.posterior_between = 0.0;
        without.weight_decay = 0.0;

        assert_eq!(assembler.assemble(&with_terms), assembler.assemble(&without));
    }

    #[test]
    fn test_classification_added_only_when_present() {
        let assembler = ObjectiveAssembler::new(ObjectiveWeights::default()).unwrap();
        let unlabeled = terms();
        let mut labeled = terms();
        labeled.classification = Some(ClassificationTerms {
            posterior_xe: 0.6,
            prior_xe: 0.8,
        });

        let base = assembler.breakdown(&unlabeled);
        let with_cls = assembler.breakdown(&labeled);

        assert!(base.classification.is_none());
        assert!((with_cls.total - base.total - 1.4).abs() < 1e-5);
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut weights = ObjectiveWeights::default();
        weights.dynamic_l2 = -0.1;
        assert!(matches!(ObjectiveAssembler::new(weights), Err(ScaeError::Config(_))));
    }
}
