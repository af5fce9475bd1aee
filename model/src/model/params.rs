use ndarray::ArrayViewD;
use tracing::warn;

/// Tenseur de poids nommé, exposé à la décroissance des poids
#[derive(Debug, Clone)]
pub struct NamedParam<'a> {
    pub name: String,
    pub values: ArrayViewD<'a, f32>,
}

impl<'a> NamedParam<'a> {
    pub fn new(name: impl Into<String>, values: ArrayViewD<'a, f32>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// `½ Σ w²`
    pub fn l2_loss(&self) -> f32 {
        0.5 * self.values.iter().map(|v| v * v).sum::<f32>()
    }
}

/// Composant portant des poids soumis à la décroissance.
///
/// Les biais ne sont jamais enregistrés.
pub trait Decayable {
    fn decayable(&self) -> Vec<NamedParam<'_>>;
}

/// Registre explicite des poids régularisés
#[derive(Debug, Default)]
pub struct ParamRegistry<'a> {
    params: Vec<NamedParam<'a>>,
}

impl<'a> ParamRegistry<'a> {
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    pub fn register<D: Decayable + ?Sized>(&mut self, component: &'a D) {
        self.params.extend(component.decayable());
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }

    /// Somme des `l2_loss` de tous les poids enregistrés, 0 si le registre est vide
    pub fn weight_decay_sum(&self) -> f32 {
        if self.params.is_empty() {
            warn!("aucun poids enregistré pour la décroissance, contribution nulle");
            return 0.0;
        }
        self.params.iter().map(NamedParam::l2_loss).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    struct Fixed {
        w: Array2<f32>,
        b: Array2<f32>,
    }

    impl Decayable for Fixed {
        fn decayable(&self) -> Vec<NamedParam<'_>> {
            vec![NamedParam::new("fixed/w", self.w.view().into_dyn())]
        }
    }

    #[test]
    fn test_registry_sums_weights_only() {
        let fixed = Fixed {
            w: array![[1.0, 2.0], [0.0, 2.0]],
            b: array![[100.0]],
        };
        let mut registry = ParamRegistry::new();
        registry.register(&fixed);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["fixed/w"]);
        assert!((registry.weight_decay_sum() - 4.5).abs() < 1e-6);
        assert_eq!(fixed.b[[0, 0]], 100.0);
    }

    #[test]
    fn test_empty_registry_is_zero() {
        let registry = ParamRegistry::new();
        assert_eq!(registry.weight_decay_sum(), 0.0);
    }
}
