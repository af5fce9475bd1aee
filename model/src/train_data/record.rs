use ndarray::{Array1, Array4, ArrayView1, ArrayView4};
use std::collections::HashMap;

use crate::model::error::{Result, ScaeError};

/// Clé du masque des exemples étiquetés
pub const LABELED_KEY: &str = "labeled";

/// Champ nommé d'un lot
#[derive(Debug, Clone)]
pub enum Field {
    Image(Array4<f32>),
    Labels(Array1<usize>),
    Mask(Array1<bool>),
}

/// Lot de données: champs nommés
#[derive(Debug, Clone, Default)]
pub struct DataRecord {
    fields: HashMap<String, Field>,
}

impl DataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, key: impl Into<String>, image: Array4<f32>) -> Self {
        self.fields.insert(key.into(), Field::Image(image));
        self
    }

    pub fn with_labels(mut self, key: impl Into<String>, labels: Array1<usize>) -> Self {
        self.fields.insert(key.into(), Field::Labels(labels));
        self
    }

    pub fn with_labeled_mask(mut self, mask: Array1<bool>) -> Self {
        self.fields.insert(LABELED_KEY.to_string(), Field::Mask(mask));
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Image obligatoire [B, C, H, W]
    pub fn image(&self, key: &str) -> Result<ArrayView4<'_, f32>> {
        match self.fields.get(key) {
            Some(Field::Image(image)) => Ok(image.view()),
            Some(_) => Err(ScaeError::InvalidInput(format!(
                "le champ \"{}\" n'est pas une image",
                key
            ))),
            None => Err(ScaeError::MissingField(key.to_string())),
        }
    }

    /// Étiquettes, si le lot en contient
    pub fn labels(&self, key: &str) -> Result<Option<ArrayView1<'_, usize>>> {
        match self.fields.get(key) {
            Some(Field::Labels(labels)) => Ok(Some(labels.view())),
            Some(_) => Err(ScaeError::InvalidInput(format!(
                "le champ \"{}\" ne contient pas d'étiquettes",
                key
            ))),
            None => Ok(None),
        }
    }

    /// Masque des exemples étiquetés, absent = tous étiquetés
    pub fn labeled(&self) -> Option<ArrayView1<'_, bool>> {
        match self.fields.get(LABELED_KEY) {
            Some(Field::Mask(mask)) => Some(mask.view()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_missing_image_is_missing_field() {
        let record = DataRecord::new();
        assert!(matches!(record.image("image"), Err(ScaeError::MissingField(_))));
    }

    #[test]
    fn test_optional_labels() {
        let record = DataRecord::new().with_image("image", Array4::zeros((2, 1, 2, 2)));
        assert!(record.labels("label").unwrap().is_none());
        assert!(record.labeled().is_none());

        let record = record
            .with_labels("label", array![0usize, 1])
            .with_labeled_mask(array![true, false]);
        assert_eq!(record.labels("label").unwrap().map(|l| l.len()), Some(2));
        assert_eq!(record.labeled().map(|m| m[1]), Some(false));
    }

    #[test]
    fn test_wrong_field_kind_rejected() {
        let record = DataRecord::new().with_labels("image", array![1usize]);
        assert!(matches!(record.image("image"), Err(ScaeError::InvalidInput(_))));
    }
}
