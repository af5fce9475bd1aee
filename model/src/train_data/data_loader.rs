use ndarray::{s, Array1, Array4};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::time::Instant;
use tracing::debug;

use super::record::DataRecord;
use crate::model::error::{Result, ScaeError};

/// Générateur de lots synthétiques: k carrés clairs, étiquette k - 1
pub struct SyntheticLoader {
    image_shape: (usize, usize, usize),
    n_classes: usize,
    square_size: usize,
    rng: StdRng,
}

impl SyntheticLoader {
    pub fn new(image_shape: (usize, usize, usize), n_classes: usize, seed: u64) -> Result<Self> {
        let (_, h, w) = image_shape;
        let square_size = (h.min(w) / 4).max(1);
        let cells = (h / square_size) * (w / square_size);

        if n_classes == 0 || n_classes > cells {
            return Err(ScaeError::Config(format!(
                "n_classes ({}) doit être dans [1, {}] pour une image {}x{}",
                n_classes, cells, h, w
            )));
        }

        Ok(Self {
            image_shape,
            n_classes,
            square_size,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Images [B, C, H, W] et étiquettes [B]
    pub fn next_batch(&mut self, batch_size: usize) -> (Array4<f32>, Array1<usize>) {
        let start = Instant::now();
        let (c, h, w) = self.image_shape;
        let size = self.square_size;
        let (rows, cols) = (h / size, w / size);

        let mut images = Array4::zeros((batch_size, c, h, w));
        let mut labels = Array1::zeros(batch_size);
        let mut cells: Vec<usize> = (0..rows * cols).collect();

        for b in 0..batch_size {
            let k = self.rng.random_range(1..=self.n_classes);
            cells.shuffle(&mut self.rng);

            for &cell in cells.iter().take(k) {
                let (y, x) = ((cell / cols) * size, (cell % cols) * size);
                images
                    .slice_mut(s![b, .., y..y + size, x..x + size])
                    .fill(1.0);
            }
            labels[b] = k - 1;
        }

        debug!(batch_size, elapsed = ?start.elapsed(), "lot synthétique généré");
        (images, labels)
    }

    /// Lot prêt pour le modèle, étiquettes incluses si `label_key` est donné
    pub fn next_record(
        &mut self,
        batch_size: usize,
        input_key: &str,
        label_key: Option<&str>,
    ) -> DataRecord {
        let (images, labels) = self.next_batch(batch_size);
        let record = DataRecord::new().with_image(input_key, images);
        match label_key {
            Some(key) => record.with_labels(key, labels),
            None => record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_counts_squares() {
        let mut loader = SyntheticLoader::new((1, 8, 8), 4, 3).unwrap();
        let (images, labels) = loader.next_batch(6);

        assert_eq!(images.dim(), (6, 1, 8, 8));
        for b in 0..6 {
            // Carrés de 2x2 sans recouvrement
            let lit = images.slice(s![b, 0, .., ..]).iter().filter(|&&v| v == 1.0).count();
            assert_eq!(lit, (labels[b] + 1) * 4);
            assert!(labels[b] < 4);
        }
    }

    #[test]
    fn test_same_seed_same_batches() {
        let mut a = SyntheticLoader::new((1, 8, 8), 3, 42).unwrap();
        let mut b = SyntheticLoader::new((1, 8, 8), 3, 42).unwrap();
        assert_eq!(a.next_batch(4), b.next_batch(4));
    }

    #[test]
    fn test_too_many_classes_rejected() {
        assert!(SyntheticLoader::new((1, 2, 2), 5, 0).is_err());
    }

    #[test]
    fn test_record_without_labels() {
        let mut loader = SyntheticLoader::new((1, 8, 8), 2, 0).unwrap();
        let record = loader.next_record(2, "image", None);
        assert!(record.image("image").is_ok());
        assert!(record.labels("label").unwrap().is_none());
    }
}
