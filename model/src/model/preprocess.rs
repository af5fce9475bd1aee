use ndarray::{Array4, ArrayView2, ArrayView4, Axis};
use rayon::prelude::*;

use super::config::TargetPrep;

const SOBEL_X: [[f32; 3]; 3] = [[-1.0, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]];
const SOBEL_Y: [[f32; 3]; 3] = [[-1.0, -2.0, -1.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]];

/// Cible de reconstruction selon le prétraitement demandé
pub fn prepare_target(images: &ArrayView4<f32>, prep: TargetPrep) -> Array4<f32> {
    match prep {
        TargetPrep::None => images.to_owned(),
        TargetPrep::Sobel => normalized_sobel_edges(images),
    }
}

/// Magnitude du gradient de Sobel d'un canal, bords répliqués
fn sobel_magnitude(channel: &ArrayView2<f32>, out: &mut ndarray::ArrayViewMut2<f32>) {
    let (h, w) = channel.dim();
    let at = |y: isize, x: isize| {
        let y = y.clamp(0, h as isize - 1) as usize;
        let x = x.clamp(0, w as isize - 1) as usize;
        channel[[y, x]]
    };

    for y in 0..h {
        for x in 0..w {
            let (mut gx, mut gy) = (0.0f32, 0.0f32);
            for ky in 0..3 {
                for kx in 0..3 {
                    let v = at(y as isize + ky as isize - 1, x as isize + kx as isize - 1);
                    gx += SOBEL_X[ky][kx] * v;
                    gy += SOBEL_Y[ky][kx] * v;
                }
            }
            out[[y, x]] = (gx * gx + gy * gy).sqrt();
        }
    }
}

/// Contours de Sobel: médiane retirée, bornés à 0, divisés par le max (par image)
pub fn normalized_sobel_edges(images: &ArrayView4<f32>) -> Array4<f32> {
    let mut edges = Array4::zeros(images.dim());

    edges
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(b, mut image)| {
            for (c, mut channel) in image.axis_iter_mut(Axis(0)).enumerate() {
                sobel_magnitude(&images.index_axis(Axis(0), b).index_axis(Axis(0), c), &mut channel);
            }

            let mut sorted: Vec<f32> = image.iter().copied().collect();
            if sorted.is_empty() {
                return;
            }
            sorted.sort_by(|a, b| a.total_cmp(b));
            let median = sorted[((sorted.len() - 1) as f32 * 0.5).round() as usize];

            image.mapv_inplace(|v| (v - median).max(0.0));
            let max = image.fold(0.0f32, |acc, &v| acc.max(v));
            if max > 0.0 {
                image.mapv_inplace(|v| v / max);
            }
        });

    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    #[test]
    fn test_flat_image_has_no_edges() {
        let images = Array4::from_elem((2, 1, 5, 5), 0.7f32);
        let edges = normalized_sobel_edges(&images.view());
        assert!(edges.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_edges_normalised_to_unit_max() {
        let mut images = Array4::<f32>::zeros((1, 1, 6, 6));
        images.slice_mut(s![0, 0, .., 3..]).fill(1.0);

        let edges = normalized_sobel_edges(&images.view());
        let max = edges.fold(0.0f32, |acc, &v| acc.max(v));
        assert!((max - 1.0).abs() < 1e-6);
        assert!(edges.iter().all(|&v| v >= 0.0));
        // Loin du bord vertical: pas de contour
        assert_eq!(edges[[0, 0, 2, 0]], 0.0);
        assert!(edges[[0, 0, 2, 3]] > 0.0);
    }

    #[test]
    fn test_no_prep_keeps_images() {
        let images = Array4::from_elem((1, 1, 2, 2), 0.3f32);
        assert_eq!(prepare_target(&images.view(), TargetPrep::None), images);
    }
}
