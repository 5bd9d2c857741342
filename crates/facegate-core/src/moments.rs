//! Intensity-weighted image moments and the seven Hu invariants.

use image::GrayImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroMass;

/// Compute the seven Hu moment invariants of a grayscale image, treating
/// pixel intensity as mass.
///
/// Returns `ZeroMass` for an all-black image, where the centroid is undefined.
pub fn hu_moments(gray: &GrayImage) -> Result<[f64; 7], ZeroMass> {
    let (mut m00, mut m10, mut m01) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y, px) in gray.enumerate_pixels() {
        let v = px[0] as f64;
        m00 += v;
        m10 += x as f64 * v;
        m01 += y as f64 * v;
    }
    if m00 <= 0.0 {
        return Err(ZeroMass);
    }
    let (cx, cy) = (m10 / m00, m01 / m00);

    let (mut mu20, mut mu02, mut mu11) = (0.0f64, 0.0f64, 0.0f64);
    let (mut mu30, mut mu03, mut mu21, mut mu12) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for (x, y, px) in gray.enumerate_pixels() {
        let v = px[0] as f64;
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        mu20 += dx * dx * v;
        mu02 += dy * dy * v;
        mu11 += dx * dy * v;
        mu30 += dx * dx * dx * v;
        mu03 += dy * dy * dy * v;
        mu21 += dx * dx * dy * v;
        mu12 += dx * dy * dy * v;
    }

    // Scale normalisation: eta_pq = mu_pq / m00^(1 + (p+q)/2)
    let n2 = m00.powi(2);
    let n3 = m00.powf(2.5);
    let (n20, n02, n11) = (mu20 / n2, mu02 / n2, mu11 / n2);
    let (n30, n03, n21, n12) = (mu30 / n3, mu03 / n3, mu21 / n3, mu12 / n3);

    let a = n30 + n12;
    let b = n21 + n03;
    let h1 = n20 + n02;
    let h2 = (n20 - n02).powi(2) + 4.0 * n11.powi(2);
    let h3 = (n30 - 3.0 * n12).powi(2) + (3.0 * n21 - n03).powi(2);
    let h4 = a.powi(2) + b.powi(2);
    let h5 = (n30 - 3.0 * n12) * a * (a.powi(2) - 3.0 * b.powi(2))
        + (3.0 * n21 - n03) * b * (3.0 * a.powi(2) - b.powi(2));
    let h6 = (n20 - n02) * (a.powi(2) - b.powi(2)) + 4.0 * n11 * a * b;
    let h7 = (3.0 * n21 - n03) * a * (a.powi(2) - 3.0 * b.powi(2))
        - (n30 - 3.0 * n12) * b * (3.0 * a.powi(2) - b.powi(2));

    Ok([h1, h2, h3, h4, h5, h6, h7])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_zero_mass() {
        assert_eq!(hu_moments(&GrayImage::new(10, 10)), Err(ZeroMass));
    }

    #[test]
    fn test_symmetric_square_has_no_odd_terms() {
        let img = GrayImage::from_fn(21, 21, |x, y| {
            if (5..=15).contains(&x) && (5..=15).contains(&y) {
                Luma([200])
            } else {
                Luma([0])
            }
        });
        let hu = hu_moments(&img).unwrap();
        assert!(hu[0] > 0.0);
        assert!(hu[1].abs() < 1e-12);
        assert!(hu[2].abs() < 1e-12);
        assert!(hu[3].abs() < 1e-12);
    }

    #[test]
    fn test_translation_invariance() {
        let blob = |ox: u32, oy: u32| {
            GrayImage::from_fn(40, 40, move |x, y| {
                if x >= ox && x < ox + 8 && y >= oy && y < oy + 4 {
                    Luma([255])
                } else {
                    Luma([0])
                }
            })
        };
        let a = hu_moments(&blob(2, 3)).unwrap();
        let b = hu_moments(&blob(20, 25)).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_elongated_shape_has_positive_h2() {
        let img = GrayImage::from_fn(30, 30, |x, y| {
            if (2..28).contains(&x) && (12..16).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        assert!(hu_moments(&img).unwrap()[1] > 0.0);
    }
}
