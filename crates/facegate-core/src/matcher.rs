//! Similarity metrics, score fusion and the match decision.

use crate::features::{log_scaled, FeatureDescriptor};
use crate::policy::Policy;
use crate::quality::QualityReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const EPS: f32 = 1e-6;

/// A similarity score between two descriptors, in [0, 1].
pub trait SimilarityMetric: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, probe: &FeatureDescriptor, reference: &FeatureDescriptor) -> f32;
}

/// Block vectors compared by the vector metrics. Color is used only when
/// both descriptors carry it.
fn vectors(a: &FeatureDescriptor, b: &FeatureDescriptor) -> (Vec<f32>, Vec<f32>) {
    let with_color = a.color_mean.is_some() && b.color_mean.is_some();
    (a.to_vector(with_color), b.to_vector(with_color))
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Histogram scaled to sum 1 (unchanged if empty).
fn to_distribution(values: &[f32]) -> Vec<f32> {
    let sum: f32 = values.iter().sum();
    if sum > 0.0 {
        values.iter().map(|v| v / sum).collect()
    } else {
        values.to_vec()
    }
}

/// Half the L1 distance between two histograms as distributions, in [0, 1].
fn histogram_distance(a: &[f32], b: &[f32]) -> f32 {
    let (pa, pb) = (to_distribution(a), to_distribution(b));
    (pa.iter().zip(&pb).map(|(x, y)| (x - y).abs()).sum::<f32>() / 2.0).clamp(0.0, 1.0)
}

fn relative_distance(a: f32, b: f32) -> f32 {
    let scale = a.abs().max(b.abs());
    if scale < EPS {
        0.0
    } else {
        ((a - b).abs() / scale).clamp(0.0, 1.0)
    }
}

/// `max(0, 1 − d)` over a block-weighted normalised distance.
pub struct DistanceMetric;

impl DistanceMetric {
    const HISTOGRAM: f32 = 0.30;
    const TEXTURE: f32 = 0.30;
    const MOMENTS: f32 = 0.15;
    const EDGE: f32 = 0.05;
    const COLOR: f32 = 0.10;
    const GRADIENT: f32 = 0.10;

    /// Weighted distance in [0, 1]. The color weight is dropped, and the
    /// rest renormalised, when either side lacks color.
    pub fn distance(a: &FeatureDescriptor, b: &FeatureDescriptor) -> f32 {
        let histogram = histogram_distance(&a.histogram, &b.histogram);
        let texture = histogram_distance(&a.texture, &b.texture);
        let moments = a
            .moments
            .iter()
            .zip(&b.moments)
            .map(|(x, y)| relative_distance(log_scaled(*x), log_scaled(*y)))
            .sum::<f32>()
            / a.moments.len() as f32;
        let edge = relative_distance(a.edge_density, b.edge_density);
        let gradient = a
            .gradient_mean
            .iter()
            .zip(&b.gradient_mean)
            .map(|(x, y)| relative_distance(*x, *y))
            .sum::<f32>()
            / 2.0;

        let mut weighted = histogram * Self::HISTOGRAM
            + texture * Self::TEXTURE
            + moments * Self::MOMENTS
            + edge * Self::EDGE
            + gradient * Self::GRADIENT;
        let mut total = Self::HISTOGRAM + Self::TEXTURE + Self::MOMENTS + Self::EDGE + Self::GRADIENT;

        if let (Some(ca), Some(cb)) = (a.color_mean, b.color_mean) {
            let color = ca.iter().zip(&cb).map(|(x, y)| (x - y).abs() / 255.0).sum::<f32>() / 3.0;
            weighted += color.clamp(0.0, 1.0) * Self::COLOR;
            total += Self::COLOR;
        }
        (weighted / total).clamp(0.0, 1.0)
    }
}

impl SimilarityMetric for DistanceMetric {
    fn name(&self) -> &'static str {
        "distance"
    }

    fn score(&self, probe: &FeatureDescriptor, reference: &FeatureDescriptor) -> f32 {
        (1.0 - Self::distance(probe, reference)).max(0.0)
    }
}

pub struct CosineMetric;

impl SimilarityMetric for CosineMetric {
    fn name(&self) -> &'static str {
        "cosine"
    }

    fn score(&self, probe: &FeatureDescriptor, reference: &FeatureDescriptor) -> f32 {
        let (a, b) = vectors(probe, reference);
        let (na, nb) = (norm(&a), norm(&b));
        if na < EPS || nb < EPS {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        (dot / (na * nb)).clamp(0.0, 1.0)
    }
}

/// `max(0, Pearson r)`.
pub struct CorrelationMetric;

impl SimilarityMetric for CorrelationMetric {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn score(&self, probe: &FeatureDescriptor, reference: &FeatureDescriptor) -> f32 {
        let (a, b) = vectors(probe, reference);
        let n = a.len() as f32;
        let (ma, mb) = (a.iter().sum::<f32>() / n, b.iter().sum::<f32>() / n);
        let (mut cov, mut va, mut vb) = (0f32, 0f32, 0f32);
        for (x, y) in a.iter().zip(&b) {
            cov += (x - ma) * (y - mb);
            va += (x - ma).powi(2);
            vb += (y - mb).powi(2);
        }
        if va < EPS || vb < EPS {
            return 0.0;
        }
        (cov / (va.sqrt() * vb.sqrt())).clamp(0.0, 1.0)
    }
}

/// `max(0, 1 − ‖a − b‖ / (‖a‖ + ‖b‖))`.
pub struct EuclideanMetric;

impl SimilarityMetric for EuclideanMetric {
    fn name(&self) -> &'static str {
        "euclidean"
    }

    fn score(&self, probe: &FeatureDescriptor, reference: &FeatureDescriptor) -> f32 {
        let (a, b) = vectors(probe, reference);
        let scale = norm(&a) + norm(&b);
        if scale < EPS {
            return 1.0;
        }
        let diff: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x - y).collect();
        (1.0 - norm(&diff) / scale).max(0.0)
    }
}

/// Mean of the intensity and texture histogram intersections.
pub struct HistogramIntersectionMetric;

impl SimilarityMetric for HistogramIntersectionMetric {
    fn name(&self) -> &'static str {
        "histogram_intersection"
    }

    fn score(&self, probe: &FeatureDescriptor, reference: &FeatureDescriptor) -> f32 {
        let intersect = |a: &[f32], b: &[f32]| {
            to_distribution(a)
                .iter()
                .zip(&to_distribution(b))
                .map(|(x, y)| x.min(*y))
                .sum::<f32>()
        };
        let h = intersect(&probe.histogram, &reference.histogram);
        let t = intersect(&probe.texture, &reference.texture);
        ((h + t) / 2.0).clamp(0.0, 1.0)
    }
}

/// Per-method scores of one comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScores {
    pub distance: f32,
    pub cosine: f32,
    pub correlation: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub euclidean: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram_intersection: Option<f32>,
    /// Scores of metrics outside the built-in set, keyed by metric name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other: BTreeMap<String, f32>,
    /// Weighted fusion of the method scores.
    pub method_confidence: f32,
}

impl MatchScores {
    /// Every individual method score that was computed.
    pub fn method_scores(&self) -> Vec<f32> {
        let mut scores = vec![self.distance, self.cosine, self.correlation];
        scores.extend(self.euclidean);
        scores.extend(self.histogram_intersection);
        scores.extend(self.other.values().copied());
        scores
    }

    /// Spread between the best and worst method score.
    pub fn spread(&self) -> f32 {
        let scores = self.method_scores();
        let max = scores.iter().copied().fold(f32::MIN, f32::max);
        let min = scores.iter().copied().fold(f32::MAX, f32::min);
        max - min
    }
}

/// Weighted set of metrics fused into one method confidence.
pub struct MetricSet {
    metrics: Vec<(Box<dyn SimilarityMetric>, f32)>,
}

impl MetricSet {
    pub fn new(metrics: Vec<(Box<dyn SimilarityMetric>, f32)>) -> Self {
        Self { metrics }
    }

    pub fn weighted(metric: impl SimilarityMetric + 'static, weight: f32) -> (Box<dyn SimilarityMetric>, f32) {
        (Box::new(metric), weight)
    }

    /// distance 0.4, cosine 0.3, histogram intersection 0.2, correlation 0.1.
    pub fn standard() -> Self {
        Self::new(vec![
            Self::weighted(DistanceMetric, 0.4),
            Self::weighted(CosineMetric, 0.3),
            Self::weighted(HistogramIntersectionMetric, 0.2),
            Self::weighted(CorrelationMetric, 0.1),
        ])
    }

    /// distance 0.4, cosine 0.3, euclidean 0.2, correlation 0.1.
    pub fn high_assurance() -> Self {
        Self::new(vec![
            Self::weighted(DistanceMetric, 0.4),
            Self::weighted(CosineMetric, 0.3),
            Self::weighted(EuclideanMetric, 0.2),
            Self::weighted(CorrelationMetric, 0.1),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.metrics.iter().map(|(m, _)| m.name()).collect()
    }

    pub fn compare(&self, probe: &FeatureDescriptor, reference: &FeatureDescriptor) -> MatchScores {
        let mut scores = MatchScores {
            distance: 0.0,
            cosine: 0.0,
            correlation: 0.0,
            euclidean: None,
            histogram_intersection: None,
            other: BTreeMap::new(),
            method_confidence: 0.0,
        };
        let mut computed = [false; 3];
        let (mut weighted, mut total) = (0f32, 0f32);

        for (metric, weight) in &self.metrics {
            let s = metric.score(probe, reference).clamp(0.0, 1.0);
            match metric.name() {
                "distance" => {
                    scores.distance = s;
                    computed[0] = true;
                }
                "cosine" => {
                    scores.cosine = s;
                    computed[1] = true;
                }
                "correlation" => {
                    scores.correlation = s;
                    computed[2] = true;
                }
                "euclidean" => scores.euclidean = Some(s),
                "histogram_intersection" => scores.histogram_intersection = Some(s),
                other => {
                    scores.other.insert(other.to_string(), s);
                }
            }
            weighted += s * weight;
            total += weight;
        }

        // The three core scores are always reported, even if not fused.
        if !computed[0] {
            scores.distance = DistanceMetric.score(probe, reference);
        }
        if !computed[1] {
            scores.cosine = CosineMetric.score(probe, reference);
        }
        if !computed[2] {
            scores.correlation = CorrelationMetric.score(probe, reference);
        }

        scores.method_confidence = if total > 0.0 { (weighted / total).clamp(0.0, 1.0) } else { 0.0 };
        scores
    }
}

/// `clamp(0.7·method + 0.2·quality + 0.1·liveness)`.
pub fn blended_confidence(method_confidence: f32, quality: f32, liveness: f32) -> f32 {
    (method_confidence * 0.7 + quality * 0.2 + liveness * 0.1).clamp(0.0, 1.0)
}

/// Why a comparison did not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchFailure {
    LowQuality,
    BelowThreshold,
    DistanceFloor,
    CosineFloor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchDecision {
    pub confidence: f32,
    pub matched: bool,
    pub failure: Option<MatchFailure>,
}

/// A match needs the blended confidence at or above `threshold` and every
/// individual floor of `policy` cleared; confidence never compensates for
/// a failing floor.
pub fn decide(scores: &MatchScores, quality: &QualityReport, policy: &Policy, threshold: f32) -> MatchDecision {
    let confidence = blended_confidence(scores.method_confidence, quality.overall, quality.liveness);
    let failure = if quality.overall < policy.verify_quality_floor {
        Some(MatchFailure::LowQuality)
    } else if scores.distance < policy.distance_floor {
        Some(MatchFailure::DistanceFloor)
    } else if policy.cosine_floor.is_some_and(|floor| scores.cosine < floor) {
        Some(MatchFailure::CosineFloor)
    } else if confidence < threshold {
        Some(MatchFailure::BelowThreshold)
    } else {
        None
    };
    MatchDecision {
        confidence,
        matched: failure.is_none(),
        failure,
    }
}
