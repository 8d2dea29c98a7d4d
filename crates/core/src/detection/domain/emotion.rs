use serde::Serialize;

/// One entry of a ranked emotion list as sent to clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankedEmotion {
    pub emotion: String,
    pub score: f64,
    pub percentage: f64,
}

/// Pairs scores with their labels, highest score first.
///
/// Extra scores without a label (or labels without a score) are ignored.
/// Ties keep label order.
pub fn rank(labels: &[String], scores: &[f64]) -> Vec<RankedEmotion> {
    let mut ranked: Vec<RankedEmotion> = labels
        .iter()
        .zip(scores.iter())
        .map(|(label, &score)| RankedEmotion {
            emotion: label.clone(),
            score,
            percentage: score * 100.0,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

/// Numerically stable softmax, used when a model emits raw logits.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}

/// True when `scores` already look like a probability distribution.
pub fn is_distribution(scores: &[f32]) -> bool {
    let sum: f32 = scores.iter().sum();
    scores.iter().all(|&s| (0.0..=1.0).contains(&s)) && (sum - 1.0).abs() < 1e-3
}
