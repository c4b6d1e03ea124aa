//! Score blending
//!
//! Weighted mean of component scores, with confidence reduced in
//! proportion to how much the components disagree.

/// One model's contribution to a blend
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendComponent {
    pub score: f64,
    pub confidence: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendOutcome {
    pub score: f64,
    pub confidence: f64,
    /// Spread between the highest and lowest component score
    pub disagreement: f64,
    /// Weights actually applied, normalized to sum to 1
    pub normalized_weights: [f64; 2],
}

/// Blend two components
///
/// `score = Σ(w·s) / Σw`, falling back to equal weights when the weights
/// are unusable. `confidence = mean(c) · (1 - min(1, scale · |s_a - s_b|))`.
#[must_use]
pub fn blend(a: BlendComponent, b: BlendComponent, penalty_scale: f64) -> BlendOutcome {
    let (wa, wb) = usable_weights(a.weight, b.weight);
    let score = (wa * a.score + wb * b.score) / (wa + wb);

    let disagreement = (a.score - b.score).abs();
    let penalty = (penalty_scale * disagreement).min(1.0);
    let confidence = (a.confidence + b.confidence) / 2.0 * (1.0 - penalty);

    BlendOutcome {
        score: score.clamp(0.0, 1.0),
        confidence: confidence.clamp(0.0, 1.0),
        disagreement,
        normalized_weights: [wa / (wa + wb), wb / (wa + wb)],
    }
}

fn usable_weights(wa: f64, wb: f64) -> (f64, f64) {
    let valid = |w: f64| w.is_finite() && w >= 0.0;
    if valid(wa) && valid(wb) && wa + wb > 0.0 {
        (wa, wb)
    } else {
        (1.0, 1.0)
    }
}
