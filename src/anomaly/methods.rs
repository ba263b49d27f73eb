// Outlier classification methods. Each evaluates the newest sample against
// a baseline window and returns a score in units native to the method.

use crate::domain::DetectionMethod;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MethodOutcome {
    Normal,
    Anomaly { score: f64 },
    /// Baseline has not accumulated `min_samples` yet; the detector defers.
    InsufficientData,
}

impl MethodOutcome {
    pub fn is_anomaly(&self) -> bool {
        matches!(self, MethodOutcome::Anomaly { .. })
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64], mu: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Evaluate the newest sample `x` against the `baseline` (which excludes
/// `x`).
pub fn evaluate(method: &DetectionMethod, baseline: &[f64], x: f64) -> MethodOutcome {
    match method {
        DetectionMethod::ZScore {
            threshold,
            min_samples,
        } => {
            if baseline.len() < *min_samples {
                return MethodOutcome::InsufficientData;
            }
            let mu = mean(baseline);
            let sigma = std_dev(baseline, mu);
            if sigma < f64::EPSILON {
                return MethodOutcome::Normal;
            }
            let score = ((x - mu) / sigma).abs();
            if score >= *threshold {
                MethodOutcome::Anomaly { score }
            } else {
                MethodOutcome::Normal
            }
        }

        DetectionMethod::Iqr { k, min_samples } => {
            if baseline.len() < *min_samples {
                return MethodOutcome::InsufficientData;
            }
            let mut sorted = baseline.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let q1 = sorted[sorted.len() / 4];
            let q3 = sorted[(sorted.len() * 3) / 4];
            let iqr = q3 - q1;
            if iqr < f64::EPSILON {
                return MethodOutcome::Normal;
            }
            let lower = q1 - k * iqr;
            let upper = q3 + k * iqr;
            if x < lower || x > upper {
                let distance = if x < lower { lower - x } else { x - upper };
                MethodOutcome::Anomaly {
                    score: distance / iqr,
                }
            } else {
                MethodOutcome::Normal
            }
        }

        DetectionMethod::Mad {
            threshold,
            min_samples,
        } => {
            if baseline.len() < *min_samples {
                return MethodOutcome::InsufficientData;
            }
            let mut sorted = baseline.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let m = median(&sorted);
            let mut deviations: Vec<f64> = baseline.iter().map(|v| (v - m).abs()).collect();
            deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mad = median(&deviations);
            if mad < f64::EPSILON {
                return MethodOutcome::Normal;
            }
            // 1.4826 scales MAD to the stddev of a normal distribution
            let score = ((x - m) / (1.4826 * mad)).abs();
            if score >= *threshold {
                MethodOutcome::Anomaly { score }
            } else {
                MethodOutcome::Normal
            }
        }

        DetectionMethod::MovingAverage {
            window_size,
            deviation,
        } => {
            if baseline.len() < *window_size || *window_size == 0 {
                return MethodOutcome::InsufficientData;
            }
            let window = &baseline[baseline.len() - window_size..];
            let mu = mean(window);
            if mu.abs() < f64::EPSILON {
                return MethodOutcome::Normal;
            }
            let relative = ((x - mu) / mu).abs();
            if relative >= *deviation {
                MethodOutcome::Anomaly { score: relative }
            } else {
                MethodOutcome::Normal
            }
        }

        DetectionMethod::ExponentialEma {
            alpha,
            deviation,
            min_samples,
        } => {
            if baseline.len() < *min_samples || baseline.is_empty() {
                return MethodOutcome::InsufficientData;
            }
            let mut ema = baseline[0];
            for value in &baseline[1..] {
                ema = alpha * value + (1.0 - alpha) * ema;
            }
            if ema.abs() < f64::EPSILON {
                return MethodOutcome::Normal;
            }
            let relative = ((x - ema) / ema).abs();
            if relative >= *deviation {
                MethodOutcome::Anomaly { score: relative }
            } else {
                MethodOutcome::Normal
            }
        }

        DetectionMethod::Threshold { min, max } => {
            if let Some(min) = min {
                if x < *min {
                    return MethodOutcome::Anomaly { score: min - x };
                }
            }
            if let Some(max) = max {
                if x > *max {
                    return MethodOutcome::Anomaly { score: x - max };
                }
            }
            MethodOutcome::Normal
        }
    }
}

/// How many trailing samples sit inside the baseline band. Drives
/// auto-resolution of active alerts.
pub fn trailing_in_band(method: &DetectionMethod, values: &[f64]) -> usize {
    let mut count = 0;
    for i in (1..values.len()).rev() {
        let outcome = evaluate(method, &values[..i], values[i]);
        match outcome {
            MethodOutcome::Normal => count += 1,
            _ => break,
        }
    }
    count
}
