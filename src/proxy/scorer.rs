//! Learned proxy outcome model.
//!
//! A pluggable accelerator on top of the heuristic proxy score. The selector
//! records (feature vector, outcome) pairs into a bounded training set; a
//! background worker periodically refits the model. Until the model has been
//! fitted it predicts nothing and the heuristic stands alone.

use crate::history::BoundedHistory;

/// One recorded (features, outcome) pair. The label is "request succeeded
/// and was not detected".
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub features: Vec<f64>,
    pub success: bool,
}

/// Bounded buffer of training samples, oldest dropped first.
#[derive(Debug)]
pub struct TrainingSet {
    samples: BoundedHistory<TrainingSample>,
}

impl TrainingSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: BoundedHistory::new(capacity),
        }
    }

    pub fn push(&mut self, sample: TrainingSample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrainingSample> {
        self.samples.iter()
    }
}

/// Success-probability model behind the selector's scoring blend.
///
/// Implementations degrade gracefully: `predict` returns `None` while the
/// model is unfit, and the selector falls back to the heuristic score alone.
pub trait SuccessModel: Send + Sync {
    fn predict(&self, features: &[f64]) -> Option<f64>;
    /// Refit from the sample buffer. Returns whether the model is usable.
    fn fit(&mut self, samples: &TrainingSet) -> bool;
    fn is_trained(&self) -> bool;
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Online logistic regression over the fixed feature layout.
#[derive(Debug)]
pub struct LogisticModel {
    weights: Vec<f64>,
    bias: f64,
    learning_rate: f64,
    epochs: usize,
    min_samples: usize,
    trained: bool,
}

impl LogisticModel {
    pub fn new(min_samples: usize) -> Self {
        Self {
            weights: Vec::new(),
            bias: 0.0,
            learning_rate: 0.05,
            epochs: 5,
            min_samples,
            trained: false,
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }
}

impl SuccessModel for LogisticModel {
    fn predict(&self, features: &[f64]) -> Option<f64> {
        if !self.trained || features.len() != self.weights.len() {
            return None;
        }
        let z: f64 = self
            .weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias;
        Some(sigmoid(z))
    }

    fn fit(&mut self, samples: &TrainingSet) -> bool {
        if samples.len() < self.min_samples {
            return self.trained;
        }
        let width = match samples.iter().next() {
            Some(sample) => sample.features.len(),
            None => return self.trained,
        };

        self.weights = vec![0.0; width];
        self.bias = 0.0;
        for _ in 0..self.epochs {
            for sample in samples.iter() {
                if sample.features.len() != width {
                    continue;
                }
                let z: f64 = self
                    .weights
                    .iter()
                    .zip(&sample.features)
                    .map(|(w, x)| w * x)
                    .sum::<f64>()
                    + self.bias;
                let error = sigmoid(z) - if sample.success { 1.0 } else { 0.0 };
                for (weight, x) in self.weights.iter_mut().zip(&sample.features) {
                    *weight -= self.learning_rate * error * x;
                }
                self.bias -= self.learning_rate * error;
            }
        }
        self.trained = true;
        true
    }

    fn is_trained(&self) -> bool {
        self.trained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(feature: f64, success: bool) -> TrainingSample {
        TrainingSample {
            features: vec![feature, 1.0 - feature],
            success,
        }
    }

    #[test]
    fn unfit_model_predicts_nothing() {
        let model = LogisticModel::new(10);
        assert_eq!(model.predict(&[0.5, 0.5]), None);
        assert!(!model.is_trained());
    }

    #[test]
    fn refuses_to_fit_below_min_samples() {
        let mut model = LogisticModel::new(10);
        let mut set = TrainingSet::new(100);
        for _ in 0..5 {
            set.push(sample(1.0, true));
        }
        assert!(!model.fit(&set));
        assert_eq!(model.predict(&[1.0, 0.0]), None);
    }

    #[test]
    fn learns_a_separable_signal() {
        let mut model = LogisticModel::new(10).with_learning_rate(0.5);
        let mut set = TrainingSet::new(1000);
        for _ in 0..100 {
            set.push(sample(1.0, true));
            set.push(sample(0.0, false));
        }
        assert!(model.fit(&set));

        let good = model.predict(&[1.0, 0.0]).unwrap();
        let bad = model.predict(&[0.0, 1.0]).unwrap();
        assert!(good > 0.7, "good={}", good);
        assert!(bad < 0.3, "bad={}", bad);
    }
}
