//! Multinomial logistic regression trained online.
//!
//! Classes are strategy names. A successful outcome is a regular
//! cross-entropy step toward its label; a failed outcome pushes probability
//! mass away from the label that failed (gradient of `-ln(1 - p_label)`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIN_COMPLEMENT: f64 = 1e-6;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("feature vector has width {found}, model expects {expected}")]
    WidthMismatch { expected: usize, found: usize },
    #[error("model has no classes")]
    Untrained,
    #[error("model has {classes} classes but {rows} weight rows")]
    ClassMismatch { classes: usize, rows: usize },
    #[error("weight row {row} has width {found}, model expects {expected}")]
    RowWidthMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// One encoded outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub features: Vec<f64>,
    pub label: String,
    pub success: bool,
}

/// Highest-probability class for a feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassScore {
    pub label: String,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxModel {
    width: usize,
    learning_rate: f64,
    l2: f64,
    classes: Vec<String>,
    weights: Vec<Vec<f64>>,
}

impl SoftmaxModel {
    pub fn new(width: usize, learning_rate: f64, l2: f64) -> Self {
        Self {
            width,
            learning_rate,
            l2,
            classes: Vec::new(),
            weights: Vec::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn check_width(&self, features: &[f64]) -> Result<(), ModelError> {
        if features.len() != self.width {
            return Err(ModelError::WidthMismatch {
                expected: self.width,
                found: features.len(),
            });
        }
        Ok(())
    }

    /// One weight row of `width` entries per class.
    pub fn check_shape(&self) -> Result<(), ModelError> {
        if self.classes.len() != self.weights.len() {
            return Err(ModelError::ClassMismatch {
                classes: self.classes.len(),
                rows: self.weights.len(),
            });
        }
        for (row, weights) in self.weights.iter().enumerate() {
            if weights.len() != self.width {
                return Err(ModelError::RowWidthMismatch {
                    row,
                    expected: self.width,
                    found: weights.len(),
                });
            }
        }
        Ok(())
    }

    fn class_index(&mut self, label: &str) -> usize {
        if let Some(index) = self.classes.iter().position(|class| class == label) {
            return index;
        }
        self.classes.push(label.to_string());
        self.weights.push(vec![0.0; self.width]);
        self.classes.len() - 1
    }

    /// Numerically stable softmax over all classes.
    pub fn probabilities(&self, features: &[f64]) -> Result<Vec<f64>, ModelError> {
        self.check_width(features)?;
        let logits: Vec<f64> = self
            .weights
            .iter()
            .map(|row| row.iter().zip(features).map(|(w, x)| w * x).sum())
            .collect();
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|z| (z - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        Ok(exps.into_iter().map(|e| e / total).collect())
    }

    /// Most likely class. Ties resolve to the class learned first.
    pub fn predict(&self, features: &[f64]) -> Result<ClassScore, ModelError> {
        if self.classes.is_empty() {
            return Err(ModelError::Untrained);
        }
        self.check_shape()?;
        let probabilities = self.probabilities(features)?;
        let mut best: Option<(usize, f64)> = None;
        for (index, probability) in probabilities.iter().copied().enumerate() {
            if best.is_none_or(|(_, top)| probability > top) {
                best = Some((index, probability));
            }
        }
        let (index, probability) = best.ok_or(ModelError::Untrained)?;
        let label = self.classes.get(index).ok_or(ModelError::ClassMismatch {
            classes: self.classes.len(),
            rows: self.weights.len(),
        })?;
        Ok(ClassScore {
            label: label.clone(),
            probability,
        })
    }

    /// Single SGD step.
    pub fn update(&mut self, sample: &TrainingSample) -> Result<(), ModelError> {
        self.check_width(&sample.features)?;
        let target = self.class_index(&sample.label);
        let probabilities = self.probabilities(&sample.features)?;

        let gradients: Vec<f64> = if sample.success {
            probabilities
                .iter()
                .enumerate()
                .map(|(index, p)| if index == target { p - 1.0 } else { *p })
                .collect()
        } else {
            let p_target = probabilities[target];
            let complement = (1.0 - p_target).max(MIN_COMPLEMENT);
            probabilities
                .iter()
                .enumerate()
                .map(|(index, p)| {
                    if index == target {
                        p_target
                    } else {
                        -p_target * p / complement
                    }
                })
                .collect()
        };

        for (row, gradient) in self.weights.iter_mut().zip(gradients) {
            for (weight, x) in row.iter_mut().zip(&sample.features) {
                *weight -= self.learning_rate * (gradient * x + self.l2 * *weight);
            }
        }
        Ok(())
    }

    /// Incremental fit over a batch; samples are visited in order each epoch.
    pub fn partial_fit(
        &mut self,
        samples: &[TrainingSample],
        epochs: usize,
    ) -> Result<(), ModelError> {
        for _ in 0..epochs.max(1) {
            for sample in samples {
                self.update(sample)?;
            }
        }
        Ok(())
    }
}
