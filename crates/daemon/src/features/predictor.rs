use std::{
    fs::{self, File},
    io::BufWriter,
    path::Path,
    sync::Arc,
};

use air_fusion_core::{replace_file, sibling_temp_path};

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};
use slog::{info, Logger};

use crate::{
    AtmosphericInputs, AtmosphericParameter, Confidence, FeaturePreparer, FeatureVector,
    FusionError,
};

/// The trained model behind the feature vector; only its contract matters here
#[cfg_attr(test, mockall::automock)]
pub trait PredictionModel: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<f64, FusionError>;
}

/// Linear model exported as JSON: one weight per feature plus an intercept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: [f64; 12],
    pub intercept: f64,
}

impl LinearModel {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read model {}: {}", path.display(), e))?;
        let model: LinearModel = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid model {}: {}", path.display(), e))?;
        if model.weights.iter().any(|w| !w.is_finite()) || !model.intercept.is_finite() {
            return Err(anyhow!("model {} has non-finite coefficients", path.display()));
        }
        Ok(model)
    }
}

impl PredictionModel for LinearModel {
    fn predict(&self, features: &FeatureVector) -> Result<f64, FusionError> {
        Ok(self
            .weights
            .iter()
            .zip(features.as_slice())
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.intercept)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub value: f64,
    pub unit: String,
    pub confidence: Confidence,
    pub features: FeatureVector,
    pub substituted: Vec<AtmosphericParameter>,
}

impl Prediction {
    /// Replace `path` with this prediction as JSON
    pub fn write_json(&self, path: &Path) -> Result<(), Error> {
        let temp = sibling_temp_path(path);
        {
            let file = File::create(&temp)?;
            serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        }
        replace_file(&temp, path)?;
        Ok(())
    }
}

pub struct Predictor {
    preparer: FeaturePreparer,
    model: Arc<dyn PredictionModel>,
    unit: String,
    logger: Logger,
}

impl Predictor {
    pub fn new(preparer: FeaturePreparer, model: Arc<dyn PredictionModel>, logger: Logger) -> Self {
        Self {
            preparer,
            model,
            unit: "ppb".to_string(),
            logger,
        }
    }

    pub fn predict(&self, inputs: &AtmosphericInputs) -> Result<Prediction, FusionError> {
        let prepared = self.preparer.prepare(inputs)?;
        let value = self.model.predict(&prepared.vector)?;
        if !value.is_finite() {
            return Err(FusionError::Model(format!("non-finite output {}", value)));
        }
        info!(
            self.logger,
            "predicted {:.2} {} ({} confidence, {} substituted)",
            value,
            self.unit,
            prepared.confidence,
            prepared.substituted.len()
        );
        Ok(Prediction {
            value,
            unit: self.unit.clone(),
            confidence: prepared.confidence,
            features: prepared.vector,
            substituted: prepared.substituted,
        })
    }
}
