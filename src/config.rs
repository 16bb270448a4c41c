//! The three export presets and the job runner they share.

use crate::exporter::{export, ExportOptions, ExportReport, ExporterError};
use crate::loader::safetensors::SafetensorsLoader;
use crate::loader::{LoaderError, ModelLoader};
use crate::model::init::randn;
use crate::model::{KerasUNetConfig, Module, UNetConfig, UNetFeaturesConfig};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Failed to load weights: {0}")]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Exporter(#[from] ExporterError),
}

/// Architecture and hyper-parameters of the model to export.
#[derive(Debug, Clone)]
pub enum ModelSpec {
    UNet(UNetConfig),
    UNetFeatures(UNetFeaturesConfig),
    KerasUNet(KerasUNetConfig),
}

impl ModelSpec {
    pub fn name(&self) -> &'static str {
        match self {
            ModelSpec::UNet(_) => "UNet",
            ModelSpec::UNetFeatures(_) => "UNet",
            ModelSpec::KerasUNet(_) => "Keras UNet",
        }
    }

    pub fn build<R: Rng>(&self, rng: &mut R) -> Box<dyn Module> {
        match self {
            ModelSpec::UNet(config) => Box::new(config.init(rng)),
            ModelSpec::UNetFeatures(config) => Box::new(config.init(rng)),
            ModelSpec::KerasUNet(config) => Box::new(config.init(rng)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportJob {
    pub model: ModelSpec,
    pub input_shape: Vec<usize>,
    pub output: PathBuf,
    pub options: ExportOptions,
    /// Trained parameters replacing the seeded initialization.
    pub weights: Option<PathBuf>,
    pub seed: u64,
}

impl ExportJob {
    fn new(model: ModelSpec, input_shape: &[usize], output: &str, options: ExportOptions) -> Self {
        Self {
            model,
            input_shape: input_shape.to_vec(),
            output: PathBuf::from(output),
            options,
            weights: None,
            seed: 0,
        }
    }

    /// UNet(3 channels, 1 class, transposed-conv upsampling) at 512x512.
    pub fn unet() -> Self {
        Self::new(
            ModelSpec::UNet(UNetConfig::new(3, 1).with_bilinear(false)),
            &[1, 3, 512, 512],
            "unet_model.onnx",
            ExportOptions::default()
                .with_opset_version(11)
                .with_dynamic_batch("batch_size"),
        )
    }

    /// UNet(3 in, 1 out, 32 initial features) at 128x128.
    pub fn unet_features() -> Self {
        Self::new(
            ModelSpec::UNetFeatures(UNetFeaturesConfig::new(3, 1).with_init_features(32)),
            &[1, 3, 128, 128],
            "unet.onnx",
            ExportOptions::default()
                .with_opset_version(11)
                .with_dynamic_batch("batch_size"),
        )
    }

    /// Channels-last Keras UNet on a single-channel 16x16 image, fixed batch.
    pub fn keras_unet() -> Self {
        Self::new(
            ModelSpec::KerasUNet(KerasUNetConfig::new(1, 1)),
            &[1, 16, 16, 1],
            "unet_model.onnx",
            ExportOptions::default().with_opset_version(13),
        )
    }

    pub fn with_output<P: AsRef<Path>>(mut self, output: P) -> Self {
        self.output = output.as_ref().to_path_buf();
        self
    }

    pub fn with_weights<P: AsRef<Path>>(mut self, weights: P) -> Self {
        self.weights = Some(weights.as_ref().to_path_buf());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_input_shape(mut self, input_shape: &[usize]) -> Self {
        self.input_shape = input_shape.to_vec();
        self
    }

    /// Builds the model, switches it to inference mode, draws the dummy input
    /// and exports.
    pub fn run(&self) -> Result<ExportReport, JobError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut model = self.model.build(&mut rng);
        info!(
            "built {} with {} parameters",
            self.model.name(),
            model.num_params()
        );

        if let Some(path) = &self.weights {
            let state = SafetensorsLoader::load(path)?;
            model.load_state_dict(&state)?;
            info!("loaded {} tensors from {}", state.len(), path.display());
        }

        model.eval();
        let dummy_input = randn(&self.input_shape, &mut rng);
        Ok(export(
            model.as_mut(),
            &dummy_input,
            &self.output,
            &self.options,
        )?)
    }
}
