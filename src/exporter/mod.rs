pub mod onnx {
    include!("onnx.rs");
}

pub mod onnx_exporter;
pub mod opset;

use crate::ir::shape_inference::{ShapeError, ShapeInference};
use crate::ir::{fixed_dims, format_dims, DataType, Dim, ModelIR, ValueInfo};
use crate::model::{Mode, Module};
use crate::optimizer::{Optimizer, OptimizerError};
use crate::tracer::{TraceError, Tracer};
use log::{debug, info, warn};
use ndarray::ArrayD;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use onnx_exporter::OnnxExporter;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("Unsupported opset version {0}, expected {min}..={max}", min = opset::MIN_OPSET, max = opset::MAX_OPSET)]
    UnsupportedOpset(i64),
    #[error("Invalid export option: {0}")]
    InvalidOption(String),
    #[error("Tracing failed: {0}")]
    Trace(#[from] TraceError),
    #[error("Optimization failed: {0}")]
    Optimizer(#[from] OptimizerError),
    #[error("Shape inference failed: {0}")]
    Shape(#[from] ShapeError),
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub trait ModelExporter {
    fn export(ir: &ModelIR, options: &ExportOptions, path: &Path) -> Result<(), ExporterError>;
}

/// Whether the model is switched to inference mode for the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingMode {
    #[default]
    Eval,
    Preserve,
}

/// value name -> axis -> symbolic dimension name
pub type DynamicAxes = BTreeMap<String, BTreeMap<usize, String>>;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    /// Embed parameters as initializers. When off they become graph inputs.
    pub export_params: bool,
    pub opset_version: i64,
    pub do_constant_folding: bool,
    pub dynamic_axes: DynamicAxes,
    pub training: TrainingMode,
    pub producer_name: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            input_names: vec!["input".to_string()],
            output_names: vec!["output".to_string()],
            export_params: true,
            opset_version: 11,
            do_constant_folding: true,
            dynamic_axes: DynamicAxes::new(),
            training: TrainingMode::Eval,
            producer_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl ExportOptions {
    /// Renames the graph input and output. Dynamic axes already declared for
    /// the previous names move to the new ones.
    pub fn with_names(mut self, input: &str, output: &str) -> Self {
        let renames: Vec<(String, &str)> = self
            .input_names
            .iter()
            .map(|old| (old.clone(), input))
            .chain(self.output_names.iter().map(|old| (old.clone(), output)))
            .collect();
        for (old, new) in renames {
            if let Some(axes) = self.dynamic_axes.remove(&old) {
                self.dynamic_axes
                    .entry(new.to_string())
                    .or_default()
                    .extend(axes);
            }
        }
        self.input_names = vec![input.to_string()];
        self.output_names = vec![output.to_string()];
        self
    }

    pub fn with_opset_version(mut self, opset_version: i64) -> Self {
        self.opset_version = opset_version;
        self
    }

    pub fn with_export_params(mut self, export_params: bool) -> Self {
        self.export_params = export_params;
        self
    }

    pub fn with_constant_folding(mut self, do_constant_folding: bool) -> Self {
        self.do_constant_folding = do_constant_folding;
        self
    }

    pub fn with_training(mut self, training: TrainingMode) -> Self {
        self.training = training;
        self
    }

    /// Marks `axis` of the value `name` as the symbolic dimension `dim_name`.
    pub fn with_dynamic_axis(mut self, name: &str, axis: usize, dim_name: &str) -> Self {
        self.dynamic_axes
            .entry(name.to_string())
            .or_default()
            .insert(axis, dim_name.to_string());
        self
    }

    /// The same symbolic batch axis on every input and output.
    pub fn with_dynamic_batch(mut self, dim_name: &str) -> Self {
        let names: Vec<String> = self
            .input_names
            .iter()
            .chain(&self.output_names)
            .cloned()
            .collect();
        for name in names {
            self = self.with_dynamic_axis(&name, 0, dim_name);
        }
        self
    }

    fn validate(&self) -> Result<(), ExporterError> {
        opset::check_version(self.opset_version)?;
        if self.input_names.len() != 1 || self.output_names.len() != 1 {
            return Err(ExporterError::InvalidOption(format!(
                "expected one input and one output name, got {:?} and {:?}",
                self.input_names, self.output_names
            )));
        }
        if let Some(unknown) = self
            .dynamic_axes
            .keys()
            .find(|k| !self.input_names.contains(*k) && !self.output_names.contains(*k))
        {
            return Err(ExporterError::InvalidOption(format!(
                "dynamic axes given for unknown value {}",
                unknown
            )));
        }
        Ok(())
    }
}

/// What was written by [`export`].
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub path: PathBuf,
    pub opset_version: i64,
    pub nodes: usize,
    pub initializers: usize,
    pub input_dims: Vec<Dim>,
    pub output_dims: Vec<Dim>,
}

fn apply_dynamic_axes(
    name: &str,
    dims: &mut [Dim],
    options: &ExportOptions,
) -> Result<(), ExporterError> {
    let Some(axes) = options.dynamic_axes.get(name) else {
        return Ok(());
    };
    let rank = dims.len();
    for (&axis, dim_name) in axes {
        let dim = dims.get_mut(axis).ok_or_else(|| {
            ExporterError::InvalidOption(format!(
                "dynamic axis {} of {} is out of range for rank {}",
                axis, name, rank
            ))
        })?;
        *dim = Dim::Param(dim_name.clone());
    }
    Ok(())
}

fn trace<M: Module + ?Sized>(
    model: &M,
    dummy_input: &ArrayD<f32>,
    options: &ExportOptions,
) -> Result<ModelIR, ExporterError> {
    let input_name = &options.input_names[0];
    let output_name = &options.output_names[0];

    let mut input_dims = fixed_dims(dummy_input.shape());
    apply_dynamic_axes(input_name, &mut input_dims, options)?;

    let mut tracer = Tracer::new();
    let input = tracer.input(input_name, input_dims, DataType::F32);
    let output = model.forward(&mut tracer, &input)?;
    let mut ir = tracer.finish(&output, output_name)?;

    if let Some(info) = ir.outputs.iter_mut().find(|o| &o.name == output_name) {
        apply_dynamic_axes(output_name, &mut info.dims, options)?;
    }
    Ok(ir)
}

/// Traces `model` with the shape of `dummy_input` and writes the graph to
/// `path` as ONNX. Nothing is written unless every step succeeds.
pub fn export<M: Module + ?Sized>(
    model: &mut M,
    dummy_input: &ArrayD<f32>,
    path: &Path,
    options: &ExportOptions,
) -> Result<ExportReport, ExporterError> {
    options.validate()?;

    let switched = options.training == TrainingMode::Eval && model.is_training();
    if switched {
        info!("switching model to inference mode for export");
        model.eval();
    } else if model.is_training() {
        warn!("exporting a model in training mode, batch norm keeps batch statistics");
    }
    let traced = trace(&*model, dummy_input, options);
    if switched {
        model.set_mode(Mode::Train);
    }
    let mut ir = traced?;
    debug!("traced {} nodes, {} parameters", ir.nodes.len(), ir.weights.len());

    // parameters fed as graph inputs must keep the model's names and values
    let rewrite_params = options.do_constant_folding && options.export_params;
    if options.do_constant_folding && !rewrite_params {
        debug!("parameters are graph inputs, skipping constant folding");
    }
    Optimizer::for_export(rewrite_params).optimize(&mut ir)?;
    ShapeInference::infer(&mut ir)?;
    opset::check(&ir, options.opset_version)?;

    OnnxExporter::export(&ir, options, path)?;

    let dims_of = |infos: &[ValueInfo]| {
        infos.first().map(|i| i.dims.clone()).unwrap_or_default()
    };
    let report = ExportReport {
        path: path.to_path_buf(),
        opset_version: options.opset_version,
        nodes: ir.nodes.len(),
        initializers: if options.export_params { ir.weights.len() } else { 0 },
        input_dims: dims_of(&ir.inputs),
        output_dims: dims_of(&ir.outputs),
    };
    info!(
        "exported {} nodes and {} initializers to {}, input {} output {}",
        report.nodes,
        report.initializers,
        path.display(),
        format_dims(&report.input_dims),
        format_dims(&report.output_dims)
    );
    Ok(report)
}
