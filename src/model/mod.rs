use crate::ir::Tensor;
use crate::loader::{LoaderError, StateDict};
use crate::tracer::{TraceError, Tracer, Value};
use log::warn;
use std::collections::HashSet;

pub mod init;
pub mod keras_unet;
pub mod layers;
pub mod unet;
pub mod unet_features;

pub use keras_unet::{KerasUNet, KerasUNetConfig};
pub use unet::{UNet, UNetConfig};
pub use unet_features::{UNetFeatures, UNetFeaturesConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// A traceable network component that owns its parameters.
pub trait Module {
    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError>;

    /// Calls `visitor` with the dotted name of every parameter below `prefix`.
    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor));

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor));

    fn set_mode(&mut self, _mode: Mode) {}

    fn is_training(&self) -> bool {
        false
    }

    fn eval(&mut self) {
        self.set_mode(Mode::Eval);
    }

    fn num_params(&self) -> usize {
        let mut count = 0;
        self.visit_parameters("", &mut |_: &str, t: &Tensor| count += t.numel());
        count
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        self.visit_parameters("", &mut |name: &str, t: &Tensor| {
            state.insert(
                name.to_string(),
                Tensor {
                    name: name.to_string(),
                    ..t.clone()
                },
            );
        });
        state
    }

    /// Replaces parameter values by name. Every parameter must be present
    /// with the same shape; extra entries are ignored with a warning.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), LoaderError> {
        let mut loaded = HashSet::new();
        let mut error = None;
        self.visit_parameters_mut("", &mut |name: &str, tensor: &mut Tensor| {
            if error.is_some() {
                return;
            }
            match state.get(name) {
                None => error = Some(LoaderError::MissingParameter(name.to_string())),
                Some(found) if found.shape != tensor.shape => {
                    error = Some(LoaderError::ShapeMismatch {
                        name: name.to_string(),
                        expected: tensor.shape.clone(),
                        found: found.shape.clone(),
                    })
                }
                Some(found) if found.data_type != tensor.data_type => {
                    error = Some(LoaderError::UnsupportedDtype {
                        name: name.to_string(),
                        dtype: format!("{:?}", found.data_type),
                    })
                }
                Some(found) => {
                    tensor.data = found.data.clone();
                    loaded.insert(name.to_string());
                }
            }
        });
        if let Some(error) = error {
            return Err(error);
        }
        for name in state.keys().filter(|k| !loaded.contains(*k)) {
            warn!("Ignoring unexpected parameter {}", name);
        }
        Ok(())
    }
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
