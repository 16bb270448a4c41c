use crate::ir::Tensor;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported dtype {dtype} for tensor {name}")]
    UnsupportedDtype { name: String, dtype: String },
    #[error("Missing parameter: {0}")]
    MissingParameter(String),
    #[error("Shape mismatch for {name}: model expects {expected:?}, file has {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Parameters keyed by their dotted module path.
pub type StateDict = HashMap<String, Tensor>;

pub trait ModelLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<StateDict, LoaderError>;
}

pub mod safetensors;
