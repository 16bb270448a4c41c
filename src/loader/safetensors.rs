use crate::ir::{DataType, Tensor};
use crate::loader::{LoaderError, ModelLoader, StateDict};
use log::debug;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use std::path::Path;

pub struct SafetensorsLoader;

impl ModelLoader for SafetensorsLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<StateDict, LoaderError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;

        let mut state = StateDict::new();
        for (name, view) in tensors.tensors() {
            let data_type = match view.dtype() {
                Dtype::F32 => DataType::F32,
                Dtype::F64 => DataType::F64,
                Dtype::I32 => DataType::I32,
                Dtype::I64 => DataType::I64,
                Dtype::U8 => DataType::U8,
                other => {
                    return Err(LoaderError::UnsupportedDtype {
                        name,
                        dtype: format!("{:?}", other),
                    })
                }
            };
            state.insert(
                name.clone(),
                Tensor {
                    name,
                    shape: view.shape().to_vec(),
                    data_type,
                    data: Some(view.data().to_vec()),
                },
            );
        }
        debug!("Loaded {} tensors from {}", state.len(), path.display());
        Ok(state)
    }
}

impl SafetensorsLoader {
    pub fn save<P: AsRef<Path>>(state: &StateDict, path: P) -> Result<(), LoaderError> {
        let mut views = Vec::with_capacity(state.len());
        for (name, tensor) in state {
            let dtype = match tensor.data_type {
                DataType::F32 => Dtype::F32,
                DataType::F64 => Dtype::F64,
                DataType::I32 => Dtype::I32,
                DataType::I64 => Dtype::I64,
                DataType::U8 => Dtype::U8,
            };
            let data = tensor
                .data
                .as_deref()
                .ok_or_else(|| LoaderError::InvalidFormat(format!("tensor {} has no data", name)))?;
            let view = TensorView::new(dtype, tensor.shape.clone(), data)
                .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;
            views.push((name.clone(), view));
        }
        safetensors::serialize_to_file(
            views.iter().map(|(name, view)| (name.as_str(), view)),
            &None,
            path.as_ref(),
        )
        .map_err(|e| LoaderError::InvalidFormat(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_load_saved_weights() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("model.safetensors");

        let mut state = StateDict::new();
        state.insert(
            "outc.conv.weight".to_string(),
            Tensor::from_f32("outc.conv.weight", vec![1, 2, 1, 1], &[0.5, -1.0]),
        );
        state.insert(
            "outc.conv.bias".to_string(),
            Tensor::from_f32("outc.conv.bias", vec![1], &[0.25]),
        );
        SafetensorsLoader::save(&state, &file_path).unwrap();

        let loaded = SafetensorsLoader::load(&file_path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["outc.conv.weight"].shape, vec![1, 2, 1, 1]);
        assert_eq!(loaded["outc.conv.bias"].to_f32().unwrap(), vec![0.25]);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("model.safetensors");
        File::create(&file_path).unwrap();

        let result = SafetensorsLoader::load(&file_path);
        assert!(matches!(result, Err(LoaderError::InvalidFormat(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = SafetensorsLoader::load(dir.path().join("absent.safetensors"));
        assert!(matches!(result, Err(LoaderError::Io(_))));
    }
}
