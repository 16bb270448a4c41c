use crate::exporter::onnx;
use crate::ir::Dim;
use onnx::tensor_shape_proto::dimension;
use prost::Message;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifierError {
    #[error("Failed to read model: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode model: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("Invalid model: {0}")]
    Invalid(String),
}

/// A declared graph input or output.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSummary {
    pub name: String,
    pub dims: Vec<Dim>,
}

#[derive(Debug, Clone)]
pub struct GraphSummary {
    pub ir_version: i64,
    pub opset_version: i64,
    pub inputs: Vec<ValueSummary>,
    pub outputs: Vec<ValueSummary>,
    pub initializers: usize,
    /// op type -> node count
    pub op_counts: BTreeMap<String, usize>,
}

impl GraphSummary {
    pub fn nodes(&self) -> usize {
        self.op_counts.values().sum()
    }
}

/// Structural checks on a serialized ONNX model: references resolve in
/// topological order, every value has one producer and initializer payloads
/// match their declared shapes.
pub struct GraphChecker;

impl GraphChecker {
    pub fn check_file<P: AsRef<Path>>(path: P) -> Result<GraphSummary, VerifierError> {
        let bytes = std::fs::read(path)?;
        let model = onnx::ModelProto::decode(bytes.as_slice())?;
        Self::check(&model)
    }

    pub fn check(model: &onnx::ModelProto) -> Result<GraphSummary, VerifierError> {
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| invalid("model has no graph"))?;
        let opset_version = model
            .opset_import
            .iter()
            .find(|o| o.domain.as_deref().unwrap_or("").is_empty())
            .and_then(|o| o.version)
            .ok_or_else(|| invalid("default domain opset is not imported"))?;

        let mut defined = HashSet::new();
        for input in &graph.input {
            defined.insert(name_of(&input.name, "graph input")?);
        }
        for tensor in &graph.initializer {
            let name = name_of(&tensor.name, "initializer")?;
            check_payload(name, tensor)?;
            defined.insert(name);
        }

        let mut op_counts = BTreeMap::new();
        for node in &graph.node {
            let node_name = node.name.as_deref().unwrap_or("<unnamed>");
            for input in node.input.iter().filter(|i| !i.is_empty()) {
                if !defined.contains(input.as_str()) {
                    return Err(invalid(format!(
                        "{} reads {} before it is defined",
                        node_name, input
                    )));
                }
            }
            for output in &node.output {
                if !defined.insert(output.as_str()) {
                    return Err(invalid(format!("{} is produced twice", output)));
                }
            }
            let op_type = node
                .op_type
                .clone()
                .ok_or_else(|| invalid(format!("{} has no op type", node_name)))?;
            *op_counts.entry(op_type).or_insert(0) += 1;
        }

        for output in &graph.output {
            let name = name_of(&output.name, "graph output")?;
            if !defined.contains(name) {
                return Err(invalid(format!("graph output {} is never produced", name)));
            }
        }

        Ok(GraphSummary {
            ir_version: model.ir_version.unwrap_or(0),
            opset_version,
            inputs: graph
                .input
                .iter()
                .map(value_summary)
                .collect::<Result<_, _>>()?,
            outputs: graph
                .output
                .iter()
                .map(value_summary)
                .collect::<Result<_, _>>()?,
            initializers: graph.initializer.len(),
            op_counts,
        })
    }
}

fn invalid(message: impl Into<String>) -> VerifierError {
    VerifierError::Invalid(message.into())
}

fn name_of<'a>(name: &'a Option<String>, what: &str) -> Result<&'a str, VerifierError> {
    name.as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| invalid(format!("{} without a name", what)))
}

fn element_size(data_type: i32) -> Option<usize> {
    use onnx::tensor_proto::DataType;
    match DataType::try_from(data_type).ok()? {
        DataType::Float | DataType::Int32 => Some(4),
        DataType::Double | DataType::Int64 => Some(8),
        DataType::Uint8 | DataType::Int8 | DataType::Bool => Some(1),
        DataType::Uint16 | DataType::Int16 | DataType::Float16 => Some(2),
        DataType::Undefined | DataType::String => None,
    }
}

fn check_payload(name: &str, tensor: &onnx::TensorProto) -> Result<(), VerifierError> {
    let Some(raw) = &tensor.raw_data else {
        return Ok(());
    };
    let size = tensor
        .data_type
        .and_then(element_size)
        .ok_or_else(|| invalid(format!("initializer {} has no fixed-size data type", name)))?;
    if tensor.dims.iter().any(|&d| d < 0) {
        return Err(invalid(format!("initializer {} has negative dims", name)));
    }
    let numel: i64 = tensor.dims.iter().product();
    if raw.len() != numel as usize * size {
        return Err(invalid(format!(
            "initializer {} holds {} bytes for dims {:?}",
            name,
            raw.len(),
            tensor.dims
        )));
    }
    Ok(())
}

fn value_summary(info: &onnx::ValueInfoProto) -> Result<ValueSummary, VerifierError> {
    let name = name_of(&info.name, "value")?.to_string();
    let Some(onnx::type_proto::Value::TensorType(tensor)) =
        info.r#type.as_ref().and_then(|t| t.value.as_ref())
    else {
        return Err(invalid(format!("{} is not a tensor", name)));
    };
    let dims = tensor
        .shape
        .as_ref()
        .map(|s| s.dim.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|d| match &d.value {
            Some(dimension::Value::DimValue(v)) if *v >= 0 => Ok(Dim::Fixed(*v as usize)),
            Some(dimension::Value::DimParam(p)) => Ok(Dim::Param(p.clone())),
            _ => Err(invalid(format!("{} has an unknown dimension", name))),
        })
        .collect::<Result<_, _>>()?;
    Ok(ValueSummary { name, dims })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{ExportOptions, OnnxExporter};
    use crate::ir::{fixed_dims, DataType, ModelIR, Node, Tensor, ValueInfo};
    use std::collections::HashMap;

    fn relu_model() -> ModelIR {
        let mut ir = ModelIR::new();
        ir.inputs.push(ValueInfo {
            name: "input".to_string(),
            dims: vec![Dim::Param("batch_size".to_string()), Dim::Fixed(4)],
            data_type: DataType::F32,
        });
        ir.weights.insert("bias".to_string(), Tensor::from_f32("bias", vec![4], &[0.0; 4]));
        ir.nodes.push(Node {
            name: "/Add".to_string(),
            op_type: "Add".to_string(),
            inputs: vec!["input".to_string(), "bias".to_string()],
            outputs: vec!["/Add_output_0".to_string()],
            attributes: HashMap::new(),
        });
        ir.nodes.push(Node {
            name: "/Relu".to_string(),
            op_type: "Relu".to_string(),
            inputs: vec!["/Add_output_0".to_string()],
            outputs: vec!["output".to_string()],
            attributes: HashMap::new(),
        });
        ir.outputs.push(ValueInfo {
            name: "output".to_string(),
            dims: vec![Dim::Param("batch_size".to_string()), Dim::Fixed(4)],
            data_type: DataType::F32,
        });
        ir
    }

    #[test]
    fn test_check_valid_model() {
        let proto = OnnxExporter::to_model_proto(&relu_model(), &ExportOptions::default());
        let summary = GraphChecker::check(&proto).unwrap();

        assert_eq!(summary.opset_version, 11);
        assert_eq!(summary.initializers, 1);
        assert_eq!(summary.nodes(), 2);
        assert_eq!(summary.op_counts["Relu"], 1);
        assert_eq!(summary.inputs[0].dims[0], Dim::Param("batch_size".to_string()));
        assert_eq!(summary.outputs[0].dims[1..], fixed_dims(&[4])[..]);
    }

    #[test]
    fn test_check_rejects_use_before_definition() {
        let mut ir = relu_model();
        ir.nodes.swap(0, 1);
        let proto = OnnxExporter::to_model_proto(&ir, &ExportOptions::default());
        assert!(matches!(
            GraphChecker::check(&proto),
            Err(VerifierError::Invalid(_))
        ));
    }

    #[test]
    fn test_check_rejects_truncated_initializer() {
        let mut proto = OnnxExporter::to_model_proto(&relu_model(), &ExportOptions::default());
        if let Some(graph) = proto.graph.as_mut() {
            graph.initializer[0].raw_data = Some(vec![0; 3]);
        }
        assert!(matches!(
            GraphChecker::check(&proto),
            Err(VerifierError::Invalid(_))
        ));
    }

    #[test]
    fn test_check_rejects_missing_output() {
        let mut ir = relu_model();
        ir.nodes.pop();
        let proto = OnnxExporter::to_model_proto(&ir, &ExportOptions::default());
        assert!(GraphChecker::check(&proto).is_err());
    }

    #[test]
    fn test_check_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.onnx");
        std::fs::write(&path, [0xff, 0xff, 0xff]).unwrap();
        assert!(matches!(
            GraphChecker::check_file(&path),
            Err(VerifierError::Decode(_))
        ));
    }
}
