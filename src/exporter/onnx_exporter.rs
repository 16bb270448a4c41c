use crate::exporter::{onnx, opset, ExportOptions, ExporterError, ModelExporter};
use crate::ir::{Attribute, DataType, Dim, ModelIR, Node, Tensor, ValueInfo};
use onnx::tensor_shape_proto::{dimension, Dimension};
use prost::Message;
use std::path::Path;

pub struct OnnxExporter;

impl OnnxExporter {
    /// Builds the protobuf model. Initializers and attributes are sorted by
    /// name so that the same graph always encodes to the same bytes.
    pub fn to_model_proto(ir: &ModelIR, options: &ExportOptions) -> onnx::ModelProto {
        let mut model = onnx::ModelProto::default();
        model.ir_version = Some(opset::ir_version(options.opset_version));
        model.producer_name = Some(options.producer_name.clone());
        model.producer_version = Some(env!("CARGO_PKG_VERSION").to_string());
        model.opset_import.push(onnx::OperatorSetIdProto {
            domain: Some(String::new()),
            version: Some(options.opset_version),
        });

        let mut graph = onnx::GraphProto::default();
        graph.name = Some("main_graph".to_string());

        let mut weights: Vec<&Tensor> = ir.weights.values().collect();
        weights.sort_by(|a, b| a.name.cmp(&b.name));

        graph.input = ir.inputs.iter().map(value_info_proto).collect();
        if options.export_params {
            graph.initializer = weights.iter().map(|t| tensor_proto(t)).collect();
        } else {
            graph.input.extend(weights.iter().map(|t| {
                value_info_proto(&ValueInfo {
                    name: t.name.clone(),
                    dims: t.dims(),
                    data_type: t.data_type,
                })
            }));
        }
        graph.output = ir.outputs.iter().map(value_info_proto).collect();
        graph.value_info = ir
            .value_info
            .iter()
            .filter(|v| !ir.is_graph_output(&v.name))
            .map(value_info_proto)
            .collect();
        graph.node = ir.nodes.iter().map(node_proto).collect();

        model.graph = Some(graph);
        model
    }
}

impl ModelExporter for OnnxExporter {
    fn export(ir: &ModelIR, options: &ExportOptions, path: &Path) -> Result<(), ExporterError> {
        let model = Self::to_model_proto(ir, options);

        let mut buf = Vec::with_capacity(model.encoded_len());
        model
            .encode(&mut buf)
            .map_err(|e| ExporterError::SerializationError(e.to_string()))?;

        std::fs::write(path, &buf).map_err(|source| ExporterError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn elem_type(data_type: DataType) -> i32 {
    let dt = match data_type {
        DataType::F32 => onnx::tensor_proto::DataType::Float,
        DataType::F64 => onnx::tensor_proto::DataType::Double,
        DataType::I32 => onnx::tensor_proto::DataType::Int32,
        DataType::I64 => onnx::tensor_proto::DataType::Int64,
        DataType::U8 => onnx::tensor_proto::DataType::Uint8,
    };
    dt as i32
}

fn tensor_proto(tensor: &Tensor) -> onnx::TensorProto {
    let mut tp = onnx::TensorProto::default();
    tp.name = Some(tensor.name.clone());
    tp.dims = tensor.shape.iter().map(|&d| d as i64).collect();
    tp.data_type = Some(elem_type(tensor.data_type));
    tp.raw_data = Some(tensor.data.clone().unwrap_or_default());
    tp
}

fn value_info_proto(info: &ValueInfo) -> onnx::ValueInfoProto {
    let dim = info
        .dims
        .iter()
        .map(|d| Dimension {
            denotation: None,
            value: Some(match d {
                Dim::Fixed(n) => dimension::Value::DimValue(*n as i64),
                Dim::Param(p) => dimension::Value::DimParam(p.clone()),
            }),
        })
        .collect();

    onnx::ValueInfoProto {
        name: Some(info.name.clone()),
        r#type: Some(onnx::TypeProto {
            denotation: None,
            value: Some(onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                elem_type: Some(elem_type(info.data_type)),
                shape: Some(onnx::TensorShapeProto { dim }),
            })),
        }),
        doc_string: None,
    }
}

fn node_proto(node: &Node) -> onnx::NodeProto {
    let mut n = onnx::NodeProto::default();
    n.name = Some(node.name.clone());
    n.op_type = Some(node.op_type.clone());
    n.input = node.inputs.clone();
    n.output = node.outputs.clone();

    let mut attributes: Vec<_> = node.attributes.iter().collect();
    attributes.sort_by(|a, b| a.0.cmp(b.0));
    for (attr_name, attr_val) in attributes {
        let mut a = onnx::AttributeProto::default();
        a.name = Some(attr_name.clone());
        let attr_type = match attr_val {
            Attribute::Float(f) => {
                a.f = Some(*f);
                onnx::attribute_proto::AttributeType::Float
            }
            Attribute::Int(i) => {
                a.i = Some(*i);
                onnx::attribute_proto::AttributeType::Int
            }
            Attribute::String(s) => {
                a.s = Some(s.as_bytes().to_vec());
                onnx::attribute_proto::AttributeType::String
            }
            Attribute::Floats(fs) => {
                a.floats = fs.clone();
                onnx::attribute_proto::AttributeType::Floats
            }
            Attribute::Ints(is) => {
                a.ints = is.clone();
                onnx::attribute_proto::AttributeType::Ints
            }
        };
        a.r#type = Some(attr_type as i32);
        n.attribute.push(a);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, ModelIR, Node, Tensor};
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn add_model() -> ModelIR {
        let mut ir = ModelIR::new();

        ir.weights.insert("w1".to_string(), Tensor {
            name: "w1".to_string(),
            shape: vec![1, 1],
            data_type: DataType::F32,
            data: Some(vec![0, 0, 128, 63]),
        });
        ir.weights.insert("a0".to_string(), Tensor::from_f32("a0", vec![1], &[2.0]));

        ir.inputs.push(ValueInfo {
            name: "X".to_string(),
            dims: vec![Dim::Param("batch_size".to_string()), Dim::Fixed(1)],
            data_type: DataType::F32,
        });
        ir.nodes.push(Node {
            name: "add1".to_string(),
            op_type: "Add".to_string(),
            inputs: vec!["X".to_string(), "w1".to_string()],
            outputs: vec!["Y".to_string()],
            attributes: HashMap::new(),
        });
        ir.nodes.push(Node {
            name: "mul1".to_string(),
            op_type: "Mul".to_string(),
            inputs: vec!["Y".to_string(), "a0".to_string()],
            outputs: vec!["Z".to_string()],
            attributes: HashMap::new(),
        });
        ir.outputs.push(ValueInfo {
            name: "Z".to_string(),
            dims: vec![Dim::Param("batch_size".to_string()), Dim::Fixed(1)],
            data_type: DataType::F32,
        });
        ir
    }

    #[test]
    fn test_export_basic_model() {
        let ir = add_model();
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("model.onnx");

        let result = OnnxExporter::export(&ir, &ExportOptions::default(), &file_path);
        assert!(result.is_ok());
        assert!(file_path.exists());

        let bytes = std::fs::read(&file_path).unwrap();
        let model = onnx::ModelProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(model.ir_version, Some(6));
        assert_eq!(model.opset_import[0].version, Some(11));
        let graph = model.graph.unwrap();
        assert_eq!(graph.name.as_deref(), Some("main_graph"));
        assert_eq!(graph.node.len(), 2);
    }

    #[test]
    fn test_initializers_sorted_and_dynamic_dims_kept() {
        let proto = OnnxExporter::to_model_proto(&add_model(), &ExportOptions::default());
        let graph = proto.graph.unwrap();

        let names: Vec<_> = graph.initializer.iter().map(|t| t.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["a0", "w1"]);
        assert_eq!(graph.initializer[1].raw_data.as_deref(), Some(&[0, 0, 128, 63][..]));

        let Some(onnx::type_proto::Value::TensorType(t)) =
            graph.input[0].r#type.as_ref().and_then(|t| t.value.clone())
        else {
            panic!("input is not a tensor");
        };
        let dims = t.shape.unwrap().dim;
        assert_eq!(
            dims[0].value,
            Some(dimension::Value::DimParam("batch_size".to_string()))
        );
        assert_eq!(dims[1].value, Some(dimension::Value::DimValue(1)));
    }

    #[test]
    fn test_export_without_params_declares_inputs() {
        let options = ExportOptions::default().with_export_params(false);
        let graph = OnnxExporter::to_model_proto(&add_model(), &options).graph.unwrap();

        assert!(graph.initializer.is_empty());
        let inputs: Vec<_> = graph.input.iter().map(|i| i.name.clone().unwrap()).collect();
        assert_eq!(inputs, vec!["X", "a0", "w1"]);
    }

    #[test]
    fn test_export_transpose_model() {
        let mut ir = ModelIR::new();

        let mut attrs = HashMap::new();
        attrs.insert("perm".to_string(), Attribute::Ints(vec![0, 2, 1]));

        ir.nodes.push(Node {
            name: "transpose1".to_string(),
            op_type: "Transpose".to_string(),
            inputs: vec!["X".to_string()],
            outputs: vec!["Y".to_string()],
            attributes: attrs,
        });

        let proto = OnnxExporter::to_model_proto(&ir, &ExportOptions::default());
        let node = &proto.graph.unwrap().node[0];
        assert_eq!(node.attribute[0].name.as_deref(), Some("perm"));
        assert_eq!(node.attribute[0].ints, vec![0, 2, 1]);
        assert_eq!(
            node.attribute[0].r#type,
            Some(onnx::attribute_proto::AttributeType::Ints as i32)
        );
    }

    #[test]
    fn test_export_conv_attributes_in_name_order() {
        let mut ir = ModelIR::new();

        let mut attrs = HashMap::new();
        attrs.insert("strides".to_string(), Attribute::Ints(vec![1, 1]));
        attrs.insert("pads".to_string(), Attribute::Ints(vec![0, 0, 0, 0]));
        attrs.insert("group".to_string(), Attribute::Int(1));
        attrs.insert("auto_pad".to_string(), Attribute::String("NOTSET".to_string()));

        ir.nodes.push(Node {
            name: "conv1".to_string(),
            op_type: "Conv".to_string(),
            inputs: vec!["X".to_string(), "W".to_string()],
            outputs: vec!["Y".to_string()],
            attributes: attrs,
        });

        let first = OnnxExporter::to_model_proto(&ir, &ExportOptions::default()).encode_to_vec();
        let second = OnnxExporter::to_model_proto(&ir, &ExportOptions::default()).encode_to_vec();
        assert_eq!(first, second);

        let model = onnx::ModelProto::decode(first.as_slice()).unwrap();
        let names: Vec<_> = model.graph.unwrap().node[0]
            .attribute
            .iter()
            .map(|a| a.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["auto_pad", "group", "pads", "strides"]);
    }

    #[test]
    fn test_export_to_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("missing").join("model.onnx");

        let err = OnnxExporter::export(&add_model(), &ExportOptions::default(), &file_path)
            .unwrap_err();
        assert!(matches!(err, ExporterError::Io { .. }));
    }
}
