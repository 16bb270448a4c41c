//! Symbolic tracing of a model's forward pass.
//!
//! Layers call into a [`Tracer`] instead of computing anything: each call
//! appends one node to the graph under construction and returns a [`Value`]
//! carrying the inferred output dims. Shape errors therefore surface at the
//! exact layer that receives an incompatible input.

use crate::ir::shape_inference::{NodeInput, ShapeError, ShapeInference};
use crate::ir::{Attribute, DataType, Dim, ModelIR, Node, Tensor, ValueInfo};
use log::trace;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("Unknown value: {0}")]
    UnknownValue(String),
}

/// Handle to a value in the traced graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    name: String,
    dims: Vec<Dim>,
}

impl Value {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<&Dim> {
        self.dims.get(axis)
    }
}

#[derive(Debug, Default)]
pub struct Tracer {
    ir: ModelIR,
    scopes: Vec<String>,
    node_names: HashMap<String, usize>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(&mut self, name: &str, dims: Vec<Dim>, data_type: DataType) -> Value {
        self.ir.inputs.push(ValueInfo {
            name: name.to_string(),
            dims: dims.clone(),
            data_type,
        });
        Value {
            name: name.to_string(),
            dims,
        }
    }

    /// Runs `f` with `scope` appended to the current module path.
    pub fn scoped<T>(
        &mut self,
        scope: &str,
        f: impl FnOnce(&mut Self) -> Result<T, TraceError>,
    ) -> Result<T, TraceError> {
        self.scopes.push(scope.to_string());
        let result = f(self);
        self.scopes.pop();
        result
    }

    /// Registers a learned parameter under its dotted module path, e.g.
    /// `down1.maxpool_conv.1.double_conv.0.weight`.
    pub fn parameter(&mut self, local_name: &str, tensor: &Tensor) -> Value {
        let name = self.qualified(local_name);
        let dims = tensor.dims();
        self.ir
            .weights
            .entry(name.clone())
            .or_insert_with(|| Tensor {
                name: name.clone(),
                ..tensor.clone()
            });
        Value { name, dims }
    }

    /// Registers a constant operator argument (resize scales, pads).
    pub fn constant(&mut self, tensor: Tensor) -> Value {
        let base = format!("{}/{}", self.node_prefix(), tensor.name);
        let mut name = base.clone();
        let mut n = 1;
        while self.ir.weights.contains_key(&name) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        let dims = tensor.dims();
        self.ir.weights.insert(
            name.clone(),
            Tensor {
                name: name.clone(),
                ..tensor
            },
        );
        Value { name, dims }
    }

    /// Appends one operator node and returns its (single) output.
    pub fn op(
        &mut self,
        op_type: &str,
        inputs: &[&Value],
        attributes: Vec<(&str, Attribute)>,
    ) -> Result<Value, TraceError> {
        let name = self.node_name(op_type);
        let output = format!("{}_output_0", name);
        let node = Node {
            name,
            op_type: op_type.to_string(),
            inputs: inputs.iter().map(|v| v.name.clone()).collect(),
            outputs: vec![output.clone()],
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };

        let node_inputs: Vec<NodeInput<'_>> = inputs
            .iter()
            .map(|v| NodeInput {
                dims: &v.dims,
                constant: self.ir.weights.get(&v.name),
            })
            .collect();
        let dims = ShapeInference::infer_node(&node, &node_inputs)?;
        trace!("{} {} -> {:?}", node.op_type, node.name, dims);

        self.ir.value_info.push(ValueInfo {
            name: output.clone(),
            dims: dims.clone(),
            data_type: DataType::F32,
        });
        self.ir.nodes.push(node);

        Ok(Value { name: output, dims })
    }

    /// Closes the trace, naming `output` as the single graph output.
    pub fn finish(mut self, output: &Value, output_name: &str) -> Result<ModelIR, TraceError> {
        let is_input = self.ir.inputs.iter().any(|i| i.name == output.name);
        let is_known = is_input
            || self.ir.weights.contains_key(&output.name)
            || self.ir.producer(&output.name).is_some();
        if !is_known {
            return Err(TraceError::UnknownValue(output.name.clone()));
        }

        if is_input || self.ir.weights.contains_key(&output.name) {
            self.ir.nodes.push(Node {
                name: "/Identity".to_string(),
                op_type: "Identity".to_string(),
                inputs: vec![output.name.clone()],
                outputs: vec![output_name.to_string()],
                attributes: HashMap::new(),
            });
        } else {
            self.ir.rename_value(&output.name, output_name);
        }
        self.ir.value_info.retain(|v| v.name != output_name);
        self.ir.outputs.push(ValueInfo {
            name: output_name.to_string(),
            dims: output.dims.clone(),
            data_type: DataType::F32,
        });
        Ok(self.ir)
    }

    fn qualified(&self, local_name: &str) -> String {
        if self.scopes.is_empty() {
            local_name.to_string()
        } else {
            format!("{}.{}", self.scopes.join("."), local_name)
        }
    }

    fn node_prefix(&self) -> String {
        if self.scopes.is_empty() {
            String::new()
        } else {
            format!("/{}", self.scopes.join("/"))
        }
    }

    fn node_name(&mut self, op_type: &str) -> String {
        let base = format!("{}/{}", self.node_prefix(), op_type);
        let count = self.node_names.entry(base.clone()).or_insert(0);
        let name = if *count == 0 {
            base
        } else {
            format!("{}_{}", base, count)
        };
        *count += 1;
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::fixed_dims;

    #[test]
    fn test_trace_names_follow_scopes() {
        let mut tracer = Tracer::new();
        let x = tracer.input("input", fixed_dims(&[1, 3, 8, 8]), DataType::F32);
        let weight = Tensor::from_f32("weight", vec![4, 3, 1, 1], &[0.0; 12]);

        let y = tracer
            .scoped("inc", |t| {
                t.scoped("double_conv.0", |t| {
                    let w = t.parameter("weight", &weight);
                    t.op("Conv", &[&x, &w], vec![])
                })
            })
            .unwrap();
        let z = tracer
            .scoped("inc", |t| t.op("Relu", &[&y], vec![]))
            .unwrap();
        let z2 = tracer
            .scoped("inc", |t| t.op("Relu", &[&z], vec![]))
            .unwrap();

        assert_eq!(y.name(), "/inc/double_conv.0/Conv_output_0");
        assert_eq!(z.name(), "/inc/Relu_output_0");
        assert_eq!(z2.name(), "/inc/Relu_1_output_0");
        assert_eq!(y.dims(), fixed_dims(&[1, 4, 8, 8]).as_slice());

        let ir = tracer.finish(&z2, "output").unwrap();
        assert!(ir.weights.contains_key("inc.double_conv.0.weight"));
        assert_eq!(ir.nodes.len(), 3);
        assert_eq!(ir.nodes[2].outputs[0], "output");
        assert_eq!(ir.outputs[0].name, "output");
        assert!(ir.value_info.iter().all(|v| v.name != "output"));
    }

    #[test]
    fn test_trace_rejects_channel_mismatch() {
        let mut tracer = Tracer::new();
        let x = tracer.input("input", fixed_dims(&[1, 4, 8, 8]), DataType::F32);
        let weight = Tensor::from_f32("weight", vec![2, 3, 1, 1], &[0.0; 6]);
        let w = tracer.parameter("weight", &weight);

        let err = tracer.op("Conv", &[&x, &w], vec![]).unwrap_err();
        assert!(matches!(err, TraceError::Shape(ShapeError::Mismatch { .. })));
    }

    #[test]
    fn test_finish_on_input_inserts_identity() {
        let mut tracer = Tracer::new();
        let x = tracer.input("input", fixed_dims(&[1, 2]), DataType::F32);
        let ir = tracer.finish(&x, "output").unwrap();
        assert_eq!(ir.nodes.len(), 1);
        assert_eq!(ir.nodes[0].op_type, "Identity");
    }

    #[test]
    fn test_constant_names_are_unique() {
        let mut tracer = Tracer::new();
        let a = tracer.constant(Tensor::from_f32("scales", vec![1], &[2.0]));
        let b = tracer.constant(Tensor::from_f32("scales", vec![1], &[2.0]));
        assert_ne!(a.name(), b.name());
    }
}
