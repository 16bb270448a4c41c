use crate::ir::{ModelIR, Node, Tensor};
use crate::optimizer::{OptimizationPass, OptimizerError};
use std::collections::HashMap;

/// Evaluates nodes whose inputs are all initializers and replaces them with
/// the resulting constant.
pub struct ConstantFolding;

impl OptimizationPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant_folding"
    }

    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        let mut i = 0;
        while i < ir.nodes.len() {
            let node = &ir.nodes[i];
            let all_constants = !node.inputs.is_empty()
                && node.inputs.iter().all(|input| ir.weights.contains_key(input));
            let feeds_output = node.outputs.iter().any(|o| ir.is_graph_output(o));

            if all_constants && !feeds_output {
                if let Some(folded) = fold(node, &ir.weights)? {
                    ir.weights.insert(folded.name.clone(), folded);
                    ir.nodes.remove(i);
                    continue;
                }
            }
            i += 1;
        }
        Ok(())
    }
}

fn fold(node: &Node, weights: &HashMap<String, Tensor>) -> Result<Option<Tensor>, OptimizerError> {
    let output = match node.outputs.as_slice() {
        [output] => output.clone(),
        _ => return Ok(None),
    };
    match (node.op_type.as_str(), node.inputs.as_slice()) {
        ("Add" | "Sub" | "Mul" | "Div", [a, b]) => {
            Ok(fold_binary(&node.op_type, &weights[a], &weights[b], output))
        }
        ("Transpose", [a]) => fold_transpose(node, &weights[a], output).map(Some),
        ("Identity", [a]) => Ok(Some(Tensor {
            name: output,
            ..weights[a].clone()
        })),
        _ => Ok(None),
    }
}

/// Element-wise arithmetic on `f32` constants of equal shape, or with one
/// side a single element.
fn fold_binary(op_type: &str, a: &Tensor, b: &Tensor, name: String) -> Option<Tensor> {
    let a_data = a.to_f32()?;
    let b_data = b.to_f32()?;

    let shape = if a.shape == b.shape || b.numel() == 1 {
        a.shape.clone()
    } else if a.numel() == 1 {
        b.shape.clone()
    } else {
        return None;
    };

    let op: fn(f32, f32) -> f32 = match op_type {
        "Add" => |x, y| x + y,
        "Sub" => |x, y| x - y,
        "Mul" => |x, y| x * y,
        "Div" => |x, y| x / y,
        _ => return None,
    };
    let at = |data: &[f32], j: usize| if data.len() == 1 { data[0] } else { data[j] };

    let numel: usize = shape.iter().product();
    let res_data: Vec<f32> = (0..numel)
        .map(|j| op(at(&a_data, j), at(&b_data, j)))
        .collect();
    Some(Tensor::from_f32(name, shape, &res_data))
}

/// Permutes a constant of any element type by moving whole elements.
fn fold_transpose(node: &Node, a: &Tensor, name: String) -> Result<Tensor, OptimizerError> {
    let rank = a.shape.len();
    let perm: Vec<usize> = match node.attr_ints("perm") {
        Some(p) => p.iter().map(|&x| x as usize).collect(),
        None => (0..rank).rev().collect(),
    };
    let mut sorted = perm.clone();
    sorted.sort_unstable();
    if sorted != (0..rank).collect::<Vec<_>>() {
        return Err(OptimizerError::Error(format!(
            "invalid perm {:?} in {} for rank {}",
            perm, node.name, rank
        )));
    }

    let data = a
        .data
        .as_ref()
        .ok_or_else(|| OptimizerError::Error(format!("constant {} has no data", a.name)))?;
    let elem = a.data_type.size_of();
    if data.len() != a.numel() * elem {
        return Err(OptimizerError::Error(format!(
            "constant {} holds {} bytes, expected {}",
            a.name,
            data.len(),
            a.numel() * elem
        )));
    }

    let output_shape: Vec<usize> = perm.iter().map(|&p| a.shape[p]).collect();
    let strides_a = strides(&a.shape);
    let strides_res = strides(&output_shape);

    let mut res_data = vec![0u8; data.len()];
    let mut coords = vec![0; rank];
    for j in 0..a.numel() {
        let mut remaining = j;
        for k in 0..rank {
            coords[k] = remaining / strides_a[k];
            remaining %= strides_a[k];
        }

        let mut res_idx = 0;
        for (k, &p) in perm.iter().enumerate() {
            res_idx += coords[p] * strides_res[k];
        }
        res_data[res_idx * elem..(res_idx + 1) * elem]
            .copy_from_slice(&data[j * elem..(j + 1) * elem]);
    }

    Ok(Tensor {
        name,
        shape: output_shape,
        data_type: a.data_type,
        data: Some(res_data),
    })
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for j in (0..shape.len().saturating_sub(1)).rev() {
        strides[j] = strides[j + 1] * shape[j + 1];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Attribute, DataType, Node, ValueInfo};
    use std::collections::HashMap;

    fn binary_ir(op_type: &str, a: f32, b: f32) -> ModelIR {
        let mut ir = ModelIR::new();
        ir.weights.insert("A".to_string(), Tensor::from_f32("A", vec![1], &[a]));
        ir.weights.insert("B".to_string(), Tensor::from_f32("B", vec![1], &[b]));
        ir.nodes.push(Node {
            name: op_type.to_lowercase(),
            op_type: op_type.to_string(),
            inputs: vec!["A".to_string(), "B".to_string()],
            outputs: vec!["C".to_string()],
            attributes: HashMap::new(),
        });
        ir
    }

    fn folded_scalar(ir: &ModelIR) -> f32 {
        ir.weights["C"].to_f32().unwrap()[0]
    }

    #[test]
    fn test_constant_folding_basic_add() {
        let mut ir = binary_ir("Add", 1.0, 2.0);
        ConstantFolding.apply(&mut ir).unwrap();
        assert_eq!(ir.nodes.len(), 0);
        assert!((folded_scalar(&ir) - 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_constant_folding_basic_sub() {
        let mut ir = binary_ir("Sub", 2.0, 1.0);
        ConstantFolding.apply(&mut ir).unwrap();
        assert_eq!(ir.nodes.len(), 0);
        assert!((folded_scalar(&ir) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_constant_folding_basic_mul() {
        let mut ir = binary_ir("Mul", 2.0, 3.0);
        ConstantFolding.apply(&mut ir).unwrap();
        assert_eq!(ir.nodes.len(), 0);
        assert!((folded_scalar(&ir) - 6.0).abs() < 1e-4);
    }

    #[test]
    fn test_constant_folding_basic_div() {
        let mut ir = binary_ir("Div", 3.0, 2.0);
        ConstantFolding.apply(&mut ir).unwrap();
        assert_eq!(ir.nodes.len(), 0);
        assert!((folded_scalar(&ir) - 1.5).abs() < 1e-4);
    }

    #[test]
    fn test_constant_folding_scalar_broadcast() {
        let mut ir = ModelIR::new();
        ir.weights.insert("A".to_string(), Tensor::from_f32("A", vec![3], &[1.0, 2.0, 3.0]));
        ir.weights.insert("B".to_string(), Tensor::from_f32("B", vec![1], &[10.0]));
        ir.nodes.push(Node {
            name: "mul".to_string(),
            op_type: "Mul".to_string(),
            inputs: vec!["A".to_string(), "B".to_string()],
            outputs: vec!["C".to_string()],
            attributes: HashMap::new(),
        });

        ConstantFolding.apply(&mut ir).unwrap();

        assert_eq!(ir.weights["C"].to_f32().unwrap(), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_constant_folding_transpose() {
        let mut ir = ModelIR::new();
        ir.weights.insert(
            "A".to_string(),
            Tensor::from_f32("A", vec![2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
        );

        let mut attrs = HashMap::new();
        attrs.insert("perm".to_string(), Attribute::Ints(vec![1, 0]));

        ir.nodes.push(Node {
            name: "transpose".to_string(),
            op_type: "Transpose".to_string(),
            inputs: vec!["A".to_string()],
            outputs: vec!["B".to_string()],
            attributes: attrs,
        });

        ConstantFolding.apply(&mut ir).unwrap();

        assert_eq!(ir.nodes.len(), 0);
        assert_eq!(ir.weights["B"].shape, vec![3, 2]);
        assert_eq!(
            ir.weights["B"].to_f32().unwrap(),
            vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]
        );
    }

    #[test]
    fn test_constant_folding_keras_kernel_layout() {
        // [kh, kw, in, out] = [1, 2, 1, 2] -> [out, in, kh, kw]
        let mut ir = ModelIR::new();
        ir.weights.insert(
            "kernel".to_string(),
            Tensor::from_f32("kernel", vec![1, 2, 1, 2], &[1.0, 2.0, 3.0, 4.0]),
        );
        let mut attrs = HashMap::new();
        attrs.insert("perm".to_string(), Attribute::Ints(vec![3, 2, 0, 1]));
        ir.nodes.push(Node {
            name: "/conv2d/Transpose".to_string(),
            op_type: "Transpose".to_string(),
            inputs: vec!["kernel".to_string()],
            outputs: vec!["/conv2d/Transpose_output_0".to_string()],
            attributes: attrs,
        });

        ConstantFolding.apply(&mut ir).unwrap();

        let folded = &ir.weights["/conv2d/Transpose_output_0"];
        assert_eq!(folded.shape, vec![2, 1, 1, 2]);
        assert_eq!(folded.to_f32().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_constant_folding_skips_runtime_inputs_and_outputs() {
        let mut ir = binary_ir("Add", 1.0, 2.0);
        ir.outputs.push(ValueInfo {
            name: "C".to_string(),
            dims: vec![],
            data_type: DataType::F32,
        });
        ir.nodes.push(Node {
            name: "relu".to_string(),
            op_type: "Relu".to_string(),
            inputs: vec!["input".to_string()],
            outputs: vec!["D".to_string()],
            attributes: HashMap::new(),
        });

        ConstantFolding.apply(&mut ir).unwrap();

        assert_eq!(ir.nodes.len(), 2);
        assert!(!ir.weights.contains_key("C"));
    }
}
