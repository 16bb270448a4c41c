use crate::ir::{ModelIR, Tensor};
use crate::optimizer::{OptimizationPass, OptimizerError};

/// Folds an inference-mode `BatchNormalization` into the `Conv` feeding it.
///
/// With `s = gamma / sqrt(var + eps)` the convolution becomes
/// `W' = W * s` (per output channel) and `b' = (b - mean) * s + beta`.
pub struct OperatorFusion;

impl OptimizationPass for OperatorFusion {
    fn name(&self) -> &'static str {
        "conv_bn_fusion"
    }

    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        let mut i = 0;
        while i < ir.nodes.len() {
            if ir.nodes[i].op_type == "BatchNormalization" {
                if let Some(conv_idx) = fusable_conv(ir, i) {
                    fuse(ir, conv_idx, i)?;
                    ir.nodes.remove(i);
                    continue;
                }
            }
            i += 1;
        }
        Ok(())
    }
}

fn is_exclusive_constant(ir: &ModelIR, name: &str) -> bool {
    ir.weights.contains_key(name) && ir.consumers(name).len() == 1
}

fn conv_bias(ir: &ModelIR, conv_idx: usize) -> Option<&String> {
    ir.nodes[conv_idx].inputs.get(2).filter(|b| !b.is_empty())
}

fn fusable_conv(ir: &ModelIR, bn_idx: usize) -> Option<usize> {
    let bn = &ir.nodes[bn_idx];
    if bn.attr_int("training_mode").unwrap_or(0) != 0
        || bn.inputs.len() != 5
        || bn.outputs.len() != 1
        || !bn.inputs[1..].iter().all(|p| ir.weights.contains_key(p))
    {
        return None;
    }

    let conv_idx = ir.producer(&bn.inputs[0])?;
    let conv = &ir.nodes[conv_idx];
    if conv.op_type != "Conv" || conv.outputs.len() != 1 {
        return None;
    }
    if ir.consumers(&conv.outputs[0]).len() != 1 || ir.is_graph_output(&conv.outputs[0]) {
        return None;
    }
    if !is_exclusive_constant(ir, conv.inputs.get(1)?) {
        return None;
    }
    if let Some(bias) = conv_bias(ir, conv_idx) {
        if !is_exclusive_constant(ir, bias) {
            return None;
        }
    }
    Some(conv_idx)
}

fn float_constant(ir: &ModelIR, name: &str) -> Result<Vec<f32>, OptimizerError> {
    ir.weights
        .get(name)
        .and_then(Tensor::to_f32)
        .ok_or_else(|| OptimizerError::Error(format!("{} is not a float constant", name)))
}

fn fuse(ir: &mut ModelIR, conv_idx: usize, bn_idx: usize) -> Result<(), OptimizerError> {
    let bn = ir.nodes[bn_idx].clone();
    let epsilon = bn.attr_float("epsilon").unwrap_or(1e-5);
    let gamma = float_constant(ir, &bn.inputs[1])?;
    let beta = float_constant(ir, &bn.inputs[2])?;
    let mean = float_constant(ir, &bn.inputs[3])?;
    let var = float_constant(ir, &bn.inputs[4])?;

    let weight_name = ir.nodes[conv_idx].inputs[1].clone();
    let mut weight = float_constant(ir, &weight_name)?;
    let weight_shape = ir.weights[&weight_name].shape.clone();
    let out_channels = weight_shape.first().copied().unwrap_or(0);
    if out_channels == 0
        || weight.len() % out_channels != 0
        || [&gamma, &beta, &mean, &var]
            .iter()
            .any(|p| p.len() != out_channels)
    {
        return Err(OptimizerError::Error(format!(
            "cannot fuse {} into {}: {} output channels against batch norm of {}",
            bn.name,
            ir.nodes[conv_idx].name,
            out_channels,
            gamma.len()
        )));
    }

    let bias_name = conv_bias(ir, conv_idx).cloned();
    let bias = match &bias_name {
        Some(name) => float_constant(ir, name)?,
        None => vec![0.0; out_channels],
    };
    if bias.len() != out_channels {
        return Err(OptimizerError::Error(format!(
            "bias of {} has {} elements, expected {}",
            ir.nodes[conv_idx].name,
            bias.len(),
            out_channels
        )));
    }

    let scale: Vec<f32> = gamma
        .iter()
        .zip(&var)
        .map(|(g, v)| g / (v + epsilon).sqrt())
        .collect();
    let per_channel = weight.len() / out_channels;
    for (c, kernel) in weight.chunks_mut(per_channel).enumerate() {
        for w in kernel {
            *w *= scale[c];
        }
    }
    let fused_bias: Vec<f32> = (0..out_channels)
        .map(|c| (bias[c] - mean[c]) * scale[c] + beta[c])
        .collect();

    ir.weights.insert(
        weight_name.clone(),
        Tensor::from_f32(weight_name.clone(), weight_shape, &weight),
    );
    let bias_name = bias_name.unwrap_or_else(|| fused_bias_name(ir, &weight_name));
    ir.weights.insert(
        bias_name.clone(),
        Tensor::from_f32(bias_name.clone(), vec![out_channels], &fused_bias),
    );

    let conv = &mut ir.nodes[conv_idx];
    let replaced = std::mem::replace(&mut conv.outputs[0], bn.outputs[0].clone());
    conv.inputs.truncate(2);
    conv.inputs.push(bias_name);
    ir.value_info.retain(|v| v.name != replaced);
    Ok(())
}

/// `encoder1.enc1conv1.weight` gets `encoder1.enc1conv1.bias`.
fn fused_bias_name(ir: &ModelIR, weight_name: &str) -> String {
    let mut name = match weight_name.strip_suffix("weight") {
        Some(prefix) => format!("{}bias", prefix),
        None => format!("{}_bias", weight_name),
    };
    while ir.weights.contains_key(&name) {
        name.push_str("_fused");
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Attribute, Node};
    use std::collections::HashMap;

    fn conv_bn_ir(with_bias: bool) -> ModelIR {
        let mut ir = ModelIR::new();
        // two output channels, one input channel, 1x1 kernel
        ir.weights.insert("conv.weight".to_string(), Tensor::from_f32("conv.weight", vec![2, 1, 1, 1], &[1.0, 2.0]));
        let mut conv_inputs = vec!["X".to_string(), "conv.weight".to_string()];
        if with_bias {
            ir.weights.insert("conv.bias".to_string(), Tensor::from_f32("conv.bias", vec![2], &[0.5, -1.0]));
            conv_inputs.push("conv.bias".to_string());
        }
        for (name, values) in [
            ("bn.weight", [2.0, 1.0]),
            ("bn.bias", [0.1, 0.2]),
            ("bn.running_mean", [1.0, 0.0]),
            ("bn.running_var", [4.0, 1.0]),
        ] {
            ir.weights.insert(name.to_string(), Tensor::from_f32(name, vec![2], &values));
        }

        ir.nodes.push(Node {
            name: "conv".to_string(),
            op_type: "Conv".to_string(),
            inputs: conv_inputs,
            outputs: vec!["conv_out".to_string()],
            attributes: HashMap::new(),
        });

        let mut attrs = HashMap::new();
        attrs.insert("epsilon".to_string(), Attribute::Float(0.0));
        ir.nodes.push(Node {
            name: "bn".to_string(),
            op_type: "BatchNormalization".to_string(),
            inputs: vec![
                "conv_out".to_string(),
                "bn.weight".to_string(),
                "bn.bias".to_string(),
                "bn.running_mean".to_string(),
                "bn.running_var".to_string(),
            ],
            outputs: vec!["Y".to_string()],
            attributes: attrs,
        });
        ir
    }

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_fuse_conv_bn() {
        let mut ir = conv_bn_ir(true);

        OperatorFusion.apply(&mut ir).unwrap();

        assert_eq!(ir.nodes.len(), 1);
        assert_eq!(ir.nodes[0].op_type, "Conv");
        assert_eq!(ir.nodes[0].outputs[0], "Y");
        // scale = [2 / 2, 1 / 1] = [1, 1]
        assert!(close(&ir.weights["conv.weight"].to_f32().unwrap(), &[1.0, 2.0]));
        // (0.5 - 1) * 1 + 0.1, (-1 - 0) * 1 + 0.2
        assert!(close(&ir.weights["conv.bias"].to_f32().unwrap(), &[-0.4, -0.8]));
    }

    #[test]
    fn test_fuse_conv_without_bias_adds_one() {
        let mut ir = conv_bn_ir(false);
        ir.weights.insert("bn.running_var".to_string(), Tensor::from_f32("bn.running_var", vec![2], &[1.0, 4.0]));

        OperatorFusion.apply(&mut ir).unwrap();

        let conv = &ir.nodes[0];
        assert_eq!(conv.inputs, vec!["X", "conv.weight", "conv.bias"]);
        // scale = [2, 0.5]
        assert!(close(&ir.weights["conv.weight"].to_f32().unwrap(), &[2.0, 1.0]));
        assert!(close(&ir.weights["conv.bias"].to_f32().unwrap(), &[-1.9, 0.2]));
    }

    #[test]
    fn test_training_batch_norm_is_kept() {
        let mut ir = conv_bn_ir(true);
        ir.nodes[1]
            .attributes
            .insert("training_mode".to_string(), Attribute::Int(1));

        OperatorFusion.apply(&mut ir).unwrap();

        assert_eq!(ir.nodes.len(), 2);
        assert!(close(&ir.weights["conv.weight"].to_f32().unwrap(), &[1.0, 2.0]));
    }

    #[test]
    fn test_shared_conv_output_is_kept() {
        let mut ir = conv_bn_ir(true);
        ir.nodes.push(Node {
            name: "relu".to_string(),
            op_type: "Relu".to_string(),
            inputs: vec!["conv_out".to_string()],
            outputs: vec!["Z".to_string()],
            attributes: HashMap::new(),
        });

        OperatorFusion.apply(&mut ir).unwrap();

        assert_eq!(ir.nodes.len(), 3);
    }

    #[test]
    fn test_fused_bias_name_avoids_collisions() {
        let mut ir = ModelIR::new();
        assert_eq!(fused_bias_name(&ir, "inc.double_conv.0.weight"), "inc.double_conv.0.bias");
        ir.weights.insert("k.bias".to_string(), Tensor::from_f32("k.bias", vec![1], &[0.0]));
        assert_eq!(fused_bias_name(&ir, "k.weight"), "k.bias_fused");
        assert_eq!(fused_bias_name(&ir, "kernel"), "kernel_bias");
    }
}
