use crate::ir::{format_dims, DataType, Dim, ModelIR, Node, Tensor, ValueInfo};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShapeError {
    #[error("Value {0} not found")]
    MissingValue(String),
    #[error("Shape mismatch in {node}: {message}")]
    Mismatch { node: String, message: String },
    #[error("Invalid attribute {attribute} in {node}: {message}")]
    InvalidAttribute {
        node: String,
        attribute: String,
        message: String,
    },
    #[error("No shape rule for operator {op_type} ({node})")]
    Unsupported { node: String, op_type: String },
}

/// What shape inference knows about one node input: its dims and, when the
/// input is an initializer, its value.
#[derive(Debug, Clone, Copy)]
pub struct NodeInput<'a> {
    pub dims: &'a [Dim],
    pub constant: Option<&'a Tensor>,
}

pub struct ShapeInference;

impl ShapeInference {
    /// Computes the output dims of a single-output node.
    pub fn infer_node(node: &Node, inputs: &[NodeInput<'_>]) -> Result<Vec<Dim>, ShapeError> {
        match node.op_type.as_str() {
            "Relu" | "Sigmoid" | "Identity" => Ok(input(node, inputs, 0)?.dims.to_vec()),
            "Add" | "Sub" | "Mul" | "Div" => broadcast(
                node,
                input(node, inputs, 0)?.dims,
                input(node, inputs, 1)?.dims,
            ),
            "Conv" => conv(node, inputs),
            "ConvTranspose" => conv_transpose(node, inputs),
            "BatchNormalization" => batch_norm(node, inputs),
            "MaxPool" => max_pool(node, inputs),
            "Concat" => concat(node, inputs),
            "Resize" => resize(node, inputs),
            "Pad" => pad(node, inputs),
            "Transpose" => transpose(node, inputs),
            _ => Err(ShapeError::Unsupported {
                node: node.name.clone(),
                op_type: node.op_type.clone(),
            }),
        }
    }

    /// Walks the graph in order, recomputing the dims of every intermediate
    /// value. Declared symbolic dims on graph outputs are kept.
    pub fn infer(ir: &mut ModelIR) -> Result<(), ShapeError> {
        let mut value_shapes: HashMap<String, Vec<Dim>> = HashMap::new();

        for input in &ir.inputs {
            value_shapes.insert(input.name.clone(), input.dims.clone());
        }

        for (name, weight) in &ir.weights {
            value_shapes.insert(name.clone(), weight.dims());
        }

        let mut inferred_values = Vec::with_capacity(ir.nodes.len());

        for node in &ir.nodes {
            let dims = {
                let mut inputs = Vec::with_capacity(node.inputs.len());
                for name in &node.inputs {
                    let dims = value_shapes
                        .get(name)
                        .ok_or_else(|| ShapeError::MissingValue(name.clone()))?;
                    inputs.push(NodeInput {
                        dims,
                        constant: ir.weights.get(name),
                    });
                }
                Self::infer_node(node, &inputs)?
            };

            let output = node
                .outputs
                .first()
                .ok_or_else(|| ShapeError::MissingValue(format!("{} output", node.name)))?;
            value_shapes.insert(output.clone(), dims.clone());
            inferred_values.push(ValueInfo {
                name: output.clone(),
                dims,
                data_type: DataType::F32,
            });
        }

        for output in &mut ir.outputs {
            let inferred = value_shapes
                .get(&output.name)
                .ok_or_else(|| ShapeError::MissingValue(output.name.clone()))?;
            if output.dims.len() != inferred.len() {
                output.dims = inferred.clone();
                continue;
            }
            for (declared, inferred) in output.dims.iter_mut().zip(inferred) {
                if let Dim::Fixed(_) = declared {
                    *declared = inferred.clone();
                }
            }
        }

        let value_info: Vec<ValueInfo> = inferred_values
            .into_iter()
            .filter(|v| !ir.outputs.iter().any(|o| o.name == v.name))
            .collect();
        ir.value_info = value_info;

        Ok(())
    }
}

fn input<'a, 'b>(
    node: &Node,
    inputs: &'b [NodeInput<'a>],
    index: usize,
) -> Result<&'b NodeInput<'a>, ShapeError> {
    inputs
        .get(index)
        .ok_or_else(|| ShapeError::MissingValue(format!("{} input #{}", node.name, index)))
}

fn mismatch(node: &Node, message: String) -> ShapeError {
    ShapeError::Mismatch {
        node: node.name.clone(),
        message,
    }
}

fn invalid(node: &Node, attribute: &str, message: String) -> ShapeError {
    ShapeError::InvalidAttribute {
        node: node.name.clone(),
        attribute: attribute.to_string(),
        message,
    }
}

fn derived(node: &Node, axis: usize) -> Dim {
    let output = node.outputs.first().map(String::as_str).unwrap_or(node.name.as_str());
    Dim::Param(format!("{}_dim_{}", output, axis))
}

fn ints_or(node: &Node, name: &str, default: Vec<i64>) -> Result<Vec<i64>, ShapeError> {
    let values = node.attr_ints(name).map(<[i64]>::to_vec).unwrap_or(default.clone());
    if values.len() != default.len() {
        return Err(invalid(
            node,
            name,
            format!("expected {} values, got {}", default.len(), values.len()),
        ));
    }
    Ok(values)
}

fn spatial(node: &Node, axis: usize, dim: &Dim, f: impl Fn(i64) -> i64) -> Result<Dim, ShapeError> {
    match dim {
        Dim::Fixed(n) => {
            let out = f(*n as i64);
            if out < 1 {
                return Err(mismatch(
                    node,
                    format!("axis {} of size {} produces an empty output", axis, n),
                ));
            }
            Ok(Dim::Fixed(out as usize))
        }
        Dim::Param(_) => Ok(derived(node, axis)),
    }
}

fn static_dims(node: &Node, what: &str, dims: &[Dim]) -> Result<Vec<usize>, ShapeError> {
    dims.iter()
        .map(|d| d.fixed())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| mismatch(node, format!("{} shape {} must be static", what, format_dims(dims))))
}

fn broadcast(node: &Node, a: &[Dim], b: &[Dim]) -> Result<Vec<Dim>, ShapeError> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i + a.len() >= rank { Some(&a[i + a.len() - rank]) } else { None };
        let db = if i + b.len() >= rank { Some(&b[i + b.len() - rank]) } else { None };
        let dim = match (da, db) {
            (Some(x), None) | (None, Some(x)) => x.clone(),
            (Some(Dim::Fixed(1)), Some(y)) | (Some(y), Some(Dim::Fixed(1))) => y.clone(),
            (Some(Dim::Fixed(x)), Some(Dim::Fixed(y))) if x != y => {
                return Err(mismatch(
                    node,
                    format!(
                        "cannot broadcast {} with {}",
                        format_dims(a),
                        format_dims(b)
                    ),
                ))
            }
            (Some(Dim::Param(_)), Some(Dim::Fixed(n))) | (Some(Dim::Fixed(n)), Some(Dim::Param(_))) => {
                Dim::Fixed(*n)
            }
            (Some(x), Some(_)) => x.clone(),
            (None, None) => unreachable!("axis within rank of at least one operand"),
        };
        out.push(dim);
    }
    Ok(out)
}

fn conv(node: &Node, inputs: &[NodeInput<'_>]) -> Result<Vec<Dim>, ShapeError> {
    let x = input(node, inputs, 0)?.dims;
    let w = input(node, inputs, 1)?.dims;
    if x.len() < 3 || x.len() != w.len() {
        return Err(mismatch(
            node,
            format!(
                "input {} is not compatible with weight {}",
                format_dims(x),
                format_dims(w)
            ),
        ));
    }
    let w = static_dims(node, "weight", w)?;
    let group = node.attr_int("group").unwrap_or(1);
    if group < 1 {
        return Err(invalid(node, "group", format!("must be positive, got {}", group)));
    }
    let expected_channels = w[1] * group as usize;
    if let Dim::Fixed(channels) = x[1] {
        if channels != expected_channels {
            return Err(mismatch(
                node,
                format!(
                    "expected input with {} channels, got {} (input {}, weight {})",
                    expected_channels,
                    channels,
                    format_dims(x),
                    format_dims(&crate::ir::fixed_dims(&w))
                ),
            ));
        }
    }
    if let Some(bias) = inputs.get(2) {
        if bias.dims != [Dim::Fixed(w[0])] {
            return Err(mismatch(
                node,
                format!("bias {} does not match {} output channels", format_dims(bias.dims), w[0]),
            ));
        }
    }

    let rank = x.len() - 2;
    let kernel: Vec<i64> = w[2..].iter().map(|&k| k as i64).collect();
    let strides = ints_or(node, "strides", vec![1; rank])?;
    let dilations = ints_or(node, "dilations", vec![1; rank])?;
    let pads = ints_or(node, "pads", vec![0; 2 * rank])?;

    let mut out = vec![x[0].clone(), Dim::Fixed(w[0])];
    for i in 0..rank {
        let effective = dilations[i] * (kernel[i] - 1) + 1;
        out.push(spatial(node, i + 2, &x[i + 2], |n| {
            let span = n + pads[i] + pads[i + rank] - effective;
            if span < 0 {
                0
            } else {
                span / strides[i] + 1
            }
        })?);
    }
    Ok(out)
}

fn conv_transpose(node: &Node, inputs: &[NodeInput<'_>]) -> Result<Vec<Dim>, ShapeError> {
    let x = input(node, inputs, 0)?.dims;
    let w = input(node, inputs, 1)?.dims;
    if x.len() < 3 || x.len() != w.len() {
        return Err(mismatch(
            node,
            format!(
                "input {} is not compatible with weight {}",
                format_dims(x),
                format_dims(w)
            ),
        ));
    }
    let w = static_dims(node, "weight", w)?;
    let group = node.attr_int("group").unwrap_or(1).max(1) as usize;
    if let Dim::Fixed(channels) = x[1] {
        if channels != w[0] {
            return Err(mismatch(
                node,
                format!(
                    "expected input with {} channels, got {} (input {})",
                    w[0],
                    channels,
                    format_dims(x)
                ),
            ));
        }
    }
    let out_channels = w[1] * group;

    let rank = x.len() - 2;
    let kernel: Vec<i64> = w[2..].iter().map(|&k| k as i64).collect();
    let strides = ints_or(node, "strides", vec![1; rank])?;
    let dilations = ints_or(node, "dilations", vec![1; rank])?;
    let pads = ints_or(node, "pads", vec![0; 2 * rank])?;
    let output_padding = ints_or(node, "output_padding", vec![0; rank])?;

    let mut out = vec![x[0].clone(), Dim::Fixed(out_channels)];
    for i in 0..rank {
        let effective = dilations[i] * (kernel[i] - 1) + 1;
        out.push(spatial(node, i + 2, &x[i + 2], |n| {
            strides[i] * (n - 1) + output_padding[i] + effective - pads[i] - pads[i + rank]
        })?);
    }
    Ok(out)
}

fn batch_norm(node: &Node, inputs: &[NodeInput<'_>]) -> Result<Vec<Dim>, ShapeError> {
    let x = input(node, inputs, 0)?.dims;
    if x.len() < 2 {
        return Err(mismatch(node, format!("input {} has no channel axis", format_dims(x))));
    }
    for (index, label) in ["scale", "bias", "mean", "var"].iter().enumerate() {
        let param = input(node, inputs, index + 1)?.dims;
        let compatible = match (&x[1], param) {
            (Dim::Fixed(c), [Dim::Fixed(p)]) => c == p,
            (Dim::Param(_), [_]) => true,
            _ => false,
        };
        if !compatible {
            return Err(mismatch(
                node,
                format!(
                    "{} {} does not match channels of input {}",
                    label,
                    format_dims(param),
                    format_dims(x)
                ),
            ));
        }
    }
    Ok(x.to_vec())
}

fn max_pool(node: &Node, inputs: &[NodeInput<'_>]) -> Result<Vec<Dim>, ShapeError> {
    let x = input(node, inputs, 0)?.dims;
    if x.len() < 3 {
        return Err(mismatch(node, format!("input {} has no spatial axes", format_dims(x))));
    }
    let rank = x.len() - 2;
    let kernel = node
        .attr_ints("kernel_shape")
        .map(<[i64]>::to_vec)
        .ok_or_else(|| invalid(node, "kernel_shape", "missing".to_string()))?;
    if kernel.len() != rank {
        return Err(invalid(
            node,
            "kernel_shape",
            format!("expected {} values, got {}", rank, kernel.len()),
        ));
    }
    let strides = ints_or(node, "strides", vec![1; rank])?;
    let dilations = ints_or(node, "dilations", vec![1; rank])?;
    let pads = ints_or(node, "pads", vec![0; 2 * rank])?;
    let ceil_mode = node.attr_int("ceil_mode").unwrap_or(0) != 0;

    let mut out = vec![x[0].clone(), x[1].clone()];
    for i in 0..rank {
        let effective = dilations[i] * (kernel[i] - 1) + 1;
        out.push(spatial(node, i + 2, &x[i + 2], |n| {
            let span = n + pads[i] + pads[i + rank] - effective;
            if span < 0 {
                0
            } else if ceil_mode {
                (span + strides[i] - 1) / strides[i] + 1
            } else {
                span / strides[i] + 1
            }
        })?);
    }
    Ok(out)
}

fn concat(node: &Node, inputs: &[NodeInput<'_>]) -> Result<Vec<Dim>, ShapeError> {
    let first = input(node, inputs, 0)?.dims;
    let rank = first.len() as i64;
    let axis = node
        .attr_int("axis")
        .ok_or_else(|| invalid(node, "axis", "missing".to_string()))?;
    let axis = if axis < 0 { axis + rank } else { axis };
    if axis < 0 || axis >= rank {
        return Err(invalid(node, "axis", format!("out of range for rank {}", rank)));
    }
    let axis = axis as usize;

    let mut out = first.to_vec();
    let mut total = first[axis].fixed();
    for other in &inputs[1..] {
        if other.dims.len() != first.len() {
            return Err(mismatch(
                node,
                format!(
                    "cannot concatenate {} with {}",
                    format_dims(first),
                    format_dims(other.dims)
                ),
            ));
        }
        for (i, (a, b)) in first.iter().zip(other.dims).enumerate() {
            if i == axis {
                continue;
            }
            if let (Dim::Fixed(x), Dim::Fixed(y)) = (a, b) {
                if x != y {
                    return Err(mismatch(
                        node,
                        format!(
                            "cannot concatenate {} with {} along axis {}",
                            format_dims(first),
                            format_dims(other.dims),
                            axis
                        ),
                    ));
                }
            }
        }
        total = match (total, other.dims[axis].fixed()) {
            (Some(t), Some(n)) => Some(t + n),
            _ => None,
        };
    }
    out[axis] = match total {
        Some(t) => Dim::Fixed(t),
        None => derived(node, axis),
    };
    Ok(out)
}

fn resize(node: &Node, inputs: &[NodeInput<'_>]) -> Result<Vec<Dim>, ShapeError> {
    let x = input(node, inputs, 0)?.dims;
    let scales = inputs
        .get(2)
        .and_then(|i| i.constant)
        .and_then(Tensor::to_f32)
        .filter(|s| !s.is_empty());
    if let Some(scales) = scales {
        if scales.len() != x.len() {
            return Err(mismatch(
                node,
                format!("{} scales for input {}", scales.len(), format_dims(x)),
            ));
        }
        let mut out = Vec::with_capacity(x.len());
        for (axis, (dim, scale)) in x.iter().zip(&scales).enumerate() {
            out.push(match dim {
                Dim::Param(_) if *scale == 1.0 => dim.clone(),
                _ => spatial(node, axis, dim, |n| (n as f32 * scale).floor() as i64)?,
            });
        }
        return Ok(out);
    }
    let sizes = inputs.get(3).and_then(|i| i.constant).and_then(Tensor::to_i64);
    match sizes {
        Some(sizes) if sizes.len() == x.len() => {
            Ok(sizes.iter().map(|&s| Dim::Fixed(s.max(0) as usize)).collect())
        }
        _ => Err(mismatch(node, "Resize needs constant scales or sizes".to_string())),
    }
}

fn pad(node: &Node, inputs: &[NodeInput<'_>]) -> Result<Vec<Dim>, ShapeError> {
    let x = input(node, inputs, 0)?.dims;
    let pads = match inputs.get(1).and_then(|i| i.constant).and_then(Tensor::to_i64) {
        Some(p) => p,
        None => node
            .attr_ints("pads")
            .map(<[i64]>::to_vec)
            .ok_or_else(|| mismatch(node, "Pad needs constant pads".to_string()))?,
    };
    let rank = x.len();
    if pads.len() != 2 * rank {
        return Err(invalid(
            node,
            "pads",
            format!("expected {} values, got {}", 2 * rank, pads.len()),
        ));
    }
    let mut out = Vec::with_capacity(rank);
    for (axis, dim) in x.iter().enumerate() {
        let extra = pads[axis] + pads[axis + rank];
        out.push(match dim {
            Dim::Param(_) if extra == 0 => dim.clone(),
            _ => spatial(node, axis, dim, |n| n + extra)?,
        });
    }
    Ok(out)
}

fn transpose(node: &Node, inputs: &[NodeInput<'_>]) -> Result<Vec<Dim>, ShapeError> {
    let shape = input(node, inputs, 0)?.dims;
    let perm = match node.attr_ints("perm") {
        Some(p) => p.to_vec(),
        None => (0..shape.len() as i64).rev().collect(),
    };
    let mut sorted = perm.clone();
    sorted.sort_unstable();
    if sorted != (0..shape.len() as i64).collect::<Vec<_>>() {
        return Err(invalid(
            node,
            "perm",
            format!("{:?} is not a permutation of rank {}", perm, shape.len()),
        ));
    }
    Ok(perm.iter().map(|&p| shape[p as usize].clone()).collect())
}
