use crate::exporter::ExporterError;
use crate::ir::{ModelIR, Node};

pub const MIN_OPSET: i64 = 9;
pub const MAX_OPSET: i64 = 20;

/// Opset of the default domain in which `op_type` first appeared.
pub fn since_version(op_type: &str) -> Option<i64> {
    let version = match op_type {
        "Add" | "Sub" | "Mul" | "Div" => 1,
        "BatchNormalization" => 1,
        "Concat" => 1,
        "Conv" | "ConvTranspose" => 1,
        "Identity" => 1,
        "MaxPool" => 1,
        "Pad" => 1,
        "Relu" | "Sigmoid" => 1,
        "Transpose" => 1,
        "Resize" => 10,
        _ => return None,
    };
    Some(version)
}

/// Lowest opset able to express `node` in the form it was traced, which can
/// be later than the operator itself.
pub fn required_opset(node: &Node) -> Option<i64> {
    let since = since_version(&node.op_type)?;
    let form = match node.op_type.as_str() {
        // roi/scales inputs and coordinate modes
        "Resize"
            if node.inputs.len() > 2
                || node.attributes.contains_key("coordinate_transformation_mode") =>
        {
            11
        }
        // pads as an input rather than an attribute
        "Pad" if node.inputs.len() > 1 => 11,
        "MaxPool"
            if node.attributes.contains_key("ceil_mode")
                || node.attributes.contains_key("dilations") =>
        {
            10
        }
        "BatchNormalization" if node.attr_int("training_mode").unwrap_or(0) != 0 => 14,
        _ => since,
    };
    Some(since.max(form))
}

pub fn check_version(opset: i64) -> Result<(), ExporterError> {
    if (MIN_OPSET..=MAX_OPSET).contains(&opset) {
        Ok(())
    } else {
        Err(ExporterError::UnsupportedOpset(opset))
    }
}

/// Fails on the first node that `opset` cannot represent.
pub fn check(ir: &ModelIR, opset: i64) -> Result<(), ExporterError> {
    check_version(opset)?;
    for node in &ir.nodes {
        match required_opset(node) {
            None => {
                return Err(ExporterError::UnsupportedOperator(format!(
                    "{} ({}) is not supported by the exporter",
                    node.op_type, node.name
                )))
            }
            Some(required) if required > opset => {
                return Err(ExporterError::UnsupportedOperator(format!(
                    "{} ({}) requires opset {}, exporting opset {}",
                    node.op_type, node.name, required, opset
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Newest IR version runtimes released alongside `opset` can load.
pub fn ir_version(opset: i64) -> i64 {
    match opset {
        ..=9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        _ => 9,
    }
}
