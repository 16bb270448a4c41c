use std::collections::HashMap;
use std::fmt;

pub mod shape_inference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DataType {
    pub fn size_of(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::U8 => 1,
        }
    }
}

/// A tensor dimension as declared in the graph.
///
/// `Param` dimensions are symbolic: the exported graph accepts any size on
/// that axis (the batch axis, typically).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dim {
    Fixed(usize),
    Param(String),
}

impl Dim {
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(n) => Some(*n),
            Dim::Param(_) => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{}", n),
            Dim::Param(p) => write!(f, "{}", p),
        }
    }
}

pub fn fixed_dims(shape: &[usize]) -> Vec<Dim> {
    shape.iter().map(|&d| Dim::Fixed(d)).collect()
}

pub fn format_dims(dims: &[Dim]) -> String {
    let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    format!("({})", parts.join(", "))
}

/// A constant tensor with concrete shape. Data is stored little-endian.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data_type: DataType,
    pub data: Option<Vec<u8>>,
}

impl Tensor {
    pub fn from_f32(name: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Self {
        Self {
            name: name.into(),
            shape,
            data_type: DataType::F32,
            data: Some(values.iter().flat_map(|v| v.to_le_bytes()).collect()),
        }
    }

    pub fn from_i64(name: impl Into<String>, shape: Vec<usize>, values: &[i64]) -> Self {
        Self {
            name: name.into(),
            shape,
            data_type: DataType::I64,
            data: Some(values.iter().flat_map(|v| v.to_le_bytes()).collect()),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decodes the payload as `f32` values. `None` for other element types
    /// or when the tensor carries no data.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        if self.data_type != DataType::F32 {
            return None;
        }
        let data = self.data.as_ref()?;
        Some(
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn to_i64(&self) -> Option<Vec<i64>> {
        if self.data_type != DataType::I64 {
            return None;
        }
        let data = self.data.as_ref()?;
        Some(
            data.chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        )
    }

    pub fn dims(&self) -> Vec<Dim> {
        fixed_dims(&self.shape)
    }
}

/// Name, element type and (possibly symbolic) shape of a graph value.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub name: String,
    pub dims: Vec<Dim>,
    pub data_type: DataType,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: HashMap<String, Attribute>,
}

impl Node {
    pub fn attr_int(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(Attribute::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        match self.attributes.get(name) {
            Some(Attribute::Ints(is)) => Some(is),
            _ => None,
        }
    }

    pub fn attr_float(&self, name: &str) -> Option<f32> {
        match self.attributes.get(name) {
            Some(Attribute::Float(f)) => Some(*f),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
}

#[derive(Debug, Clone, Default)]
pub struct ModelIR {
    pub nodes: Vec<Node>,
    pub weights: HashMap<String, Tensor>,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
    pub value_info: Vec<ValueInfo>,
}

impl ModelIR {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer(&self, value: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.outputs.iter().any(|o| o == value))
    }

    pub fn consumers(&self, value: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.iter().any(|i| i == value))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn is_graph_output(&self, value: &str) -> bool {
        self.outputs.iter().any(|o| o.name == value)
    }

    /// Renames a value everywhere it is produced, consumed or declared.
    pub fn rename_value(&mut self, from: &str, to: &str) {
        for node in &mut self.nodes {
            for name in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                if name == from {
                    *name = to.to_string();
                }
            }
        }
        for info in self
            .inputs
            .iter_mut()
            .chain(self.outputs.iter_mut())
            .chain(self.value_info.iter_mut())
        {
            if info.name == from {
                info.name = to.to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_f32_bytes() {
        let t = Tensor::from_f32("t", vec![2], &[1.0, -2.5]);
        assert_eq!(t.data.as_ref().unwrap(), &vec![0, 0, 128, 63, 0, 0, 32, 192]);
        assert_eq!(t.to_f32().unwrap(), vec![1.0, -2.5]);
        assert!(t.to_i64().is_none());
    }

    #[test]
    fn test_rename_value() {
        let mut ir = ModelIR::new();
        ir.nodes.push(Node {
            name: "relu".to_string(),
            op_type: "Relu".to_string(),
            inputs: vec!["X".to_string()],
            outputs: vec!["/relu/Relu_output_0".to_string()],
            attributes: HashMap::new(),
        });
        ir.outputs.push(ValueInfo {
            name: "/relu/Relu_output_0".to_string(),
            dims: vec![Dim::Param("batch_size".to_string()), Dim::Fixed(4)],
            data_type: DataType::F32,
        });

        ir.rename_value("/relu/Relu_output_0", "output");

        assert_eq!(ir.nodes[0].outputs[0], "output");
        assert_eq!(ir.outputs[0].name, "output");
        assert_eq!(ir.producer("output"), Some(0));
        assert_eq!(ir.consumers("X"), vec![0]);
    }

    #[test]
    fn test_format_dims() {
        let dims = vec![Dim::Param("batch_size".to_string()), Dim::Fixed(3)];
        assert_eq!(format_dims(&dims), "(batch_size, 3)");
    }
}
