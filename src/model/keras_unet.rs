//! Channels-last UNet laid out the way a small Keras model stores it.
//!
//! Kernels keep the Keras layout (`[kh, kw, in, out]` for convolutions,
//! `[kh, kw, out, in]` for transposed convolutions). The traced graph
//! transposes them into ONNX layout; constant folding bakes that transpose
//! into the exported initializers.

use crate::ir::{Attribute, Tensor};
use crate::model::init::Initializer;
use crate::model::layers::{concat, relu, sigmoid, transpose, MaxPool2d};
use crate::model::{join, Mode, Module};
use crate::tracer::{TraceError, Tracer, Value};
use rand::Rng;

const KERNEL_TO_ONNX: [i64; 4] = [3, 2, 0, 1];
const NHWC_TO_NCHW: [i64; 4] = [0, 3, 1, 2];
const NCHW_TO_NHWC: [i64; 4] = [0, 2, 3, 1];

#[derive(Debug, Clone)]
pub struct KerasUNetConfig {
    pub input_channels: usize,
    pub classes: usize,
    /// Filters of the first level; doubled at every level below.
    pub filters: usize,
    /// Number of pooling levels between input and bottleneck.
    pub depth: usize,
}

impl KerasUNetConfig {
    pub fn new(input_channels: usize, classes: usize) -> Self {
        Self {
            input_channels,
            classes,
            filters: 16,
            depth: 2,
        }
    }

    pub fn with_filters(mut self, filters: usize) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn init<R: Rng>(&self, rng: &mut R) -> KerasUNet {
        let mut names = LayerNames::default();

        let mut encoders = Vec::with_capacity(self.depth);
        let mut channels = self.input_channels;
        for level in 0..self.depth {
            let width = self.filters << level;
            encoders.push(build_pair(&mut names, channels, width, rng));
            channels = width;
        }
        let bottleneck = build_pair(&mut names, channels, self.filters << self.depth, rng);
        channels = self.filters << self.depth;

        let mut decoders = Vec::with_capacity(self.depth);
        for level in (0..self.depth).rev() {
            let width = self.filters << level;
            let up = KerasConv2DTranspose::new(names.next("conv2d_transpose"), channels, width, rng);
            decoders.push((up, build_pair(&mut names, width * 2, width, rng)));
            channels = width;
        }

        let head = KerasConv2D::new(
            names.next("conv2d"),
            channels,
            self.classes,
            1,
            Activation::Sigmoid,
            rng,
        );

        KerasUNet {
            encoders,
            bottleneck,
            decoders,
            head,
            pool: MaxPool2d::new(2),
            mode: Mode::Train,
        }
    }
}

/// Keras-style automatic layer names: `conv2d`, `conv2d_1`, `conv2d_2`...
#[derive(Debug, Default)]
struct LayerNames {
    counts: std::collections::HashMap<&'static str, usize>,
}

impl LayerNames {
    fn next(&mut self, base: &'static str) -> String {
        let count = self.counts.entry(base).or_insert(0);
        let name = if *count == 0 {
            base.to_string()
        } else {
            format!("{}_{}", base, count)
        };
        *count += 1;
        name
    }
}

fn build_pair<R: Rng>(
    names: &mut LayerNames,
    channels_in: usize,
    channels_out: usize,
    rng: &mut R,
) -> [KerasConv2D; 2] {
    [
        KerasConv2D::new(names.next("conv2d"), channels_in, channels_out, 3, Activation::Relu, rng),
        KerasConv2D::new(names.next("conv2d"), channels_out, channels_out, 3, Activation::Relu, rng),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Relu,
    Sigmoid,
}

#[derive(Debug, Clone)]
struct KerasConv2D {
    name: String,
    kernel: Tensor,
    bias: Tensor,
    kernel_size: usize,
    activation: Activation,
}

impl KerasConv2D {
    fn new<R: Rng>(
        name: String,
        channels_in: usize,
        channels_out: usize,
        kernel_size: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let receptive = kernel_size * kernel_size;
        let kernel = Initializer::XavierUniform {
            fan_in: receptive * channels_in,
            fan_out: receptive * channels_out,
        }
        .init(
            "kernel",
            vec![kernel_size, kernel_size, channels_in, channels_out],
            rng,
        );
        Self {
            name,
            kernel,
            bias: Initializer::Zeros.init("bias", vec![channels_out], rng),
            kernel_size,
            activation,
        }
    }

    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        tracer.scoped(&self.name, |t| {
            let kernel = t.parameter("kernel", &self.kernel);
            let bias = t.parameter("bias", &self.bias);
            let weight = transpose(t, &kernel, &KERNEL_TO_ONNX)?;
            let k = self.kernel_size as i64;
            let p = (k - 1) / 2;
            let x = t.op(
                "Conv",
                &[input, &weight, &bias],
                vec![
                    ("dilations", Attribute::Ints(vec![1, 1])),
                    ("group", Attribute::Int(1)),
                    ("kernel_shape", Attribute::Ints(vec![k, k])),
                    ("pads", Attribute::Ints(vec![p, p, k - 1 - p, k - 1 - p])),
                    ("strides", Attribute::Ints(vec![1, 1])),
                ],
            )?;
            match self.activation {
                Activation::Relu => relu(t, &x),
                Activation::Sigmoid => sigmoid(t, &x),
            }
        })
    }

    fn visit(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        let scope = join(prefix, &self.name);
        visitor(&join(&scope, "kernel"), &self.kernel);
        visitor(&join(&scope, "bias"), &self.bias);
    }

    fn visit_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        let scope = join(prefix, &self.name);
        visitor(&join(&scope, "kernel"), &mut self.kernel);
        visitor(&join(&scope, "bias"), &mut self.bias);
    }
}

/// 2x2 transposed convolution with stride 2.
#[derive(Debug, Clone)]
struct KerasConv2DTranspose {
    name: String,
    kernel: Tensor,
    bias: Tensor,
}

impl KerasConv2DTranspose {
    fn new<R: Rng>(name: String, channels_in: usize, channels_out: usize, rng: &mut R) -> Self {
        let kernel = Initializer::XavierUniform {
            fan_in: 4 * channels_in,
            fan_out: 4 * channels_out,
        }
        .init("kernel", vec![2, 2, channels_out, channels_in], rng);
        Self {
            name,
            kernel,
            bias: Initializer::Zeros.init("bias", vec![channels_out], rng),
        }
    }

    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        tracer.scoped(&self.name, |t| {
            let kernel = t.parameter("kernel", &self.kernel);
            let bias = t.parameter("bias", &self.bias);
            let weight = transpose(t, &kernel, &KERNEL_TO_ONNX)?;
            t.op(
                "ConvTranspose",
                &[input, &weight, &bias],
                vec![
                    ("dilations", Attribute::Ints(vec![1, 1])),
                    ("group", Attribute::Int(1)),
                    ("kernel_shape", Attribute::Ints(vec![2, 2])),
                    ("pads", Attribute::Ints(vec![0, 0, 0, 0])),
                    ("strides", Attribute::Ints(vec![2, 2])),
                ],
            )
        })
    }

    fn visit(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        let scope = join(prefix, &self.name);
        visitor(&join(&scope, "kernel"), &self.kernel);
        visitor(&join(&scope, "bias"), &self.bias);
    }

    fn visit_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        let scope = join(prefix, &self.name);
        visitor(&join(&scope, "kernel"), &mut self.kernel);
        visitor(&join(&scope, "bias"), &mut self.bias);
    }
}

#[derive(Debug, Clone)]
pub struct KerasUNet {
    encoders: Vec<[KerasConv2D; 2]>,
    bottleneck: [KerasConv2D; 2],
    decoders: Vec<(KerasConv2DTranspose, [KerasConv2D; 2])>,
    head: KerasConv2D,
    pool: MaxPool2d,
    mode: Mode,
}

impl KerasUNet {
    fn convs(&self) -> impl Iterator<Item = &KerasConv2D> {
        self.encoders
            .iter()
            .flatten()
            .chain(self.bottleneck.iter())
            .chain(self.decoders.iter().flat_map(|(_, pair)| pair.iter()))
            .chain(std::iter::once(&self.head))
    }
}

fn conv_pair(
    tracer: &mut Tracer,
    pair: &[KerasConv2D; 2],
    input: &Value,
) -> Result<Value, TraceError> {
    let x = pair[0].forward(tracer, input)?;
    pair[1].forward(tracer, &x)
}

impl Module for KerasUNet {
    /// Takes and returns NHWC tensors.
    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        let mut x = tracer.scoped("input_transpose", |t| transpose(t, input, &NHWC_TO_NCHW))?;

        let mut skips = Vec::with_capacity(self.encoders.len());
        for (level, pair) in self.encoders.iter().enumerate() {
            let encoded = conv_pair(tracer, pair, &x)?;
            let pool_name = if level == 0 {
                "max_pooling2d".to_string()
            } else {
                format!("max_pooling2d_{}", level)
            };
            x = tracer.scoped(&pool_name, |t| self.pool.forward(t, &encoded))?;
            skips.push(encoded);
        }
        x = conv_pair(tracer, &self.bottleneck, &x)?;

        for (level, (up, pair)) in self.decoders.iter().enumerate() {
            let upsampled = up.forward(tracer, &x)?;
            let skip = skips.pop().unwrap_or_else(|| input.clone());
            let concat_name = if level == 0 {
                "concatenate".to_string()
            } else {
                format!("concatenate_{}", level)
            };
            let merged = tracer.scoped(&concat_name, |t| concat(t, &[&upsampled, &skip], 1))?;
            x = conv_pair(tracer, pair, &merged)?;
        }

        let y = self.head.forward(tracer, &x)?;
        tracer.scoped("output_transpose", |t| transpose(t, &y, &NCHW_TO_NHWC))
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        for conv in self.convs() {
            conv.visit(prefix, visitor);
        }
        for (up, _) in &self.decoders {
            up.visit(prefix, visitor);
        }
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        for pair in &mut self.encoders {
            for conv in pair.iter_mut() {
                conv.visit_mut(prefix, visitor);
            }
        }
        for conv in self.bottleneck.iter_mut() {
            conv.visit_mut(prefix, visitor);
        }
        for (up, pair) in &mut self.decoders {
            up.visit_mut(prefix, visitor);
            for conv in pair.iter_mut() {
                conv.visit_mut(prefix, visitor);
            }
        }
        self.head.visit_mut(prefix, visitor);
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn is_training(&self) -> bool {
        self.mode == Mode::Train
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{fixed_dims, DataType};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_keras_layer_names() {
        let model = KerasUNetConfig::new(1, 1).init(&mut StdRng::seed_from_u64(0));
        let state = model.state_dict();

        assert_eq!(state["conv2d.kernel"].shape, vec![3, 3, 1, 16]);
        assert_eq!(state["conv2d_1.kernel"].shape, vec![3, 3, 16, 16]);
        assert_eq!(state["conv2d_transpose.kernel"].shape, vec![2, 2, 32, 64]);
        assert_eq!(state["conv2d_10.kernel"].shape, vec![1, 1, 16, 1]);
        assert_eq!(state.len(), 2 * (10 + 2 + 1));
    }

    #[test]
    fn test_keras_trace_is_channels_last() {
        let mut model = KerasUNetConfig::new(1, 1).init(&mut StdRng::seed_from_u64(0));
        model.eval();

        let mut tracer = Tracer::new();
        let x = tracer.input("input", fixed_dims(&[1, 16, 16, 1]), DataType::F32);
        let y = model.forward(&mut tracer, &x).unwrap();
        let ir = tracer.finish(&y, "output").unwrap();

        assert_eq!(ir.outputs[0].dims, fixed_dims(&[1, 16, 16, 1]));
        assert_eq!(ir.nodes.first().map(|n| n.op_type.as_str()), Some("Transpose"));
        let kernel_transposes = ir
            .nodes
            .iter()
            .filter(|n| n.op_type == "Transpose" && ir.weights.contains_key(&n.inputs[0]))
            .count();
        assert_eq!(kernel_transposes, 13);
    }

    #[test]
    fn test_keras_rejects_channels_first_input() {
        let model = KerasUNetConfig::new(1, 1).init(&mut StdRng::seed_from_u64(0));
        let mut tracer = Tracer::new();
        let x = tracer.input("input", fixed_dims(&[1, 1, 16, 16]), DataType::F32);
        assert!(model.forward(&mut tracer, &x).is_err());
    }
}
