//! Building blocks shared by the UNet variants.
//!
//! Each layer owns its parameters and, when traced, emits the ONNX operator
//! PyTorch would export for it in inference mode.

use crate::ir::{Attribute, Tensor};
use crate::model::init::Initializer;
use crate::model::{join, Mode, Module};
use crate::tracer::{TraceError, Tracer, Value};
use rand::Rng;

/// Configuration to create a [2D convolution](Conv2d) layer.
#[derive(Debug, Clone)]
pub struct Conv2dConfig {
    /// Input and output channels.
    pub channels: [usize; 2],
    pub kernel_size: [usize; 2],
    pub stride: [usize; 2],
    /// Zero padding applied on both sides of each spatial axis.
    pub padding: [usize; 2],
    pub bias: bool,
}

impl Conv2dConfig {
    pub fn new(channels: [usize; 2], kernel_size: [usize; 2]) -> Self {
        Self {
            channels,
            kernel_size,
            stride: [1, 1],
            padding: [0, 0],
            bias: true,
        }
    }

    pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: [usize; 2]) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Weight `[out, in, k0, k1]` and bias `[out]` are drawn from `U(-k, k)`
    /// with `k = sqrt(1 / (in * k0 * k1))`.
    pub fn init<R: Rng>(&self, rng: &mut R) -> Conv2d {
        let [channels_in, channels_out] = self.channels;
        let fan_in = channels_in * self.kernel_size[0] * self.kernel_size[1];
        let initializer = Initializer::NormalizedUniform { fan_in };
        let weight = initializer.init(
            "weight",
            vec![channels_out, channels_in, self.kernel_size[0], self.kernel_size[1]],
            rng,
        );
        let bias = self
            .bias
            .then(|| initializer.init("bias", vec![channels_out], rng));
        Conv2d {
            weight,
            bias,
            kernel_size: self.kernel_size,
            stride: self.stride,
            padding: self.padding,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conv2d {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
}

impl Module for Conv2d {
    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        let weight = tracer.parameter("weight", &self.weight);
        let bias = self.bias.as_ref().map(|b| tracer.parameter("bias", b));
        let mut inputs = vec![input, &weight];
        inputs.extend(bias.as_ref());
        tracer.op(
            "Conv",
            &inputs,
            vec![
                ("dilations", Attribute::Ints(vec![1, 1])),
                ("group", Attribute::Int(1)),
                ("kernel_shape", ints(&self.kernel_size)),
                ("pads", pads(&self.padding)),
                ("strides", ints(&self.stride)),
            ],
        )
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        visitor(&join(prefix, "weight"), &self.weight);
        if let Some(bias) = &self.bias {
            visitor(&join(prefix, "bias"), bias);
        }
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        visitor(&join(prefix, "weight"), &mut self.weight);
        if let Some(bias) = &mut self.bias {
            visitor(&join(prefix, "bias"), bias);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvTranspose2dConfig {
    pub channels: [usize; 2],
    pub kernel_size: [usize; 2],
    pub stride: [usize; 2],
}

impl ConvTranspose2dConfig {
    pub fn new(channels: [usize; 2], kernel_size: [usize; 2]) -> Self {
        Self {
            channels,
            kernel_size,
            stride: [1, 1],
        }
    }

    pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }

    /// Weight is `[in, out, k0, k1]`; the fan-in used for initialization is
    /// `out * k0 * k1`.
    pub fn init<R: Rng>(&self, rng: &mut R) -> ConvTranspose2d {
        let [channels_in, channels_out] = self.channels;
        let fan_in = channels_out * self.kernel_size[0] * self.kernel_size[1];
        let initializer = Initializer::NormalizedUniform { fan_in };
        ConvTranspose2d {
            weight: initializer.init(
                "weight",
                vec![channels_in, channels_out, self.kernel_size[0], self.kernel_size[1]],
                rng,
            ),
            bias: initializer.init("bias", vec![channels_out], rng),
            kernel_size: self.kernel_size,
            stride: self.stride,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    pub weight: Tensor,
    pub bias: Tensor,
    kernel_size: [usize; 2],
    stride: [usize; 2],
}

impl Module for ConvTranspose2d {
    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        let weight = tracer.parameter("weight", &self.weight);
        let bias = tracer.parameter("bias", &self.bias);
        tracer.op(
            "ConvTranspose",
            &[input, &weight, &bias],
            vec![
                ("dilations", Attribute::Ints(vec![1, 1])),
                ("group", Attribute::Int(1)),
                ("kernel_shape", ints(&self.kernel_size)),
                ("pads", Attribute::Ints(vec![0, 0, 0, 0])),
                ("strides", ints(&self.stride)),
            ],
        )
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        visitor(&join(prefix, "weight"), &self.weight);
        visitor(&join(prefix, "bias"), &self.bias);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        visitor(&join(prefix, "weight"), &mut self.weight);
        visitor(&join(prefix, "bias"), &mut self.bias);
    }
}

/// Batch normalization over the channel axis.
///
/// In inference mode the running statistics are used as constants. In
/// training mode the node is emitted with `training_mode = 1`, which only
/// exists from opset 14.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    epsilon: f32,
    momentum: f32,
    mode: Mode,
}

impl BatchNorm2d {
    pub fn new(channels: usize) -> Self {
        let shape = vec![channels];
        Self {
            gamma: Tensor::from_f32("weight", shape.clone(), &vec![1.0; channels]),
            beta: Tensor::from_f32("bias", shape.clone(), &vec![0.0; channels]),
            running_mean: Tensor::from_f32("running_mean", shape.clone(), &vec![0.0; channels]),
            running_var: Tensor::from_f32("running_var", shape, &vec![1.0; channels]),
            epsilon: 1e-5,
            momentum: 0.1,
            mode: Mode::Train,
        }
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        let gamma = tracer.parameter("weight", &self.gamma);
        let beta = tracer.parameter("bias", &self.beta);
        let mean = tracer.parameter("running_mean", &self.running_mean);
        let var = tracer.parameter("running_var", &self.running_var);
        let mut attributes = vec![
            ("epsilon", Attribute::Float(self.epsilon)),
            ("momentum", Attribute::Float(1.0 - self.momentum)),
        ];
        if self.mode == Mode::Train {
            attributes.push(("training_mode", Attribute::Int(1)));
        }
        tracer.op(
            "BatchNormalization",
            &[input, &gamma, &beta, &mean, &var],
            attributes,
        )
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        visitor(&join(prefix, "weight"), &self.gamma);
        visitor(&join(prefix, "bias"), &self.beta);
        visitor(&join(prefix, "running_mean"), &self.running_mean);
        visitor(&join(prefix, "running_var"), &self.running_var);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        visitor(&join(prefix, "weight"), &mut self.gamma);
        visitor(&join(prefix, "bias"), &mut self.beta);
        visitor(&join(prefix, "running_mean"), &mut self.running_mean);
        visitor(&join(prefix, "running_var"), &mut self.running_var);
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn is_training(&self) -> bool {
        self.mode == Mode::Train
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    kernel_size: usize,
    stride: usize,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize) -> Self {
        Self {
            kernel_size,
            stride: kernel_size,
        }
    }

    pub fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        tracer.op(
            "MaxPool",
            &[input],
            vec![
                ("kernel_shape", ints(&[self.kernel_size; 2])),
                ("pads", Attribute::Ints(vec![0, 0, 0, 0])),
                ("strides", ints(&[self.stride; 2])),
            ],
        )
    }
}

/// Bilinear upsampling, exported as `Resize` with constant scales.
#[derive(Debug, Clone, Copy)]
pub struct Upsample {
    scale_factor: f32,
    align_corners: bool,
}

impl Upsample {
    pub fn bilinear(scale_factor: f32, align_corners: bool) -> Self {
        Self {
            scale_factor,
            align_corners,
        }
    }

    pub fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        let roi = tracer.constant(Tensor::from_f32("roi", vec![0], &[]));
        let scales = tracer.constant(Tensor::from_f32(
            "scales",
            vec![4],
            &[1.0, 1.0, self.scale_factor, self.scale_factor],
        ));
        let transform = if self.align_corners {
            "align_corners"
        } else {
            "pytorch_half_pixel"
        };
        tracer.op(
            "Resize",
            &[input, &roi, &scales],
            vec![
                (
                    "coordinate_transformation_mode",
                    Attribute::String(transform.to_string()),
                ),
                ("cubic_coeff_a", Attribute::Float(-0.75)),
                ("mode", Attribute::String("linear".to_string())),
                ("nearest_mode", Attribute::String("floor".to_string())),
            ],
        )
    }
}

pub fn relu(tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
    tracer.op("Relu", &[input], vec![])
}

pub fn sigmoid(tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
    tracer.op("Sigmoid", &[input], vec![])
}

pub fn concat(tracer: &mut Tracer, inputs: &[&Value], axis: i64) -> Result<Value, TraceError> {
    tracer.op("Concat", inputs, vec![("axis", Attribute::Int(axis))])
}

pub fn transpose(tracer: &mut Tracer, input: &Value, perm: &[i64]) -> Result<Value, TraceError> {
    tracer.op("Transpose", &[input], vec![("perm", Attribute::Ints(perm.to_vec()))])
}

/// Constant zero padding. `pads` lists the begin amounts of every axis
/// followed by the end amounts.
pub fn pad(tracer: &mut Tracer, input: &Value, pads: &[i64]) -> Result<Value, TraceError> {
    let pads = tracer.constant(Tensor::from_i64("pads", vec![pads.len()], pads));
    tracer.op(
        "Pad",
        &[input, &pads],
        vec![("mode", Attribute::String("constant".to_string()))],
    )
}

fn ints(values: &[usize]) -> Attribute {
    Attribute::Ints(values.iter().map(|&v| v as i64).collect())
}

fn pads(padding: &[usize; 2]) -> Attribute {
    let [h, w] = padding.map(|p| p as i64);
    Attribute::Ints(vec![h, w, h, w])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{fixed_dims, DataType};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_conv_without_bias_has_two_inputs() {
        let conv = Conv2dConfig::new([3, 8], [3, 3])
            .with_padding([1, 1])
            .with_bias(false)
            .init(&mut StdRng::seed_from_u64(0));
        let mut tracer = Tracer::new();
        let x = tracer.input("input", fixed_dims(&[1, 3, 16, 16]), DataType::F32);

        let y = tracer.scoped("conv", |t| conv.forward(t, &x)).unwrap();
        let ir = tracer.finish(&y, "output").unwrap();

        assert_eq!(ir.nodes[0].inputs, vec!["input", "conv.weight"]);
        assert_eq!(ir.outputs[0].dims, fixed_dims(&[1, 8, 16, 16]));
        assert_eq!(conv.num_params(), 8 * 3 * 9);
    }

    #[test]
    fn test_batch_norm_mode_controls_training_attribute() {
        let mut norm = BatchNorm2d::new(4);
        let mut tracer = Tracer::new();
        let x = tracer.input("input", fixed_dims(&[1, 4, 2, 2]), DataType::F32);

        let training = norm.forward(&mut tracer, &x).unwrap();
        norm.eval();
        assert!(!norm.is_training());
        let inference = norm.forward(&mut tracer, &training).unwrap();
        let ir = tracer.finish(&inference, "output").unwrap();

        assert_eq!(ir.nodes[0].attr_int("training_mode"), Some(1));
        assert_eq!(ir.nodes[1].attr_int("training_mode"), None);
        assert!((ir.nodes[1].attr_float("momentum").unwrap() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_upsample_doubles_spatial() {
        let mut tracer = Tracer::new();
        let x = tracer.input("input", fixed_dims(&[1, 2, 5, 7]), DataType::F32);
        let y = Upsample::bilinear(2.0, true).forward(&mut tracer, &x).unwrap();
        assert_eq!(y.dims(), fixed_dims(&[1, 2, 10, 14]).as_slice());
    }

    #[test]
    fn test_pad_grows_spatial() {
        let mut tracer = Tracer::new();
        let x = tracer.input("input", fixed_dims(&[1, 2, 5, 7]), DataType::F32);
        let y = pad(&mut tracer, &x, &[0, 0, 0, 1, 0, 0, 1, 0]).unwrap();
        assert_eq!(y.dims(), fixed_dims(&[1, 2, 6, 8]).as_slice());
    }

    #[test]
    fn test_conv_transpose_weight_layout() {
        let up = ConvTranspose2dConfig::new([16, 8], [2, 2])
            .with_stride([2, 2])
            .init(&mut StdRng::seed_from_u64(0));
        assert_eq!(up.weight.shape, vec![16, 8, 2, 2]);
        assert_eq!(up.bias.shape, vec![8]);
    }
}
