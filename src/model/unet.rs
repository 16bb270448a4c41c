use crate::ir::{Dim, Tensor};
use crate::model::layers::{
    concat, pad, relu, BatchNorm2d, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    MaxPool2d, Upsample,
};
use crate::model::{join, Mode, Module};
use crate::tracer::{TraceError, Tracer, Value};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct UNetConfig {
    pub n_channels: usize,
    pub n_classes: usize,
    /// Upsample with bilinear interpolation instead of transposed convolutions.
    pub bilinear: bool,
    /// Width of the first stage; each of the four downsampling stages doubles it.
    pub base_features: usize,
}

impl UNetConfig {
    pub fn new(n_channels: usize, n_classes: usize) -> Self {
        Self {
            n_channels,
            n_classes,
            bilinear: false,
            base_features: 64,
        }
    }

    pub fn with_bilinear(mut self, bilinear: bool) -> Self {
        self.bilinear = bilinear;
        self
    }

    pub fn with_base_features(mut self, base_features: usize) -> Self {
        self.base_features = base_features;
        self
    }

    pub fn init<R: Rng>(&self, rng: &mut R) -> UNet {
        let f = self.base_features;
        let factor = if self.bilinear { 2 } else { 1 };
        UNet {
            inc: DoubleConv::new(self.n_channels, f, None, rng),
            down1: Down::new(f, f * 2, rng),
            down2: Down::new(f * 2, f * 4, rng),
            down3: Down::new(f * 4, f * 8, rng),
            down4: Down::new(f * 8, f * 16 / factor, rng),
            up1: Up::new(f * 16, f * 8 / factor, self.bilinear, rng),
            up2: Up::new(f * 8, f * 4 / factor, self.bilinear, rng),
            up3: Up::new(f * 4, f * 2 / factor, self.bilinear, rng),
            up4: Up::new(f * 2, f, self.bilinear, rng),
            outc: Conv2dConfig::new([f, self.n_classes], [1, 1]).init(rng),
            mode: Mode::Train,
        }
    }
}

/// (3x3 convolution, batch norm, ReLU) twice.
#[derive(Debug, Clone)]
pub struct DoubleConv {
    conv1: Conv2d,
    norm1: BatchNorm2d,
    conv2: Conv2d,
    norm2: BatchNorm2d,
}

impl DoubleConv {
    pub fn new<R: Rng>(
        channels_in: usize,
        channels_out: usize,
        channels_mid: Option<usize>,
        rng: &mut R,
    ) -> Self {
        let mid = channels_mid.unwrap_or(channels_out);
        let conv = |c_in, c_out, rng: &mut R| {
            Conv2dConfig::new([c_in, c_out], [3, 3])
                .with_padding([1, 1])
                .with_bias(false)
                .init(rng)
        };
        Self {
            conv1: conv(channels_in, mid, rng),
            norm1: BatchNorm2d::new(mid),
            conv2: conv(mid, channels_out, rng),
            norm2: BatchNorm2d::new(channels_out),
        }
    }
}

impl Module for DoubleConv {
    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        let x = tracer.scoped("double_conv.0", |t| self.conv1.forward(t, input))?;
        let x = tracer.scoped("double_conv.1", |t| self.norm1.forward(t, &x))?;
        let x = tracer.scoped("double_conv.2", |t| relu(t, &x))?;
        let x = tracer.scoped("double_conv.3", |t| self.conv2.forward(t, &x))?;
        let x = tracer.scoped("double_conv.4", |t| self.norm2.forward(t, &x))?;
        tracer.scoped("double_conv.5", |t| relu(t, &x))
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        self.conv1.visit_parameters(&join(prefix, "double_conv.0"), visitor);
        self.norm1.visit_parameters(&join(prefix, "double_conv.1"), visitor);
        self.conv2.visit_parameters(&join(prefix, "double_conv.3"), visitor);
        self.norm2.visit_parameters(&join(prefix, "double_conv.4"), visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        self.conv1.visit_parameters_mut(&join(prefix, "double_conv.0"), visitor);
        self.norm1.visit_parameters_mut(&join(prefix, "double_conv.1"), visitor);
        self.conv2.visit_parameters_mut(&join(prefix, "double_conv.3"), visitor);
        self.norm2.visit_parameters_mut(&join(prefix, "double_conv.4"), visitor);
    }

    fn set_mode(&mut self, mode: Mode) {
        self.norm1.set_mode(mode);
        self.norm2.set_mode(mode);
    }

    fn is_training(&self) -> bool {
        self.norm1.is_training()
    }
}

/// Max-pool by two, then double convolution.
#[derive(Debug, Clone)]
pub struct Down {
    pool: MaxPool2d,
    conv: DoubleConv,
}

impl Down {
    fn new<R: Rng>(channels_in: usize, channels_out: usize, rng: &mut R) -> Self {
        Self {
            pool: MaxPool2d::new(2),
            conv: DoubleConv::new(channels_in, channels_out, None, rng),
        }
    }
}

impl Module for Down {
    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        let x = tracer.scoped("maxpool_conv.0", |t| self.pool.forward(t, input))?;
        tracer.scoped("maxpool_conv.1", |t| self.conv.forward(t, &x))
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        self.conv.visit_parameters(&join(prefix, "maxpool_conv.1"), visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        self.conv.visit_parameters_mut(&join(prefix, "maxpool_conv.1"), visitor);
    }

    fn set_mode(&mut self, mode: Mode) {
        self.conv.set_mode(mode);
    }
}

#[derive(Debug, Clone)]
enum Upsampling {
    Bilinear(Upsample),
    Transposed(ConvTranspose2d),
}

/// Upsample, pad to the skip connection's size, concatenate, double conv.
#[derive(Debug, Clone)]
pub struct Up {
    up: Upsampling,
    conv: DoubleConv,
}

impl Up {
    fn new<R: Rng>(channels_in: usize, channels_out: usize, bilinear: bool, rng: &mut R) -> Self {
        if bilinear {
            Self {
                up: Upsampling::Bilinear(Upsample::bilinear(2.0, true)),
                conv: DoubleConv::new(channels_in, channels_out, Some(channels_in / 2), rng),
            }
        } else {
            let up = ConvTranspose2dConfig::new([channels_in, channels_in / 2], [2, 2])
                .with_stride([2, 2])
                .init(rng);
            Self {
                up: Upsampling::Transposed(up),
                conv: DoubleConv::new(channels_in, channels_out, None, rng),
            }
        }
    }

    pub fn forward(
        &self,
        tracer: &mut Tracer,
        x1: &Value,
        x2: &Value,
    ) -> Result<Value, TraceError> {
        let x1 = tracer.scoped("up", |t| match &self.up {
            Upsampling::Bilinear(up) => up.forward(t, x1),
            Upsampling::Transposed(up) => up.forward(t, x1),
        })?;

        let diff_y = size_difference(x2.dim(2), x1.dim(2));
        let diff_x = size_difference(x2.dim(3), x1.dim(3));
        let x1 = if diff_y != 0 || diff_x != 0 {
            pad(
                tracer,
                &x1,
                &[0, 0, diff_y / 2, diff_x / 2, 0, 0, diff_y - diff_y / 2, diff_x - diff_x / 2],
            )?
        } else {
            x1
        };

        let x = concat(tracer, &[x2, &x1], 1)?;
        tracer.scoped("conv", |t| self.conv.forward(t, &x))
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        if let Upsampling::Transposed(up) = &self.up {
            up.visit_parameters(&join(prefix, "up"), visitor);
        }
        self.conv.visit_parameters(&join(prefix, "conv"), visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        if let Upsampling::Transposed(up) = &mut self.up {
            up.visit_parameters_mut(&join(prefix, "up"), visitor);
        }
        self.conv.visit_parameters_mut(&join(prefix, "conv"), visitor);
    }

    fn set_mode(&mut self, mode: Mode) {
        self.conv.set_mode(mode);
    }
}

fn size_difference(target: Option<&Dim>, actual: Option<&Dim>) -> i64 {
    match (target.and_then(Dim::fixed), actual.and_then(Dim::fixed)) {
        (Some(t), Some(a)) => t as i64 - a as i64,
        _ => 0,
    }
}

/// Encoder/decoder segmentation network with four resolution levels and
/// skip connections between matching levels. Outputs raw logits.
#[derive(Debug, Clone)]
pub struct UNet {
    inc: DoubleConv,
    down1: Down,
    down2: Down,
    down3: Down,
    down4: Down,
    up1: Up,
    up2: Up,
    up3: Up,
    up4: Up,
    outc: Conv2d,
    mode: Mode,
}

impl UNet {
    fn downs(&self) -> [(&'static str, &Down); 4] {
        [
            ("down1", &self.down1),
            ("down2", &self.down2),
            ("down3", &self.down3),
            ("down4", &self.down4),
        ]
    }

    fn ups(&self) -> [(&'static str, &Up); 4] {
        [
            ("up1", &self.up1),
            ("up2", &self.up2),
            ("up3", &self.up3),
            ("up4", &self.up4),
        ]
    }
}

impl Module for UNet {
    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        let mut skips = vec![tracer.scoped("inc", |t| self.inc.forward(t, input))?];
        for (name, down) in self.downs() {
            let x = skips.last().cloned().unwrap_or_else(|| input.clone());
            skips.push(tracer.scoped(name, |t| down.forward(t, &x))?);
        }

        let mut x = skips.pop().unwrap_or_else(|| input.clone());
        for (name, up) in self.ups() {
            let skip = skips.pop().unwrap_or_else(|| input.clone());
            x = tracer.scoped(name, |t| up.forward(t, &x, &skip))?;
        }

        tracer.scoped("outc", |t| t.scoped("conv", |t| self.outc.forward(t, &x)))
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        self.inc.visit_parameters(&join(prefix, "inc"), visitor);
        for (name, down) in self.downs() {
            down.visit_parameters(&join(prefix, name), visitor);
        }
        for (name, up) in self.ups() {
            up.visit_parameters(&join(prefix, name), visitor);
        }
        self.outc.visit_parameters(&join(prefix, "outc.conv"), visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        self.inc.visit_parameters_mut(&join(prefix, "inc"), visitor);
        for (name, down) in [
            ("down1", &mut self.down1),
            ("down2", &mut self.down2),
            ("down3", &mut self.down3),
            ("down4", &mut self.down4),
        ] {
            down.visit_parameters_mut(&join(prefix, name), visitor);
        }
        for (name, up) in [
            ("up1", &mut self.up1),
            ("up2", &mut self.up2),
            ("up3", &mut self.up3),
            ("up4", &mut self.up4),
        ] {
            up.visit_parameters_mut(&join(prefix, name), visitor);
        }
        self.outc.visit_parameters_mut(&join(prefix, "outc.conv"), visitor);
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.inc.set_mode(mode);
        for down in [&mut self.down1, &mut self.down2, &mut self.down3, &mut self.down4] {
            down.set_mode(mode);
        }
        for up in [&mut self.up1, &mut self.up2, &mut self.up3, &mut self.up4] {
            up.set_mode(mode);
        }
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

    fn trace(model: &UNet, dims: Vec<Dim>) -> Result<crate::ir::ModelIR, TraceError> {
        let mut tracer = Tracer::new();
        let x = tracer.input("input", dims, DataType::F32);
        let y = model.forward(&mut tracer, &x)?;
        tracer.finish(&y, "output")
    }

    #[test]
    fn test_unet_parameter_names() {
        let model = UNetConfig::new(3, 2)
            .with_base_features(4)
            .init(&mut StdRng::seed_from_u64(0));
        let state = model.state_dict();

        assert!(state.contains_key("inc.double_conv.0.weight"));
        assert!(state.contains_key("inc.double_conv.1.running_var"));
        assert!(state.contains_key("down4.maxpool_conv.1.double_conv.3.weight"));
        assert!(state.contains_key("up1.up.weight"));
        assert!(state.contains_key("up4.conv.double_conv.4.bias"));
        assert_eq!(state["outc.conv.weight"].shape, vec![2, 4, 1, 1]);
    }

    #[test]
    fn test_unet_trace_preserves_resolution() {
        let mut model = UNetConfig::new(3, 1)
            .with_base_features(4)
            .init(&mut StdRng::seed_from_u64(0));
        model.eval();
        let mut dims = vec![Dim::Param("batch_size".to_string())];
        dims.extend(fixed_dims(&[3, 64, 64]));

        let ir = trace(&model, dims).unwrap();

        let mut expected = vec![Dim::Param("batch_size".to_string())];
        expected.extend(fixed_dims(&[1, 64, 64]));
        assert_eq!(ir.outputs[0].dims, expected);
        assert!(ir.nodes.iter().all(|n| n.attr_int("training_mode").is_none()));
        assert_eq!(
            ir.nodes.iter().filter(|n| n.op_type == "ConvTranspose").count(),
            4
        );
    }

    #[test]
    fn test_unet_bilinear_pads_odd_sizes() {
        let mut model = UNetConfig::new(1, 1)
            .with_bilinear(true)
            .with_base_features(4)
            .init(&mut StdRng::seed_from_u64(0));
        model.eval();

        let ir = trace(&model, fixed_dims(&[1, 1, 36, 36])).unwrap();

        assert_eq!(ir.outputs[0].dims, fixed_dims(&[1, 1, 36, 36]));
        assert!(ir.nodes.iter().any(|n| n.op_type == "Resize"));
        assert!(ir.nodes.iter().any(|n| n.op_type == "Pad"));
    }

    #[test]
    fn test_unet_rejects_wrong_channel_count() {
        let model = UNetConfig::new(3, 1)
            .with_base_features(4)
            .init(&mut StdRng::seed_from_u64(0));
        assert!(trace(&model, fixed_dims(&[1, 1, 32, 32])).is_err());
    }

    #[test]
    fn test_unet_mode_propagates() {
        let mut model = UNetConfig::new(3, 1)
            .with_base_features(4)
            .init(&mut StdRng::seed_from_u64(0));
        assert!(model.is_training());
        model.eval();
        assert!(!model.is_training());
        assert!(!model.up3.conv.norm2.is_training());
    }
}
