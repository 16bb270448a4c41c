use crate::ir::Tensor;
use crate::model::layers::{
    concat, relu, sigmoid, BatchNorm2d, Conv2d, Conv2dConfig, ConvTranspose2d,
    ConvTranspose2dConfig, MaxPool2d,
};
use crate::model::{join, Mode, Module};
use crate::tracer::{TraceError, Tracer, Value};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct UNetFeaturesConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub init_features: usize,
}

impl UNetFeaturesConfig {
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            init_features: 32,
        }
    }

    pub fn with_init_features(mut self, init_features: usize) -> Self {
        self.init_features = init_features;
        self
    }

    pub fn init<R: Rng>(&self, rng: &mut R) -> UNetFeatures {
        let f = self.init_features;
        let encoders = [
            Block::new("enc1", self.in_channels, f, rng),
            Block::new("enc2", f, f * 2, rng),
            Block::new("enc3", f * 2, f * 4, rng),
            Block::new("enc4", f * 4, f * 8, rng),
        ];
        let bottleneck = Block::new("bottleneck", f * 8, f * 16, rng);
        let mut decoders = Vec::with_capacity(4);
        for level in (1..=4).rev() {
            let width = f << (level - 1);
            let upconv = ConvTranspose2dConfig::new([width * 2, width], [2, 2])
                .with_stride([2, 2])
                .init(rng);
            let block = Block::new(&format!("dec{}", level), width * 2, width, rng);
            decoders.push((upconv, block));
        }
        UNetFeatures {
            encoders,
            pool: MaxPool2d::new(2),
            bottleneck,
            decoders,
            conv: Conv2dConfig::new([f, self.out_channels], [1, 1]).init(rng),
            mode: Mode::Train,
        }
    }
}

/// `{name}conv1, {name}norm1, {name}relu1, {name}conv2, {name}norm2, {name}relu2`
#[derive(Debug, Clone)]
struct Block {
    name: String,
    conv1: Conv2d,
    norm1: BatchNorm2d,
    conv2: Conv2d,
    norm2: BatchNorm2d,
}

impl Block {
    fn new<R: Rng>(name: &str, channels_in: usize, features: usize, rng: &mut R) -> Self {
        let conv = |c_in, rng: &mut R| {
            Conv2dConfig::new([c_in, features], [3, 3])
                .with_padding([1, 1])
                .with_bias(false)
                .init(rng)
        };
        Self {
            name: name.to_string(),
            conv1: conv(channels_in, rng),
            norm1: BatchNorm2d::new(features),
            conv2: conv(features, rng),
            norm2: BatchNorm2d::new(features),
        }
    }

    fn layer(&self, suffix: &str) -> String {
        format!("{}{}", self.name, suffix)
    }
}

impl Module for Block {
    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        let x = tracer.scoped(&self.layer("conv1"), |t| self.conv1.forward(t, input))?;
        let x = tracer.scoped(&self.layer("norm1"), |t| self.norm1.forward(t, &x))?;
        let x = tracer.scoped(&self.layer("relu1"), |t| relu(t, &x))?;
        let x = tracer.scoped(&self.layer("conv2"), |t| self.conv2.forward(t, &x))?;
        let x = tracer.scoped(&self.layer("norm2"), |t| self.norm2.forward(t, &x))?;
        tracer.scoped(&self.layer("relu2"), |t| relu(t, &x))
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        self.conv1.visit_parameters(&join(prefix, &self.layer("conv1")), visitor);
        self.norm1.visit_parameters(&join(prefix, &self.layer("norm1")), visitor);
        self.conv2.visit_parameters(&join(prefix, &self.layer("conv2")), visitor);
        self.norm2.visit_parameters(&join(prefix, &self.layer("norm2")), visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        let names = [
            self.layer("conv1"),
            self.layer("norm1"),
            self.layer("conv2"),
            self.layer("norm2"),
        ];
        self.conv1.visit_parameters_mut(&join(prefix, &names[0]), visitor);
        self.norm1.visit_parameters_mut(&join(prefix, &names[1]), visitor);
        self.conv2.visit_parameters_mut(&join(prefix, &names[2]), visitor);
        self.norm2.visit_parameters_mut(&join(prefix, &names[3]), visitor);
    }

    fn set_mode(&mut self, mode: Mode) {
        self.norm1.set_mode(mode);
        self.norm2.set_mode(mode);
    }
}

/// UNet with a configurable base width (`init_features`), transposed-conv
/// upsampling and a sigmoid head producing per-pixel probabilities.
#[derive(Debug, Clone)]
pub struct UNetFeatures {
    encoders: [Block; 4],
    pool: MaxPool2d,
    bottleneck: Block,
    /// Ordered from the deepest level (`upconv4`, `decoder4`) up.
    decoders: Vec<(ConvTranspose2d, Block)>,
    conv: Conv2d,
    mode: Mode,
}

impl Module for UNetFeatures {
    fn forward(&self, tracer: &mut Tracer, input: &Value) -> Result<Value, TraceError> {
        let mut skips = Vec::with_capacity(self.encoders.len());
        let mut x = input.clone();
        for (i, encoder) in self.encoders.iter().enumerate() {
            let level = i + 1;
            let encoded = tracer.scoped(&format!("encoder{}", level), |t| encoder.forward(t, &x))?;
            x = tracer.scoped(&format!("pool{}", level), |t| self.pool.forward(t, &encoded))?;
            skips.push(encoded);
        }
        x = tracer.scoped("bottleneck", |t| self.bottleneck.forward(t, &x))?;

        for (i, (upconv, decoder)) in self.decoders.iter().enumerate() {
            let level = self.decoders.len() - i;
            let up = tracer.scoped(&format!("upconv{}", level), |t| upconv.forward(t, &x))?;
            let skip = skips.pop().unwrap_or_else(|| input.clone());
            let merged = concat(tracer, &[&up, &skip], 1)?;
            x = tracer.scoped(&format!("decoder{}", level), |t| decoder.forward(t, &merged))?;
        }

        let logits = tracer.scoped("conv", |t| self.conv.forward(t, &x))?;
        sigmoid(tracer, &logits)
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut dyn FnMut(&str, &Tensor)) {
        for (i, encoder) in self.encoders.iter().enumerate() {
            encoder.visit_parameters(&join(prefix, &format!("encoder{}", i + 1)), visitor);
        }
        self.bottleneck.visit_parameters(&join(prefix, "bottleneck"), visitor);
        let levels = self.decoders.len();
        for (i, (upconv, decoder)) in self.decoders.iter().enumerate() {
            let level = levels - i;
            upconv.visit_parameters(&join(prefix, &format!("upconv{}", level)), visitor);
            decoder.visit_parameters(&join(prefix, &format!("decoder{}", level)), visitor);
        }
        self.conv.visit_parameters(&join(prefix, "conv"), visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut dyn FnMut(&str, &mut Tensor)) {
        for (i, encoder) in self.encoders.iter_mut().enumerate() {
            encoder.visit_parameters_mut(&join(prefix, &format!("encoder{}", i + 1)), visitor);
        }
        self.bottleneck.visit_parameters_mut(&join(prefix, "bottleneck"), visitor);
        let levels = self.decoders.len();
        for (i, (upconv, decoder)) in self.decoders.iter_mut().enumerate() {
            let level = levels - i;
            upconv.visit_parameters_mut(&join(prefix, &format!("upconv{}", level)), visitor);
            decoder.visit_parameters_mut(&join(prefix, &format!("decoder{}", level)), visitor);
        }
        self.conv.visit_parameters_mut(&join(prefix, "conv"), visitor);
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        for encoder in &mut self.encoders {
            encoder.set_mode(mode);
        }
        self.bottleneck.set_mode(mode);
        for (_, decoder) in &mut self.decoders {
            decoder.set_mode(mode);
        }
    }

    fn is_training(&self) -> bool {
        self.mode == Mode::Train
    }
}
