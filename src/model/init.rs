use crate::ir::Tensor;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};

/// How a parameter tensor is filled when a model is built.
#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    Ones,
    Zeros,
    /// Values drawn uniformly between the two bounds
    Uniform(f32, f32),
    /// Values drawn uniformly between -sqrt(1/fan_in) and sqrt(1/fan_in),
    /// the default for convolution weights and biases.
    NormalizedUniform { fan_in: usize },
    /// Glorot uniform, the default for Keras kernels.
    XavierUniform { fan_in: usize, fan_out: usize },
}

impl Initializer {
    pub fn init<R: Rng>(&self, name: &str, shape: Vec<usize>, rng: &mut R) -> Tensor {
        let numel: usize = shape.iter().product();
        let values = match self {
            Self::Ones => vec![1.0; numel],
            Self::Zeros => vec![0.0; numel],
            Self::Uniform(low, high) => uniform(rng, *low, *high, numel),
            Self::NormalizedUniform { fan_in } => {
                let k = (1.0 / (*fan_in).max(1) as f64).sqrt() as f32;
                uniform(rng, -k, k, numel)
            }
            Self::XavierUniform { fan_in, fan_out } => {
                let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt() as f32;
                uniform(rng, -limit, limit, numel)
            }
        };
        Tensor::from_f32(name, shape, &values)
    }
}

fn uniform<R: Rng>(rng: &mut R, low: f32, high: f32, numel: usize) -> Vec<f32> {
    if low >= high {
        return vec![low; numel];
    }
    let distribution = Uniform::new(low, high);
    (0..numel).map(|_| distribution.sample(&mut *rng)).collect()
}

/// Placeholder input for tracing: standard normal values in the given shape.
pub fn randn<R: Rng>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || StandardNormal.sample(&mut *rng))
}
