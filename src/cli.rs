use crate::config::ExportJob;
use clap::Parser;
use std::path::PathBuf;

/// Command-line overrides shared by the converter binaries.
#[derive(Parser, Debug)]
#[command(version)]
pub struct ExportArgs {
    /// Where to write the ONNX model (defaults to the preset's file name)
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Safetensors file with trained parameters, matched by name
    #[arg(long, short)]
    pub weights: Option<PathBuf>,

    /// Seed for parameter initialization and the dummy input
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Increase log verbosity when RUST_LOG is not set
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl ExportArgs {
    pub fn apply(self, mut job: ExportJob) -> ExportJob {
        if let Some(output) = self.output {
            job = job.with_output(output);
        }
        if let Some(weights) = self.weights {
            job = job.with_weights(weights);
        }
        job.with_seed(self.seed)
    }
}

fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "unetonnx=info",
        _ => "unetonnx=debug",
    }
}

/// Logs go to stderr, filtered by `RUST_LOG`, `warn` by default. Call once,
/// at the start of `main`.
pub fn init_logger(verbose: u8) {
    let env = env_logger::Env::default()
        .filter_or(env_logger::DEFAULT_FILTER_ENV, default_filter(verbose));
    env_logger::Builder::from_env(env).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_preset() {
        let args = ExportArgs::parse_from([
            "convert-unet",
            "--output",
            "out/model.onnx",
            "--seed",
            "3",
            "-vv",
        ]);
        assert_eq!(args.verbose, 2);

        let job = args.apply(ExportJob::unet());
        assert_eq!(job.output, PathBuf::from("out/model.onnx"));
        assert_eq!(job.seed, 3);
        assert!(job.weights.is_none());
    }

    #[test]
    fn test_verbosity_filters() {
        assert_eq!(default_filter(0), "warn");
        assert_eq!(default_filter(1), "unetonnx=info");
        assert_eq!(default_filter(2), "unetonnx=debug");
        assert_eq!(default_filter(5), "unetonnx=debug");
    }

    #[test]
    fn test_no_args_keeps_preset() {
        let job = ExportArgs::parse_from(["convert-unet-features"]).apply(ExportJob::unet_features());
        assert_eq!(job.output, PathBuf::from("unet.onnx"));
        assert_eq!(job.seed, 0);
    }
}
