use anyhow::Result;
use clap::Parser;
use unetonnx::cli::{init_logger, ExportArgs};
use unetonnx::config::ExportJob;

fn main() -> Result<()> {
    let args = ExportArgs::parse();
    init_logger(args.verbose);

    let report = args.apply(ExportJob::unet_features()).run()?;
    println!("UNet successfully exported to {}", report.path.display());
    Ok(())
}
