use chart_deplot::{
    cli::Cli,
    error::Result,
    parse_config::{Accelerator, RunConfig},
    training,
};
use clap::Parser;

#[cfg(feature = "tch")]
mod backend {
    use burn::backend::{libtorch::LibTorchDevice, Autodiff, LibTorch};

    use super::*;

    pub type Backend = Autodiff<LibTorch>;

    pub fn devices(config: &RunConfig) -> Vec<LibTorchDevice> {
        match config.accelerator {
            Accelerator::Gpu => (0..config.devices).map(LibTorchDevice::Cuda).collect(),
            Accelerator::Cpu => vec![LibTorchDevice::Cpu],
        }
    }
}

#[cfg(all(feature = "wgpu", not(feature = "tch")))]
mod backend {
    use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};

    use super::*;

    pub type Backend = Autodiff<Wgpu>;

    pub fn devices(config: &RunConfig) -> Vec<WgpuDevice> {
        match config.accelerator {
            Accelerator::Gpu => (0..config.devices).map(WgpuDevice::DiscreteGpu).collect(),
            Accelerator::Cpu => vec![WgpuDevice::Cpu],
        }
    }
}

#[cfg(not(any(feature = "tch", feature = "wgpu")))]
mod backend {
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};

    use super::*;

    pub type Backend = Autodiff<NdArray>;

    pub fn devices(config: &RunConfig) -> Vec<NdArrayDevice> {
        if config.accelerator == Accelerator::Gpu {
            tracing::warn!("the ndarray backend only runs on the cpu");
        }
        vec![NdArrayDevice::Cpu]
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chart_deplot=info")),
        )
        .init();

    let config = Cli::parse().load_config()?.with_resolved_run_name();
    tracing::info!("starting run {}", config.run_name());

    let devices = backend::devices(&config);
    if let Some(path) = training::train::<backend::Backend>(&config, devices)? {
        tracing::info!("run {} finished, model at {}", config.run_name(), path.display());
    }

    Ok(())
}
