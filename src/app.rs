// src/app.rs
//
// CLI surface and pipeline wiring: probe the source when no dimensions
// are given, build the manager with the selected module, hook SIGINT to
// the shutdown handle, and run to completion on this thread.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use framepipe_media::{probe, PipelineManager, PipelineOptions};

use crate::modules::{self, ModuleOptions};

#[derive(Debug, Parser)]
#[command(name = "framepipe", about = "Per-frame video stream transformer")]
pub struct Cli {
    /// Input URI: a file path, device, or rtsp:// stream.
    pub source: String,

    /// Output URI: a container file or another rtsp:// endpoint.
    pub destination: String,

    /// Container format of the destination (e.g. mp4, rtsp, hls).
    /// Derived from the destination when omitted.
    #[arg(long)]
    pub format: Option<String>,

    /// Frame module applied to the stream.
    #[arg(long, default_value = "identity")]
    pub module: String,

    /// Extra arguments handed to the module.
    #[arg(long = "module-arg")]
    pub module_args: Vec<String>,

    /// Construct the module with no shared state.
    #[arg(long)]
    pub isolate: bool,

    /// Frame width; probed from the source when omitted.
    #[arg(long)]
    pub width: Option<usize>,

    /// Frame height; probed from the source when omitted.
    #[arg(long)]
    pub height: Option<usize>,

    /// Output frame rate.
    #[arg(long, default_value_t = 24)]
    pub fps: i32,

    /// Capacity of the receiver and sender frame queues.
    #[arg(long, default_value_t = 8)]
    pub queue_size: usize,

    /// Wait for the module on every frame instead of sampling.
    #[arg(long)]
    pub synchronize: bool,

    /// Seconds to wait for each worker during shutdown.
    #[arg(long, default_value_t = 8.0)]
    pub join_timeout: f64,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let (width, height) = match (cli.width, cli.height) {
        (Some(w), Some(h)) => (w, h),
        _ => {
            let (w, h) = probe::source_dimensions(&cli.source)
                .with_context(|| format!("probing '{}'", cli.source))?;
            (w as usize, h as usize)
        }
    };
    info!(width, height, "frame shape");

    let callbacks = modules::create(&ModuleOptions {
        name:    cli.module.clone(),
        args:    cli.module_args.clone(),
        isolate: cli.isolate,
    })?;
    info!(module = %cli.module, "module initialized");

    let mut opts = PipelineOptions::new(cli.source.clone(), cli.destination.clone(), width, height);
    opts.file_format = cli.format.clone();
    opts.synchronize = cli.synchronize;
    opts.queue_size = cli.queue_size;
    opts.join_timeout = Duration::from_secs_f64(cli.join_timeout);
    opts.frame_rate = cli.fps;

    let mut manager = PipelineManager::new(opts, callbacks)?;

    let shutdown = manager.shutdown_handle();
    ctrlc::set_handler(move || {
        warn!("interrupt received; shutting down");
        shutdown.shutdown();
    })
    .context("installing the interrupt handler")?;

    manager.run_until_complete()?;
    info!("pipeline finished");
    Ok(())
}
