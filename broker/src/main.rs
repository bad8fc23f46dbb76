// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

use monado_broker::broker::Broker;
use monado_broker::config::Config;
use monado_broker::gpu_wait::ImmediateGpuWaiter;
use monado_broker::native::InMemoryResourceBackend;

mod stub_compositor;

#[derive(Debug, Parser)]
#[command(name = "brokerd")]
#[command(about = "The Monado multi-client compositor broker", long_about = None)]
struct Cli {
    /// Print the version.
    #[arg(short, long)]
    version: bool,
    /// The path to a config file. If unset, built-in defaults are used.
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    if args.version {
        println!("brokerd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_logging()?;

    let cfg = Config::load(args.config.as_deref()).context("failed to read config")?;
    debug!(?cfg, "starting up");

    #[cfg(feature = "tracy")]
    tracing::warn!("tracing enabled!");

    let clock = Arc::new(monado_broker::precise_sleep::SystemClock);
    let resources = Arc::new(InMemoryResourceBackend::new(90.0));
    let broker = Arc::new(Broker::new(cfg, clock, Arc::new(ImmediateGpuWaiter), resources));

    let shutdown = Arc::new(AtomicBool::new(false));
    let ctrlc_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        debug!("received SIGINT");
        ctrlc_shutdown.store(true, Ordering::Relaxed);
    })?;

    let mut native = stub_compositor::StubNativeCompositor::new();

    info!("broker starting");
    broker.run(&mut native, &shutdown);
    info!("broker stopped");

    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let tracy = if cfg!(feature = "tracy") {
        Some(tracing_tracy::TracyLayer::default().with_filter(EnvFilter::new("monado_broker=trace")))
    } else {
        None
    };

    let printed_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive("monado_broker=info".parse()?)
            .from_env_lossy(),
    );

    tracing_subscriber::registry()
        .with(tracy)
        .with(printed_log)
        .init();

    Ok(())
}
