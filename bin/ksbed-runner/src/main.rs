// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;

use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8Path;
use clap::Parser;
use config::{Command, KickstartOptions, ProbeOptions, ProcessArgs, RunOptions};
use ksbed::config::{read_public_key, RunConfig, RunInputs, Settings};
use ksbed::customize::CustomizedImage;
use ksbed::host::SystemRunner;
use ksbed::kickstart::{CustomizationPatch, GuestAccounts};
use ksbed::readiness::{
    ReadinessPolicy, ReadinessProbe, ReadinessResult, SshTarget,
};
use ksbed::{platform, Pipeline, PipelineError, PipelineReport, ProvisionError, Stage};
use tracing::{debug, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

#[tokio::main]
async fn main() {
    let runner_args = ProcessArgs::parse();
    set_tracing_subscriber(&runner_args);
    debug!(?runner_args);

    let result = match &runner_args.command {
        Command::Run(opts) => run(opts).await,
        Command::Probe(opts) => probe(opts).await,
        Command::Kickstart(opts) => kickstart(opts),
        Command::Platforms => {
            list_platforms();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn preflight(error: ProvisionError) -> PipelineError {
    PipelineError { stage: Stage::Preflight, error }
}

/// Loads the settings file, if one was given. A file that cannot be read or
/// parsed fails the run before any stage starts.
fn load_settings(path: Option<&Utf8Path>) -> Result<Settings, PipelineError> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    Settings::from_toml_path(path).map_err(|e| {
        preflight(ProvisionError::InvalidConfiguration(format!("{e:#}")))
    })
}

async fn run(opts: &RunOptions) -> anyhow::Result<()> {
    let settings = load_settings(opts.config.as_deref())?;
    let inputs = RunInputs {
        os: opts.os.clone(),
        compose: opts.compose.clone(),
        download_node: opts.download_node.clone(),
        arch: opts.arch.clone(),
        ssh_key: opts.ssh_key.clone(),
        guest_address: opts.guest_address,
    };

    // Configuration problems are reported the same way as stage failures.
    let config = RunConfig::build(inputs, settings).map_err(preflight)?;
    info!(
        os = %config.os,
        vm = config.guest.name,
        image = %config.image_path(),
        "configuration validated"
    );

    let runner = SystemRunner;
    let report = Pipeline::new(&runner, &config).run().await?;
    print_report(&report);
    Ok(())
}

fn customized_summary(image: &CustomizedImage) -> String {
    match &image.descriptor {
        Some(descriptor) => {
            format!("{} (created, extends {descriptor})", image.path)
        }
        None if image.reused => format!("{} (reused)", image.path),
        None => format!("{} (created)", image.path),
    }
}

fn print_report(report: &PipelineReport) {
    println!("guest {} is ready at {}", report.vm_name, report.address);
    println!(
        "    installation image: {} ({})",
        report.image.path,
        if report.image.cached { "cached" } else { "downloaded" }
    );
    println!("    customized image:   {}", customized_summary(&report.customized));
    println!(
        "    network:            defined {}, started {}",
        report.network.defined, report.network.started
    );
    if !report.missing_host_packages.is_empty() {
        println!(
            "    missing packages:   {}",
            report.missing_host_packages.join(", ")
        );
    }
    println!(
        "    readiness:          {} attempt(s) in {:.1}s",
        report.readiness_attempts,
        report.readiness_elapsed.as_secs_f64()
    );
    println!("finished in {:.2}s", report.elapsed.as_secs_f64());
}

async fn probe(opts: &ProbeOptions) -> anyhow::Result<()> {
    let settings = load_settings(opts.config.as_deref())?;
    let policy = ReadinessPolicy::new(
        settings.readiness.max_attempts,
        Duration::from_secs(settings.readiness.interval_secs),
        Duration::from_secs(settings.readiness.attempt_timeout_secs),
    )
    .map_err(preflight)?;

    let target = SshTarget {
        user: opts.user.clone(),
        address: opts.address,
        key: opts.ssh_key.clone(),
    };
    let runner = SystemRunner;
    let result = ReadinessProbe::new(&runner, policy).wait_until_ready(&target).await;
    let attempts = readiness_outcome(&target, result)?;

    println!("{} answered after {} attempt(s)", target.address, attempts);
    Ok(())
}

/// A guest that never answered fails the same way it does inside a full run.
fn readiness_outcome(
    target: &SshTarget,
    result: ReadinessResult,
) -> Result<u32, PipelineError> {
    if result.ready {
        return Ok(result.attempts);
    }
    Err(PipelineError {
        stage: Stage::AwaitReadiness,
        error: ProvisionError::ReadinessTimeout {
            address: target.address.to_string(),
            attempts: result.attempts,
        },
    })
}

fn kickstart(opts: &KickstartOptions) -> anyhow::Result<()> {
    let settings = load_settings(opts.config.as_deref())?;
    let profile = platform::lookup(&opts.os.parse()?)?;
    let public_key = read_public_key(&opts.ssh_key)?;
    let original = std::fs::read(&opts.descriptor)
        .with_context(|| format!("reading kickstart {}", opts.descriptor))?;

    let patch = CustomizationPatch::new(
        &GuestAccounts::new(settings.guest.accounts),
        &public_key,
        profile.boot_args,
    );
    std::io::stdout()
        .write_all(&patch.compose(&original))
        .context("writing composed kickstart")?;
    Ok(())
}

fn list_platforms() {
    println!("Supported platforms:\n");

    let mut count = 0;
    for (os, profile) in platform::supported() {
        println!("    {:<12} {}", os.to_string(), profile.os_variant);
        count += 1;
    }

    println!("\n{} platform(s)", count);
}

fn set_tracing_subscriber(args: &ProcessArgs) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());

    // Logs go to stderr so that stdout carries only command output.
    let result = if args.emit_bunyan {
        let bunyan_layer =
            BunyanFormattingLayer::new("ksbed-runner".into(), std::io::stderr);
        let subscriber = subscriber.with(JsonStorageLayer).with(bunyan_layer);
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let stderr_log = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        let subscriber = subscriber.with(stderr_log);
        tracing::subscriber::set_global_default(subscriber)
    };

    if let Err(e) = result {
        eprintln!("failed to install log subscriber: {e}");
    }
}
