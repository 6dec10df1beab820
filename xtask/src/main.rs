use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build idlescope in release mode and run it as root
    Run {
        /// Run the debug build instead
        #[arg(long)]
        debug: bool,
        /// Arguments passed to idlescope
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::Run { debug, args } => run(debug, &args)?,
    }

    Ok(())
}

fn run(debug: bool, args: &[String]) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.arg("build").arg("--package").arg("idlescope");
    if !debug {
        cmd.arg("--release");
    }

    let status = cmd.status().context("Failed to build idlescope")?;
    if !status.success() {
        anyhow::bail!("Failed to build idlescope");
    }

    let profile = if debug { "debug" } else { "release" };
    let binary = format!("target/{profile}/idlescope");

    // MSR, /dev/port and cpuidle access need root
    let status = Command::new("sudo")
        .arg("-E")
        .arg(&binary)
        .args(args)
        .status()
        .with_context(|| format!("Failed to run {binary}"))?;

    if !status.success() {
        anyhow::bail!("idlescope exited with {status}");
    }

    Ok(())
}
