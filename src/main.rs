use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use iotfw::config::Profile;
use iotfw::interaction::compile_profile;
use iotfw::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "iotfw")]
#[command(author, version, about = "Compile IoT device profiles into nftables and nfqueue policies")]
struct Args {
    /// Path to the device profile
    #[arg(value_name = "PROFILE")]
    profile: PathBuf,

    /// Validate the profile and exit
    #[arg(long)]
    validate: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    /// Pretty-print the compiled output
    #[arg(long)]
    pretty: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&TracingConfig {
        service_name: "iotfw".to_string(),
        log_level: args.log_level.clone(),
        json_logs: args.json_logs,
    })?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        profile = %args.profile.display(),
        "starting iotfw"
    );

    let profile = Profile::load(&args.profile)?;

    info!(
        device = %profile.device.name,
        individual = profile.individual_policies.len(),
        interaction = profile.interaction_policies.len(),
        "profile loaded"
    );

    let compiled = compile_profile(&profile)
        .with_context(|| format!("failed to compile {}", args.profile.display()))?;

    // Validate only mode
    if args.validate {
        info!("profile is valid");
        return Ok(());
    }

    let output = if args.pretty {
        serde_json::to_string_pretty(&compiled)?
    } else {
        serde_json::to_string(&compiled)?
    };

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", output)?;

    Ok(())
}
