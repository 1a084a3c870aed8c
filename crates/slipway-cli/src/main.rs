mod deploy;

use clap::Parser;
use slipway_core::settings::{DeploySettings, ENV_DISABLE_DEPLOYMENT};
use slipway_core::install_signal_handler;
use slipway_store::SiteLayout;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

#[derive(Debug, Parser)]
#[command(
    name = "slipway",
    version,
    about = "Build and activate the pushed revision of a site"
)]
struct Cli {
    /// Site root containing `repository/`, `wwwroot/`, and `deployments/`.
    site_root: PathBuf,

    /// Directory holding shared build targets, passed to builders as `BuildTargetsPath`.
    build_targets: PathBuf,

    /// Who triggered this deployment (recorded in the ledger).
    deployer: Option<String>,

    /// Changeset to deploy instead of the configured branch or HEAD.
    #[arg(long)]
    commit: Option<String>,

    /// Reset the working copy and remove untracked files before deploying.
    #[arg(long, default_value_t = false)]
    clean: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false)]
    trace: bool,
}

fn level_for(trace_level: u8) -> &'static str {
    match trace_level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    if std::env::var(ENV_DISABLE_DEPLOYMENT).is_ok_and(|v| v.trim() == "1") {
        return ExitCode::from(EXIT_SUCCESS);
    }

    let layout = SiteLayout::new(&cli.site_root);
    let settings = DeploySettings::load(&layout.settings_file()).and_then(|mut s| {
        s.apply_env(|key| std::env::var(key).ok())?;
        Ok(s)
    });
    let settings = match settings {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        level_for(settings.trace_level)
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SLIPWAY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let request = deploy::Request {
        build_targets: cli.build_targets,
        deployer: cli.deployer,
        commit: cli.commit,
        clean: cli.clean,
    };
    match deploy::run(layout, settings, &request) {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
