use anyhow::{bail, Context, Result};
use canvass_core::SharedPrecinctStore;
use canvass_ui::{DashboardState, Ui};
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    let cli = parse_cli_flags()?;

    let mut config = match cli.config_path.as_deref() {
        Some(path) => canvass_config::load_from_path(path)?,
        None => canvass_config::load_from_env()?,
    };
    if let Some(data_path) = cli.data_path {
        config.data_path = data_path;
    }

    init_file_logging(config.data_path.as_str())?;
    tracing::info!(data_path = config.data_path.as_str(), "starting canvass");

    let store = SharedPrecinctStore::open(&config.data_path).with_context(|| {
        format!(
            "failed to load precinct data from '{}'",
            config.data_path.as_str()
        )
    })?;

    let mut state = DashboardState::new(store, config.ui.show_metrics);
    let mut ui = Ui::init()?;
    ui.run(&mut state)?;

    Ok(())
}

fn init_file_logging(data_path: &str) -> Result<()> {
    let log_path = log_file_path(data_path);
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create canvass log directory '{}'",
                    parent.display()
                )
            })?;
        }
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open canvass log file '{}'", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();

    Ok(())
}

fn log_file_path(data_path: &str) -> PathBuf {
    let data_file = Path::new(data_path);
    data_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("canvass.log")
}

#[derive(Debug, Default)]
struct CliFlags {
    config_path: Option<String>,
    data_path: Option<String>,
}

fn parse_cli_flags() -> Result<CliFlags> {
    parse_cli_args(std::env::args().skip(1))
}

fn parse_cli_args(args: impl IntoIterator<Item = String>) -> Result<CliFlags> {
    let mut flags = CliFlags::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                flags.config_path = Some(read_cli_value(
                    &arg,
                    args.next().context(
                        "Missing value after --config. Use --config <path-to-config.toml>.",
                    )?,
                )?);
            }
            "--data" => {
                flags.data_path = Some(read_cli_value(
                    &arg,
                    args.next().context(
                        "Missing value after --data. Use --data <path-to-precincts.json>.",
                    )?,
                )?);
            }
            "--help" | "-h" => {
                print_cli_help();
                std::process::exit(0);
            }
            value if value.starts_with("--") => {
                bail!("Unknown flag '{value}'. Run with --help for valid flags.");
            }
            unknown => {
                bail!("Unexpected argument '{unknown}'. Run with --help for valid flags.");
            }
        }
    }

    Ok(flags)
}

fn print_cli_help() {
    println!("Usage: canvass-app [--config <path>] [--data <path>]");
    println!();
    println!("  --config <path>   Load configuration from this TOML file");
    println!("  --data <path>     Override the precinct data file from the config");
    println!("  --help            Show this help message");
}

fn read_cli_value(flag: &str, value: String) -> Result<String> {
    let value = value.trim().to_owned();
    if value.is_empty() {
        bail!("Flag '{flag}' requires a non-empty value.");
    }
    Ok(value)
}
