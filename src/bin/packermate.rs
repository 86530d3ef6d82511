use anyhow::Result;
use clap::Parser;
use packermate::builder::{run_build, BuildOptions};
use packermate::identity::AwsCliIdentity;
use packermate::Config;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_FILE_NAME: &str = "packermate.yml";

#[derive(Parser)]
#[command(name = "packermate")]
#[command(about = "Generate and run Packer build configurations from a simple YAML definition")]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE_NAME)]
    config: String,

    /// Additional parameters e.g. -p foo=bar -p answer=42
    #[arg(short, long = "param")]
    param: Vec<String>,

    /// Show expanded parameters and exit
    #[arg(short, long)]
    show_config: bool,

    /// Validate only
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Dump packer config to working directory
    #[arg(short, long)]
    dump_packer: bool,

    /// Build command
    #[arg(value_parser = ["virtualbox", "aws", "all"], default_value = "virtualbox")]
    command: String,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "packermate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    if let Err(err) = run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config, &cli.param, vec![PathBuf::new()])?;

    if let Some(identity) = AwsCliIdentity::discover() {
        config.set_identity_provider(Box::new(identity));
    }

    if cli.show_config {
        println!("{}", config.dump_expanded()?);
        return Ok(());
    }

    let targets: &[&str] = match cli.command.as_str() {
        "virtualbox" => &["virtualbox"],
        "aws" => &["aws"],
        "all" => &["virtualbox", "aws"],
        other => unreachable!("command '{other}' validated by clap"),
    };

    run_build(
        &mut config,
        targets,
        &BuildOptions {
            dry_run: cli.dry_run,
            dump_packer: cli.dump_packer,
        },
    )
}
