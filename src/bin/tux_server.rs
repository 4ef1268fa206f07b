use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use supertux_net::service::setup_tracing;
use supertux_net::{AppResult, RelayConfig, RelayNode};
use tokio::runtime;

#[derive(Parser)]
#[command(version, about = "SuperTux relay server")]
pub struct CommandLine {
    /// path to config file, defaults to ./conf.toml when present
    #[arg(short, long)]
    pub conf: Option<String>,
    /// override the listening port
    #[arg(short, long)]
    pub port: Option<u16>,
    /// directory for rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn load_config(commandline: &CommandLine) -> AppResult<RelayConfig> {
    let mut config = match &commandline.conf {
        Some(path) => RelayConfig::set_up_config(PathBuf::from(path))?,
        None => {
            let default_path = PathBuf::from("./conf.toml");
            if default_path.exists() {
                RelayConfig::set_up_config(default_path)?
            } else {
                RelayConfig::default()
            }
        }
    };
    if let Some(port) = commandline.port {
        config.network.port = port;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();
    let config = load_config(&commandline)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let _tracing_guard = setup_tracing(&commandline.log_dir, commandline.verbose);

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread()
        .thread_name("tux-net")
        .enable_all()
        .build()?;

    let mut node = RelayNode::new(config);
    node.start(&rt)?;

    Ok(())
}
