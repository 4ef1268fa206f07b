use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use supertux_net::network::Client;
use supertux_net::{setup_local_tracing, AppResult, ControlSnapshot, RelayConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::{runtime, signal, time};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version, about = "SuperTux relay test client")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(short, long)]
    pub port: Option<u16>,
    /// send stdin lines instead of control snapshots
    #[arg(long)]
    pub chat: bool,
}

async fn send_controls(client: &Client, interval: Duration) {
    let mut ticker = time::interval(interval);
    let mut rng = rand::thread_rng();
    while !client.is_closed() {
        ticker.tick().await;
        let snapshot = ControlSnapshot::random(&mut rng);
        if let Err(err) = client.send(snapshot.to_wire()) {
            warn!(cause = %err, "failed to send control state");
        }
    }
    info!("connection closed by server");
}

async fn send_lines(client: &Client) -> AppResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        client.send(line)?;
    }
    Ok(())
}

fn main() -> AppResult<()> {
    setup_local_tracing()?;
    let commandline = CommandLine::parse();
    let mut config = match &commandline.conf {
        Some(path) => RelayConfig::set_up_config(PathBuf::from(path))?,
        None => RelayConfig::default(),
    };
    if let Some(host) = commandline.host.clone() {
        config.client.host = host;
    }
    if let Some(port) = commandline.port {
        config.client.port = port;
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async move {
        let chat = commandline.chat;
        let client = Client::from_config(&config.client, move |_, data| {
            let text = String::from_utf8_lossy(&data);
            if chat {
                println!("{}", text);
            } else {
                info!("Received data from server : {{{}}}", text);
            }
        });
        client.init().await?;

        let interval = Duration::from_millis(config.client.send_interval_ms);
        tokio::select! {
            _ = send_controls(&client, interval), if !chat => {}
            res = send_lines(&client), if chat => {
                if let Err(err) = res {
                    error!(cause = %err, "chat input ended");
                }
            }
            _ = signal::ctrl_c() => info!("get shutdown signal"),
        }

        client.destroy();
        Ok(())
    })
}
