use clap::{Parser, Subcommand};

use pierce::{
    Mode, auth,
    config::{ClientOverrides, ServerOverrides},
};

#[derive(Debug, Parser)]
#[command(
    name = "pierce",
    version,
    about = "Reverse tunnel for exposing services behind NAT"
)]
struct Cli {
    /// Path to config file (.toml/.yaml/.yml). If omitted, uses PIERCE_CONFIG, then auto-detects pierce.toml > pierce.yaml > pierce.yml from CWD.
    #[arg(long, env = "PIERCE_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public relay.
    Server {
        /// Auth key tunnel clients must present.
        #[arg(long)]
        key: Option<String>,
        /// Port to accept tunnel connections on.
        #[arg(long)]
        port: Option<u16>,
        /// Allowed access-port range, e.g. 10000-20000 (bounds exclusive).
        #[arg(long)]
        access_ports: Option<String>,
    },
    /// Run the client that exposes local services through a relay.
    Client {
        /// Auth key to present to the relay.
        #[arg(long)]
        key: Option<String>,
        /// Relay address as host:port.
        #[arg(long)]
        server: Option<String>,
        /// Mapping host:port[:access_port]; repeat for multiple services.
        #[arg(long = "local")]
        locals: Vec<String>,
        /// Tunnel connections kept pooled per mapping (1-5).
        #[arg(long)]
        tunnels: Option<usize>,
    },
    /// Mint a time-limited trial key from the server key.
    GenerateKey {
        /// The relay's server key.
        key: String,
        /// Validity window, e.g. "12h" or "7d".
        #[arg(long, default_value = "24h")]
        valid_for: humantime::Duration,
    },
    /// Check whether a key would be accepted by a relay using SERVER_KEY.
    CheckKey { server_key: String, key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Server {
            key,
            port,
            access_ports,
        } => {
            pierce::run(
                cli.config,
                Mode::Server(ServerOverrides {
                    key,
                    port,
                    access_ports,
                }),
            )
            .await
        }
        Command::Client {
            key,
            server,
            locals,
            tunnels,
        } => {
            pierce::run(
                cli.config,
                Mode::Client(ClientOverrides {
                    key,
                    server_addr: server,
                    locals,
                    tunnel_count: tunnels,
                }),
            )
            .await
        }
        Command::GenerateKey { key, valid_for } => {
            let trial = auth::generate_key(&key, *valid_for);
            let expiry = auth::key_expiry(&trial).unwrap_or_default();
            println!("{trial}");
            eprintln!("expires at unix time {expiry}");
            Ok(())
        }
        Command::CheckKey { server_key, key } => {
            if auth::check_key(&server_key, &key) {
                println!("accepted");
                Ok(())
            } else {
                anyhow::bail!("key rejected")
            }
        }
    }
}
