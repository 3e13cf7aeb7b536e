//! ircnet - terminal IRC client driver

use clap::{Parser, Subcommand};
use ircnet_core::{ConnectionId, NetConfig, NetHandler, Poller, Registry};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// ircnet - line-oriented IRC client on a single poll loop
#[derive(Parser)]
#[command(name = "ircnet")]
#[command(about = "A line-oriented IRC client connection layer")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "ircnet.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Server to connect to on startup
    host: Option<String>,

    /// Port of the startup server
    #[arg(default_value = "6667")]
    port: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a default configuration file
    Config {
        /// Output file path
        #[arg(short, long, default_value = "ircnet.toml")]
        output: PathBuf,
    },
    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    if let Some(command) = cli.command {
        match command {
            Commands::Config { output } => {
                generate_config(&output)?;
                return Ok(());
            }
            Commands::Version => {
                show_version();
                return Ok(());
            }
        }
    }

    let config = if cli.config.exists() {
        info!("Loading configuration from {:?}", cli.config);
        NetConfig::from_file(&cli.config)?
    } else {
        info!("Configuration file not found, using defaults");
        NetConfig::default()
    };
    config.validate()?;

    let watch_stdin = config.poll.watch_stdin;
    let mut poller = Poller::new(&config)?;
    let mut registry = Registry::new(config, &poller)?;
    let mut client = Client::default();

    if let Some(host) = cli.host {
        client.open(&mut registry, &host, &cli.port);
    }

    while !client.quit {
        poller.poll(&mut registry, &mut client)?;
        if watch_stdin && !poller.input_open() {
            info!("Input closed, exiting");
            break;
        }
    }

    let ids: Vec<ConnectionId> = registry.iter().map(|c| c.id()).collect();
    for id in ids {
        registry.destroy(id)?;
    }

    Ok(())
}

/// Initialize logging on stderr, keeping stdout for traffic
fn init_logging(level: &str) -> anyhow::Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Generate default configuration file
fn generate_config(output: &PathBuf) -> anyhow::Result<()> {
    let config = NetConfig::default();
    config.to_file(output)?;
    println!("Generated default configuration file: {:?}", output);
    Ok(())
}

/// Show version information
fn show_version() {
    println!("ircnet {}", env!("CARGO_PKG_VERSION"));
}

/// Terminal front end: prints callbacks, forwards typed lines
#[derive(Default)]
struct Client {
    current: Option<ConnectionId>,
    quit: bool,
}

impl Client {
    fn open(&mut self, net: &mut Registry<String>, host: &str, port: &str) {
        let label = format!("{}:{}", host, port);
        match net.create(label, host, port) {
            Ok(id) => {
                self.current = Some(id);
                if let Err(e) = net.connect(id) {
                    println!("*** {}", e);
                }
            }
            Err(e) => println!("*** {}", e),
        }
    }

    fn command(&mut self, net: &mut Registry<String>, line: &str) {
        let mut words = line.split_whitespace();
        let name = words.next().unwrap_or_default();

        match name {
            "/connect" => match (words.next(), words.next()) {
                (Some(host), port) => self.open(net, host, port.unwrap_or("6667")),
                (None, _) => match self.current {
                    Some(id) => self.report(net.connect(id)),
                    None => println!("*** Usage: /connect <host> [port]"),
                },
            },
            "/disconnect" => match self.current {
                Some(id) => self.report(net.disconnect(id)),
                None => println!("*** No current server"),
            },
            "/server" => {
                let index = words.next().and_then(|n| n.parse::<usize>().ok());
                match index.and_then(|n| net.iter().nth(n)) {
                    Some(connection) => {
                        println!("*** Current server is {}", connection.context());
                        self.current = Some(connection.id());
                    }
                    None => {
                        for (n, connection) in net.iter().enumerate() {
                            let peer = connection
                                .peer_addr()
                                .map_or_else(|| "-".to_string(), |addr| addr.to_string());
                            println!(
                                "*** {} {} [{}] peer {} sendq {}",
                                n,
                                connection.context(),
                                connection.state(),
                                peer,
                                connection.queued_bytes()
                            );
                        }
                    }
                }
            }
            "/quit" => {
                if let Some(id) = self.current {
                    let reason = words.collect::<Vec<_>>().join(" ");
                    self.report(net.send(id, format!("QUIT :{}", reason)));
                }
                self.quit = true;
            }
            _ => println!("*** Unknown command {}", name),
        }
    }

    fn report(&self, result: ircnet_core::Result<()>) {
        if let Err(e) = result {
            println!("*** {}", e);
        }
    }
}

/// Registry as seen by the front end, keyed by `host:port` labels
type Net = Registry<String>;

impl NetHandler<String> for Client {
    fn on_error(&mut self, _net: &mut Net, context: Option<&String>, message: &str) {
        match context {
            Some(server) => println!("*** [{}] {}", server, message),
            None => println!("*** {}", message),
        }
    }

    fn on_connecting(&mut self, _net: &mut Net, _id: ConnectionId, _ctx: &String, message: &str) {
        println!("*** {}", message);
    }

    fn on_connected(&mut self, _net: &mut Net, _id: ConnectionId, _ctx: &String, message: &str) {
        println!("*** {}", message);
    }

    fn on_failed(
        &mut self,
        _net: &mut Net,
        _id: ConnectionId,
        context: &String,
        reason: &str,
        retry_in: Duration,
    ) {
        println!("*** [{}] {}, retrying in {}s", context, reason, retry_in.as_secs());
    }

    fn on_disconnected(&mut self, _net: &mut Net, _id: ConnectionId, ctx: &String, reason: &str) {
        println!("*** [{}] {}", ctx, reason);
    }

    fn on_ping(&mut self, _net: &mut Net, _id: ConnectionId, context: &String, idle: Duration) {
        if idle.is_zero() {
            println!("*** [{}] Traffic resumed", context);
        } else {
            println!("*** [{}] No data for {}s", context, idle.as_secs());
        }
    }

    fn on_input_line(&mut self, net: &mut Net, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        if line.starts_with('/') {
            self.command(net, &line);
            return;
        }

        match self.current {
            Some(id) => self.report(net.send(id, &line)),
            None => println!("*** Not connected, use /connect <host> [port]"),
        }
    }

    fn on_socket_line(&mut self, net: &mut Net, id: ConnectionId, context: &String, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        if let Some(token) = line.strip_prefix("PING ") {
            debug!(server = %context, "Answering server ping");
            if let Err(e) = net.send(id, format!("PONG {}", token)) {
                warn!("Failed to answer ping: {}", e);
            }
        }
        println!("[{}] {}", context, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ircnet_core::ConnectionState;

    fn test_net() -> (Poller<String>, Net) {
        let mut config = NetConfig::default();
        config.poll.watch_stdin = false;
        let poller = Poller::new(&config).unwrap();
        let net = Registry::new(config, &poller).unwrap();
        (poller, net)
    }

    #[test]
    fn test_quit_while_disconnected_still_quits() {
        let (_poller, mut net) = test_net();
        let mut client = Client::default();
        let id = net.create("irc.example.org:6667".to_string(), "irc.example.org", "6667");
        client.current = Some(id.unwrap());

        client.command(&mut net, "/quit see you");

        assert!(client.quit);
        assert_eq!(net.state(client.current.unwrap()), Some(ConnectionState::Disconnected));
        assert_eq!(net.pending_events(), 0);
    }
}
