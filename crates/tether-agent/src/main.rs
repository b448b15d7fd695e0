//! tether agent entry point.

use clap::Parser;
use tracing::{error, info};

use tether_agent::logging::{self, OutputConfig, OutputSink};
use tether_agent::server::Listener;

/// Remote in-process agent: executes controller commands over TCP.
#[derive(Parser, Debug)]
#[command(name = "tether-agent")]
#[command(about = "Remote in-process agent")]
#[command(version)]
#[command(
    after_help = "Example:\n  tether-agent -p 5910 -o syslog -o stdout -o file:/tmp/log.txt"
)]
struct Cli {
    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = tether_protocol::DEFAULT_PORT)]
    port: u16,

    /// Log output: stdout, syslog, or file:<path>. May be given multiple
    /// times.
    #[arg(short = 'o', long = "output")]
    output: Vec<OutputSink>,
}

fn main() {
    let cli = Cli::parse();

    let config = OutputConfig::from_sinks(&cli.output);
    if let Err(e) = logging::init(&config) {
        eprintln!("Error: logging setup failed: {e}");
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), port = cli.port, "starting tether agent");

    let listener = match Listener::bind(cli.port) {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = cli.port, error = %e, "bind failed");
            eprintln!("Error: bind failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = listener.run() {
        error!(error = %e, "server error");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_matches_the_protocol_constant() {
        let cli = Cli::parse_from(["tether-agent"]);
        assert_eq!(cli.port, 5910);
        assert!(cli.output.is_empty());
    }

    #[test]
    fn repeated_output_flags_collect() {
        let cli = Cli::parse_from(["tether-agent", "-o", "stdout", "-o", "file:/tmp/l"]);
        assert_eq!(cli.output.len(), 2);
    }

    #[test]
    fn unknown_sink_is_a_parse_error() {
        assert!(Cli::try_parse_from(["tether-agent", "-o", "nowhere"]).is_err());
    }

    #[test]
    fn unknown_flag_is_a_parse_error() {
        assert!(Cli::try_parse_from(["tether-agent", "--bogus"]).is_err());
    }
}
