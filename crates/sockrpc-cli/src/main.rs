//! # sockrpc CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run a server with the echo service on a fixed port
//! sockrpc serve -b 0.0.0.0:46120
//!
//! # Make an RPC call (outputs raw JSON)
//! sockrpc call 127.0.0.1 46120 echo echo -a '{"payload": "hi"}'
//!
//! # Time 100 echo calls over one persistent connection
//! sockrpc ping 127.0.0.1 46120 -n 100
//!
//! # Fetch 64 KiB from the data transfer service 10 times
//! sockrpc xfer 127.0.0.1 46120 -l 65536 -n 10
//! ```

use anyhow::Result;
use argh::FromArgs;
use sockrpc_cli::stats::LatencyStats;
use sockrpc_client::ConnectionCache;
use sockrpc_common::RpcConfig;
use sockrpc_server::{services, HandlerRegistry, RpcServer};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(FromArgs)]
/// sockrpc - length-prefixed JSON RPC over TCP
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Ping(PingArgs),
    Xfer(XferArgs),
}

/// Arguments for running a server.
///
/// The server registers the bundled `echo.echo` and `dataxferrpc.dataxfer`
/// services and runs until
/// Ctrl-C. Connections that negotiate keep-alive are closed after
/// `--persistence-timeout-ms` without a call.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a sockrpc server with the bundled services
struct ServeArgs {
    /// address to bind the listener to
    ///
    /// Defaults to "127.0.0.1:0" which assigns a random available port.
    /// The actual bound address is logged at startup.
    #[argh(option, short = 'b', default = "\"127.0.0.1:0\".into()")]
    bind: String,

    /// idle time in milliseconds after which a persistent connection is closed
    #[argh(option, long = "persistence-timeout-ms", default = "30000")]
    persistence_timeout_ms: u64,

    /// largest request payload accepted, in bytes
    #[argh(option, long = "max-message-length", default = "2097148")]
    max_message_length: usize,
}

/// Arguments for making a single RPC call.
///
/// Outputs raw JSON (no pretty-printing) to stdout. Errors are reported to
/// stderr with non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call an RPC method on a server
struct CallArgs {
    /// host of the server to call
    #[argh(positional)]
    host: String,

    /// port of the server to call
    #[argh(positional)]
    port: u16,

    /// name of the service
    #[argh(positional)]
    service: String,

    /// name of the method within the service
    #[argh(positional)]
    method: String,

    /// JSON string containing arguments for the method
    ///
    /// Must be valid JSON. Defaults to `{}`.
    #[argh(option, short = 'a', long = "args", default = "\"{}\".into()")]
    args: String,

    /// how long to wait for the response, in milliseconds
    #[argh(option, short = 't', long = "timeout-ms", default = "2000")]
    timeout_ms: u64,
}

/// Arguments for timing repeated echo calls.
#[derive(FromArgs)]
#[argh(subcommand, name = "ping")]
/// time repeated echo calls against a server
struct PingArgs {
    /// host of the server to ping
    #[argh(positional)]
    host: String,

    /// port of the server to ping
    #[argh(positional)]
    port: u16,

    /// number of calls to make
    #[argh(option, short = 'n', long = "trials", default = "10")]
    trials: usize,

    /// how long to wait for each response, in milliseconds
    #[argh(option, short = 't', long = "timeout-ms", default = "2000")]
    timeout_ms: u64,
}

/// Arguments for timing repeated data transfers.
#[derive(FromArgs)]
#[argh(subcommand, name = "xfer")]
/// time repeated dataxferrpc calls against a server
struct XferArgs {
    /// host of the server
    #[argh(positional)]
    host: String,

    /// port of the server
    #[argh(positional)]
    port: u16,

    /// number of bytes to request per call
    #[argh(option, short = 'l', long = "length", default = "1000")]
    length: u64,

    /// number of calls to make
    #[argh(option, short = 'n', long = "trials", default = "10")]
    trials: usize,

    /// how long to wait for each response, in milliseconds
    #[argh(option, short = 't', long = "timeout-ms", default = "2000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call: keep output clean for unix tool usage (piping to jq, etc.)
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Ping(args) => run_ping(args).await,
        Commands::Xfer(args) => run_xfer(args).await,
    }
}

fn serve_config(args: &ServeArgs) -> Result<RpcConfig> {
    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;

    let config = RpcConfig::default()
        .with_server_host(addr.ip().to_string())
        .with_server_port(addr.port())
        .with_persistence_timeout(Duration::from_millis(args.persistence_timeout_ms))
        .with_max_message_length(args.max_message_length);
    config.validate()?;
    Ok(config)
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = serve_config(&args)?;

    let registry = HandlerRegistry::new();
    services::register_echo(&registry);
    services::register_dataxfer(&registry, config.max_message_length);

    let server = RpcServer::bind(config, registry).await?;
    tracing::info!("Serving on {}", server.local_addr());

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}

/// Executes the `call` subcommand through the process-wide connection cache.
async fn run_call(args: CallArgs) -> Result<()> {
    let args_value: serde_json::Value = serde_json::from_str(&args.args)
        .map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;
    let timeout = Duration::from_millis(args.timeout_ms);

    sockrpc_client::init_global(RpcConfig::default().with_socket_timeout(timeout))?;
    let result = sockrpc_client::invoke(
        &args.host,
        args.port,
        &args.service,
        &args.method,
        args_value,
        Some(timeout),
    )
    .await?;

    println!("{}", serde_json::to_string(&result)?);
    sockrpc_client::global().shutdown().await;

    Ok(())
}

async fn run_ping(args: PingArgs) -> Result<()> {
    let timeout = Duration::from_millis(args.timeout_ms);
    let cache = ConnectionCache::new(RpcConfig::default().with_socket_timeout(timeout));
    let mut stats = LatencyStats::new();

    for trial in 0..args.trials {
        let payload = serde_json::json!({ "payload": format!("ping {}", trial) });
        let started = Instant::now();
        match cache
            .invoke(
                &args.host,
                args.port,
                services::ECHO_SERVICE,
                services::ECHO_METHOD,
                payload.clone(),
                Some(timeout),
            )
            .await
        {
            Ok(value) if value == payload => stats.record_success(started.elapsed()),
            Ok(value) => {
                tracing::warn!(trial, %value, "Echo returned a different payload");
                stats.record_failure();
            }
            Err(e) => {
                tracing::warn!(trial, error = %e, "Echo call failed");
                stats.record_failure();
            }
        }
    }

    cache.shutdown().await;
    println!("{}:{} {}", args.host, args.port, stats);
    Ok(())
}

async fn run_xfer(args: XferArgs) -> Result<()> {
    use services::dataxfer;

    let timeout = Duration::from_millis(args.timeout_ms);
    let cache = ConnectionCache::new(RpcConfig::default().with_socket_timeout(timeout));
    let mut stats = LatencyStats::new();
    let request = serde_json::json!({
        "header": { "tag": dataxfer::REQUEST_TAG, "xferLength": args.length }
    });

    for trial in 0..args.trials {
        let started = Instant::now();
        let result = cache
            .invoke(
                &args.host,
                args.port,
                services::DATAXFER_SERVICE,
                services::DATAXFER_METHOD,
                request.clone(),
                Some(timeout),
            )
            .await;
        match result.map(|value| transferred_length(&value)) {
            Ok(Some(n)) if n == args.length => stats.record_success(started.elapsed()),
            Ok(received) => {
                tracing::warn!(trial, ?received, "Transfer returned the wrong amount of data");
                stats.record_failure();
            }
            Err(e) => {
                tracing::warn!(trial, error = %e, "Transfer call failed");
                stats.record_failure();
            }
        }
    }

    cache.shutdown().await;
    println!("{}:{} {}", args.host, args.port, stats);
    if let Some(mean) = stats.mean().filter(|mean| !mean.is_zero()) {
        println!("xfer rate {:.2} bytes/sec", args.length as f64 / mean.as_secs_f64());
    }
    Ok(())
}

/// Decoded length of the `data` field of a transfer reply.
fn transferred_length(value: &serde_json::Value) -> Option<u64> {
    use base64::Engine as _;

    let data = value.get(services::dataxfer::DATA_KEY)?.as_str()?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(data).ok()?;
    u64::try_from(bytes.len()).ok()
}

/// CLI argument parsing tests.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve_defaults() {
        let args: Cli = Cli::from_args(&["sockrpc"], &["serve"]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs {
                bind,
                persistence_timeout_ms,
                max_message_length,
            }) => {
                assert_eq!(bind, "127.0.0.1:0");
                assert_eq!(persistence_timeout_ms, 30000);
                assert_eq!(max_message_length, 2097148);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_options() {
        let args: Cli = Cli::from_args(
            &["sockrpc"],
            &[
                "serve",
                "-b",
                "0.0.0.0:46120",
                "--persistence-timeout-ms",
                "5000",
                "--max-message-length",
                "1024",
            ],
        )
        .unwrap();
        let Commands::Serve(serve) = args.command else {
            panic!("Expected Serve command");
        };

        let config = serve_config(&serve).unwrap();
        assert_eq!(config.server_host, "0.0.0.0");
        assert_eq!(config.server_port, 46120);
        assert_eq!(config.persistence_timeout, Duration::from_millis(5000));
        assert_eq!(config.max_message_length, 1024);
    }

    #[test]
    fn test_serve_rejects_bad_bind() {
        let args: Cli = Cli::from_args(&["sockrpc"], &["serve", "-b", "nowhere"]).unwrap();
        let Commands::Serve(serve) = args.command else {
            panic!("Expected Serve command");
        };
        assert!(serve_config(&serve).is_err());
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["sockrpc"],
            &["call", "127.0.0.1", "46120", "echo", "echo", "-a", "[1,2]"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs {
                host,
                port,
                service,
                method,
                args,
                timeout_ms,
            }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 46120);
                assert_eq!(service, "echo");
                assert_eq!(method, "echo");
                assert_eq!(args, "[1,2]");
                assert_eq!(timeout_ms, 2000);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_requires_method() {
        let result = Cli::from_args(&["sockrpc"], &["call", "127.0.0.1", "46120", "echo"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_call_rejects_bad_port() {
        let result = Cli::from_args(&["sockrpc"], &["call", "127.0.0.1", "http", "echo", "echo"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_ping() {
        let args: Cli = Cli::from_args(
            &["sockrpc"],
            &["ping", "127.0.0.1", "46120", "-n", "5", "-t", "100"],
        )
        .unwrap();
        match args.command {
            Commands::Ping(PingArgs {
                host,
                port,
                trials,
                timeout_ms,
            }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 46120);
                assert_eq!(trials, 5);
                assert_eq!(timeout_ms, 100);
            }
            _ => panic!("Expected Ping command"),
        }
    }

    #[test]
    fn test_cli_parse_xfer() {
        let args: Cli = Cli::from_args(
            &["sockrpc"],
            &["xfer", "127.0.0.1", "46120", "-l", "4096", "-n", "3"],
        )
        .unwrap();
        let Commands::Xfer(xfer) = args.command else {
            panic!("Expected Xfer command");
        };
        assert_eq!(xfer.host, "127.0.0.1");
        assert_eq!(xfer.port, 46120);
        assert_eq!(xfer.length, 4096);
        assert_eq!(xfer.trials, 3);
        assert_eq!(xfer.timeout_ms, 2000);
    }

    #[test]
    fn test_transferred_length_decodes_data() {
        let reply = serde_json::json!({"header": {"tag": "okay"}, "data": "AAAAAA=="});
        assert_eq!(transferred_length(&reply), Some(4));
        assert_eq!(transferred_length(&serde_json::json!({})), None);
        assert_eq!(transferred_length(&serde_json::json!({"data": "!!"})), None);
    }
}
