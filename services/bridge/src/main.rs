use bridge::{BridgeConfig, Console, FrameView, Session, VarView};
use clap::{Arg, Command};
use std::io::Write;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::info;

fn validate_port(value: &str) -> Result<u16, String> {
    value.parse::<u16>().map_err(|_| "Invalid port number".to_owned())
}

fn validate_millis(value: &str) -> Result<u64, String> {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err("Invalid interval in milliseconds".to_owned()),
    }
}

/// Plain stdout sinks: good enough for driving the bridge from a terminal
/// or a pipe; a real editor front-end supplies its own.
struct TermConsole;

impl Console for TermConsole {
    fn print(&mut self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }
}

struct TermFrameView;

impl FrameView for TermFrameView {
    fn show(&mut self, file: &str, line: u32) {
        println!(">> {file}:{line}");
    }
    fn hide(&mut self) {}
}

struct TermVarView;

impl VarView for TermVarView {
    fn update(&mut self, text: &str, dirty: bool) {
        if dirty {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("nodebridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Bridge between an editor front-end and the Node.js debugger")
        .arg(
            Arg::new("host")
                .help("Host the debuggee is listening on")
                .long("host")
                .default_value("localhost"),
        )
        .arg(
            Arg::new("port")
                .help("Debug port of the debuggee")
                .short('p')
                .long("port")
                .value_parser(validate_port)
                .default_value("5858"),
        )
        .arg(
            Arg::new("tick_ms")
                .help("Controller tick interval in milliseconds")
                .long("tick-ms")
                .value_parser(validate_millis)
                .default_value("100"),
        )
        .arg(
            Arg::new("request_timeout_ms")
                .help("Per-request timeout in milliseconds")
                .long("request-timeout-ms")
                .value_parser(validate_millis)
                .default_value("5000"),
        )
        .get_matches();

    let config = BridgeConfig {
        host: matches
            .get_one::<String>("host")
            .expect("host has a default")
            .clone(),
        port: *matches.get_one::<u16>("port").expect("port has a default"),
        tick: Duration::from_millis(
            *matches
                .get_one::<u64>("tick_ms")
                .expect("tick has a default"),
        ),
        request_timeout: Duration::from_millis(
            *matches
                .get_one::<u64>("request_timeout_ms")
                .expect("timeout has a default"),
        ),
    };

    info!(version = env!("CARGO_PKG_VERSION"), host = %config.host, port = config.port, "bridge starting");

    // Editor commands arrive as lines on stdin; EOF ends the session.
    let (line_tx, line_rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let session = Session::new(config, TermConsole, TermFrameView, TermVarView);
    let code = session.run(line_rx).await;
    std::process::exit(code);
}
