use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use packrpc_frame::DEFAULT_MAX_CONTENT;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod decode;
pub mod encode;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the demo handlers on a Unix socket.
    Serve(ServeArgs),
    /// Call a remote handler and print its response.
    Call(CallArgs),
    /// Encode one frame.
    Encode(EncodeArgs),
    /// Decode frames from hex, a file or stdin.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Encode(args) => encode::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    #[arg(env = "PACKRPC_SOCKET")]
    pub path: PathBuf,
    /// Largest accepted frame content in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_CONTENT)]
    pub max_content: usize,
    /// Exit once this many connections have been served and closed.
    #[arg(long)]
    pub max_connections: Option<u64>,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Socket path to connect to.
    #[arg(env = "PACKRPC_SOCKET")]
    pub path: PathBuf,
    /// Request type id of the remote handler.
    #[arg(long, short = 't')]
    pub type_id: u16,
    /// Arguments as a JSON array or object.
    #[arg(long, default_value = "[]")]
    pub args: String,
    /// Send fire-and-forget and do not wait for a response.
    #[arg(long)]
    pub no_wait: bool,
    /// How long to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", env = "PACKRPC_TIMEOUT")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// Request type id.
    pub type_id: u16,
    /// Request id; 0 means no response is expected.
    #[arg(long, default_value_t = 0)]
    pub request_id: u32,
    /// Mark the frame as a response.
    #[arg(long)]
    pub response: bool,
    /// Content as JSON (array, object or null).
    #[arg(long, default_value = "[]")]
    pub args: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Frame bytes as hex. Whitespace is ignored.
    #[arg(conflicts_with = "file")]
    pub hex: Option<String>,
    /// Read raw frame bytes from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Feed the deframer this many bytes at a time (0 = all at once).
    #[arg(long, default_value_t = 0)]
    pub chunk: usize,
    /// Largest accepted frame content in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_CONTENT)]
    pub max_content: usize,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
