use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use packrpc_codec::Value;
use packrpc_endpoint::{
    Endpoint, EndpointConfig, EndpointListener, HandlerResult, HandlerTable, MethodTable, RpcError,
};
use packrpc_frame::FrameConfig;
use serde::Serialize;

use crate::cmd::ServeArgs;
use crate::exit::{rpc_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

pub const ECHO: u16 = 1;
pub const PING: u16 = 2;
pub const SUM: u16 = 3;
pub const NOTIFY: u16 = 4;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = EndpointConfig {
        frame: FrameConfig {
            max_content_size: args.max_content,
            ..FrameConfig::default()
        },
        ..EndpointConfig::default()
    };
    let listener = EndpointListener::bind(&args.path)
        .map_err(|err| rpc_error("bind failed", err))?
        .with_config(config)
        .with_handlers(demo_handlers().map_err(|err| rpc_error("handler setup failed", err))?)
        .with_methods(demo_methods().map_err(|err| rpc_error("method setup failed", err))?);
    let path = listener.path().to_path_buf();

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let acceptor = {
        let running = running.clone();
        thread::Builder::new()
            .name("packrpc-accept".to_string())
            .spawn(move || accept_loop(listener, &running, args.max_connections))
            .map_err(|err| CliError::new(INTERNAL, format!("failed to start acceptor: {err}")))?
    };

    while running.load(Ordering::SeqCst) && !acceptor.is_finished() {
        thread::sleep(POLL_INTERVAL);
    }
    running.store(false, Ordering::SeqCst);
    // Wake a blocked accept so the listener is dropped and its socket removed.
    let _ = std::os::unix::net::UnixStream::connect(&path);

    let accepted = acceptor
        .join()
        .map_err(|_| CliError::new(INTERNAL, "acceptor thread panicked"))??;
    print_summary(accepted, format);
    Ok(SUCCESS)
}

fn accept_loop(
    listener: EndpointListener,
    running: &AtomicBool,
    max_connections: Option<u64>,
) -> CliResult<u64> {
    let mut endpoints: Vec<Endpoint> = Vec::new();

    while running.load(Ordering::SeqCst) {
        if max_connections.is_some_and(|max| listener.accepted() >= max) {
            if endpoints.iter().all(|endpoint| !endpoint.is_connected()) {
                break;
            }
            thread::sleep(POLL_INTERVAL);
            continue;
        }

        let endpoint = listener
            .accept()
            .map_err(|err| rpc_error("accept failed", err))?;
        if !running.load(Ordering::SeqCst) {
            endpoint.close();
            break;
        }
        tracing::info!(connections = listener.accepted(), "client connected");

        endpoints.retain(Endpoint::is_connected);
        endpoints.push(endpoint);
    }

    for endpoint in &endpoints {
        endpoint.close();
    }
    Ok(listener.accepted())
}

/// Handlers served by `packrpc serve`.
pub fn demo_handlers() -> Result<HandlerTable, RpcError> {
    let mut table = HandlerTable::new();
    table
        .register(ECHO, Ok)?
        .register(PING, |_| Ok(Value::List(vec![Value::from("pong")])))?
        .register(SUM, sum)?
        .register_no_respond(NOTIFY, |args| {
            tracing::info!(content = %args, "notification received");
            Ok(Value::Null)
        })?;
    Ok(table)
}

pub fn demo_methods() -> Result<MethodTable, RpcError> {
    let mut methods = MethodTable::new();
    methods
        .insert("Demo", "echo", ECHO)?
        .insert("Demo", "ping", PING)?
        .insert("Demo", "sum", SUM)?
        .insert("Demo", "notify", NOTIFY)?;
    Ok(methods)
}

fn sum(args: Value) -> HandlerResult {
    let items = args.as_list().ok_or("sum expects a list of integers")?;
    let mut total: i64 = 0;
    for item in items {
        let n = item
            .as_i64()
            .ok_or_else(|| format!("sum expects integers, got {}", item.kind()))?;
        total = total.checked_add(n).ok_or("sum overflowed")?;
    }
    Ok(Value::List(vec![Value::Long(total)]))
}

fn print_summary(accepted: u64, format: OutputFormat) {
    #[derive(Serialize)]
    struct Summary {
        connections: u64,
    }

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&Summary {
                connections: accepted
            })
            .unwrap_or_else(|_| "{}".to_string())
        ),
        _ => println!("served {accepted} connection(s)"),
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
