use packrpc_endpoint::{connect_with, CallOptions, Endpoint, EndpointConfig};

use crate::cmd::{parse_duration, CallArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::json::parse_args;
use crate::output::{print_response, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let content = parse_args(&args.args)?;

    let config = EndpointConfig {
        default_expiry: Some(timeout),
        ..EndpointConfig::default()
    };
    let endpoint = connect_with(&args.path, Endpoint::new(config))
        .map_err(|err| rpc_error("connect failed", err))?;

    let options = if args.no_wait {
        CallOptions::fire_and_forget()
    } else {
        CallOptions::blocking()
    };
    let result = endpoint.call(args.type_id, content, &options);
    endpoint.close();

    if let Some(response) = result.map_err(|err| rpc_error("call failed", err))? {
        print_response(args.type_id, &response, format);
    }
    Ok(SUCCESS)
}
