use packrpc_frame::pack;

use crate::cmd::EncodeArgs;
use crate::exit::{frame_error, CliResult, SUCCESS};
use crate::json::parse_args;
use crate::output::{print_frame, FrameOutput, OutputFormat};

pub fn run(args: EncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let content = parse_args(&args.args)?;
    let frame = pack(args.response, args.type_id, args.request_id, &content)
        .map_err(|err| frame_error("encode failed", err))?;

    let out = FrameOutput {
        request_type_id: args.type_id,
        request_id: args.request_id,
        is_response: args.response,
        size: frame.len(),
        hex: hex::encode(&frame),
    };
    print_frame(&out, &frame, format);
    Ok(SUCCESS)
}
