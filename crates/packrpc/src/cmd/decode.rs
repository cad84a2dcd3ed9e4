use std::io::Read;

use packrpc_frame::{Deframer, Packet};

use crate::cmd::DecodeArgs;
use crate::exit::{io_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_packets, print_stats, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let bytes = read_input(&args)?;
    let mut deframer = Deframer::new(args.max_content);
    let packets = feed_chunked(&mut deframer, &bytes, args.chunk);

    print_packets(&packets, format);
    print_stats(deframer.stats(), format);

    if packets.is_empty() && !bytes.is_empty() {
        return Ok(DATA_INVALID);
    }
    Ok(SUCCESS)
}

fn read_input(args: &DecodeArgs) -> CliResult<Vec<u8>> {
    if let Some(text) = &args.hex {
        return parse_hex(text);
    }
    if let Some(path) = &args.file {
        return std::fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }

    let mut bytes = Vec::new();
    std::io::stdin()
        .read_to_end(&mut bytes)
        .map_err(|err| io_error("failed reading stdin", err))?;
    Ok(bytes)
}

fn parse_hex(text: &str) -> CliResult<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&digits).map_err(|err| CliError::new(USAGE, format!("invalid hex input: {err}")))
}

fn feed_chunked(deframer: &mut Deframer, bytes: &[u8], chunk: usize) -> Vec<Packet> {
    if chunk == 0 {
        return deframer.feed(bytes);
    }
    let mut packets = Vec::new();
    for piece in bytes.chunks(chunk) {
        deframer.feed_with(piece, |packet| packets.push(packet));
    }
    packets
}
