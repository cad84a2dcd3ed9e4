use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use packrpc_codec::Value;
use packrpc_frame::{DeframerStats, Packet};
use serde::Serialize;

use crate::json::to_json;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PacketOutput {
    kind: &'static str,
    request_type_id: u16,
    request_id: u32,
    content: serde_json::Value,
}

impl PacketOutput {
    fn new(packet: &Packet) -> Self {
        Self {
            kind: packet_kind(packet),
            request_type_id: packet.request_type_id,
            request_id: packet.request_id,
            content: to_json(&packet.content),
        }
    }
}

#[derive(Serialize)]
struct ResponseOutput {
    kind: &'static str,
    request_type_id: u16,
    content: serde_json::Value,
}

#[derive(Serialize)]
pub struct StatsOutput {
    pub packets: u64,
    pub resyncs: u64,
    pub crc_failures: u64,
    pub decode_failures: u64,
    pub range_failures: u64,
    pub length_failures: u64,
}

impl From<DeframerStats> for StatsOutput {
    fn from(stats: DeframerStats) -> Self {
        Self {
            packets: stats.packets,
            resyncs: stats.resyncs,
            crc_failures: stats.crc_failures,
            decode_failures: stats.decode_failures,
            range_failures: stats.range_failures,
            length_failures: stats.length_failures,
        }
    }
}

#[derive(Serialize)]
pub struct FrameOutput {
    pub request_type_id: u16,
    pub request_id: u32,
    pub is_response: bool,
    pub size: usize,
    pub hex: String,
}

fn packet_kind(packet: &Packet) -> &'static str {
    if packet.is_response {
        "response"
    } else if packet.request_id == 0 {
        "notification"
    } else {
        "request"
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn print_packets(packets: &[Packet], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for packet in packets {
                print_json(&PacketOutput::new(packet));
            }
        }
        OutputFormat::Table => {
            let mut table = new_table(vec!["KIND", "TYPE", "REQUEST ID", "CONTENT"]);
            for packet in packets {
                table.add_row(vec![
                    packet_kind(packet).to_string(),
                    packet.request_type_id.to_string(),
                    packet.request_id.to_string(),
                    packet.content.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for packet in packets {
                println!(
                    "{} type={} id={} content={}",
                    packet_kind(packet),
                    packet.request_type_id,
                    packet.request_id,
                    packet.content
                );
            }
        }
    }
}

pub fn print_stats(stats: DeframerStats, format: OutputFormat) {
    let stats = StatsOutput::from(stats);
    match format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Wrapped {
                stats: StatsOutput,
            }
            print_json(&Wrapped { stats });
        }
        OutputFormat::Table => {
            let mut table = new_table(vec![
                "PACKETS", "RESYNCS", "CRC", "DECODE", "RANGE", "LENGTH",
            ]);
            table.add_row(vec![
                stats.packets.to_string(),
                stats.resyncs.to_string(),
                stats.crc_failures.to_string(),
                stats.decode_failures.to_string(),
                stats.range_failures.to_string(),
                stats.length_failures.to_string(),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!(
                "packets={} resyncs={} crc_failures={} decode_failures={} range_failures={} length_failures={}",
                stats.packets,
                stats.resyncs,
                stats.crc_failures,
                stats.decode_failures,
                stats.range_failures,
                stats.length_failures
            );
        }
    }
}

pub fn print_response(request_type_id: u16, content: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ResponseOutput {
            kind: "response",
            request_type_id,
            content: to_json(content),
        }),
        OutputFormat::Table => {
            let mut table = new_table(vec!["TYPE", "CONTENT"]);
            table.add_row(vec![request_type_id.to_string(), content.to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{}",
                serde_json::to_string_pretty(&to_json(content)).unwrap_or_default()
            );
        }
        OutputFormat::Raw => println!("{content}"),
    }
}

pub fn print_frame(frame: &FrameOutput, bytes: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(frame),
        OutputFormat::Table => {
            let mut table = new_table(vec!["TYPE", "REQUEST ID", "RESPONSE", "SIZE", "HEX"]);
            table.add_row(vec![
                frame.request_type_id.to_string(),
                frame.request_id.to_string(),
                frame.is_response.to_string(),
                frame.size.to_string(),
                frame.hex.clone(),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("{}", frame.hex),
        OutputFormat::Raw => print_raw(bytes),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_kinds() {
        assert_eq!(packet_kind(&Packet::request(1, 5, Value::Null)), "request");
        assert_eq!(packet_kind(&Packet::request(1, 0, Value::Null)), "notification");
        assert_eq!(packet_kind(&Packet::response(1, 5, Value::Null)), "response");
    }

    #[test]
    fn packet_output_serializes_content_as_json() {
        let packet = Packet::request(4, 10, Value::List(vec![Value::from("rpc")]));
        let json = serde_json::to_value(PacketOutput::new(&packet)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "request",
                "request_type_id": 4,
                "request_id": 10,
                "content": ["rpc"],
            })
        );
    }
}
