use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

use args::Args;
use getopts::Occur;
use memprof::serializer::live_allocs_csv;
use memprof::wire::{Command, Frame};
use num_format::{Locale, ToFormattedString};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PROGRAM_DESC: &str = "Receive and print memprof frames";
const PROGRAM_NAME: &str = "mp_listen";

struct Options {
    bind: String,
    port: u16,
    snapshot_every: u64,
    count: u64,
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.flag("h", "help", "Print this help");
    args.option(
        "b",
        "bind",
        "Address to listen on",
        "HOST",
        Occur::Optional,
        Some(memprof::TransportConfig::default().host),
    );
    args.option(
        "p",
        "port",
        "Port to listen on",
        "PORT",
        Occur::Optional,
        Some(memprof::TransportConfig::default().port.to_string()),
    );
    args.option(
        "s",
        "snapshot-every",
        "Request a live-block snapshot after every N summaries (0 = never)",
        "N",
        Occur::Optional,
        Some(String::from("0")),
    );
    args.option(
        "c",
        "count",
        "Exit after receiving N frames (0 = run forever)",
        "N",
        Occur::Optional,
        Some(String::from("0")),
    );

    args.parse_from_cli()?;

    if args.value_of::<bool>("help")? {
        println!("{}", args.full_usage());
        return Ok(());
    }

    let options = Options {
        bind: args.value_of("bind")?,
        port: args.value_of("port")?,
        snapshot_every: args.value_of("snapshot-every")?,
        count: args.value_of("count")?,
    };

    let listener = TcpListener::bind((options.bind.as_str(), options.port))?;
    info!("listening on {}", listener.local_addr()?);

    let mut received = 0;
    for stream in listener.incoming() {
        let stream = stream?;
        info!("profiler connected from {}", stream.peer_addr()?);
        received = serve(stream, &options, received)?;
        if options.count != 0 && received >= options.count {
            break;
        }
        info!("profiler disconnected");
    }

    Ok(())
}

// Prints frames from one connection until it closes or enough frames arrived.
// Returns the running frame count.
fn serve(stream: TcpStream, options: &Options, mut received: u64) -> Result<u64, anyhow::Error> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    let mut summaries = 0u64;

    for line in reader.lines() {
        let line = line?;
        let frame = match Frame::parse(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("skipping line: {}", e);
                continue;
            }
        };
        received += 1;

        match frame {
            Frame::Summary(s) => {
                summaries += 1;
                println!(
                    "in use: {}B  peak: {}B  allocations: {}",
                    s.bytes_in_use.to_formatted_string(&Locale::en),
                    s.peak.to_formatted_string(&Locale::en),
                    s.alloc_count.to_formatted_string(&Locale::en)
                );
                if options.snapshot_every != 0 && summaries % options.snapshot_every == 0 {
                    writer.write_all(Command::Snapshot.to_line().as_bytes())?;
                }
            }
            Frame::LiveAllocs(live) => {
                println!(
                    "{} live blocks:",
                    live.blocks.len().to_formatted_string(&Locale::en)
                );
                print!("{}", live_allocs_csv(&live.blocks));
            }
        }

        if options.count != 0 && received >= options.count {
            break;
        }
    }

    Ok(received)
}
