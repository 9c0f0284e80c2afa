//! Convert trace files to qlog.
//!
//! This binary reads a Chrome netlog capture, a tshark JSON dissection or a
//! qlog file, detects its format and writes draft-02 qlog JSON.
//!
//! Gzip and zstd compressed inputs are decompressed transparently.
//!
//! # Usage
//!
//! ```bash
//! to_qlog chrome-net-export.json -o session.qlog
//! tshark -r capture.pcap -T json > capture.json && to_qlog capture.json
//! to_qlog trace.sqlog.zst --pretty
//! ```

use clap::Parser;
use env_logger::Env;
use qlog_convert::input::read_input_file;
use qlog_convert::netlog::NetlogConfig;
use qlog_convert::pcap::PcapConfig;
use qlog_convert::{PipelineConfig, parse_any, to_qlog};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "to_qlog")]
#[command(about = "Convert Chrome netlog, tshark JSON or qlog traces to qlog")]
#[command(version)]
struct Args {
    /// Input file (netlog, tshark JSON, qlog or JSON-SEQ; optionally gzip/zstd compressed)
    input: PathBuf,

    /// Output qlog file (defaults to input filename with .qlog extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Title of the produced qlog file
    #[arg(long)]
    title: Option<String>,

    /// Pretty-print the output JSON
    #[arg(long)]
    pretty: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    // Determine output path
    let output_path = args.output.unwrap_or_else(|| {
        let mut path = args.input.clone();
        path.set_extension("qlog");
        path
    });
    if output_path == args.input {
        return Err(format!(
            "Output path '{}' would overwrite the input",
            output_path.display()
        )
        .into());
    }

    let contents = read_input_file(&args.input).map_err(|e| {
        format!(
            "Failed to read input file '{}': {}",
            args.input.display(),
            e
        )
    })?;

    let config = PipelineConfig {
        netlog: NetlogConfig {
            title: args.title.clone(),
            ..NetlogConfig::default()
        },
        pcap: PcapConfig {
            title: args.title.clone(),
        },
        ..PipelineConfig::default()
    };

    let root = parse_any(&contents)?;
    let (dialect, qlog) = to_qlog(root, &config)?;
    eprintln!("Detected: {}", dialect);

    let output_file = File::create(&output_path).map_err(|e| {
        format!(
            "Failed to create output file '{}': {}",
            output_path.display(),
            e
        )
    })?;
    let mut writer = BufWriter::new(output_file);

    if args.pretty {
        serde_json::to_writer_pretty(&mut writer, &qlog)?;
    } else {
        serde_json::to_writer(&mut writer, &qlog)?;
    }
    writeln!(writer)?;
    writer.flush()?;

    eprintln!(
        "Converted '{}' -> '{}'",
        args.input.display(),
        output_path.display()
    );

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
