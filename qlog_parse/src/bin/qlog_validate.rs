use env_logger::Env;
use qlog_parse::{LoaderConfig, QlogLoader, parse_qlog_text};
use std::env;
use std::fs;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <file.qlog>", args[0]);
        return ExitCode::from(2);
    }

    let path = &args[1];

    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error opening '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    let root = match parse_qlog_text(&text) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("Invalid JSON in '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    let loader = QlogLoader::with_config(LoaderConfig {
        origin: Some(path.clone()),
        ..LoaderConfig::default()
    });

    let group = match loader.from_json(root) {
        Ok(group) => group,
        Err(e) => {
            eprintln!("Invalid qlog file '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    println!("Valid qlog file: {}", path);
    println!("  Dialect: {}", group.dialect);
    if let Some(version) = &group.qlog_version {
        println!("  qlog version: {}", version);
    }
    if let Some(title) = &group.title {
        println!("  Title: {}", title);
    }
    println!("  Connections: {}", group.connections().len());
    println!("  Events: {}", group.event_count());

    let mut failures = 0;
    for (index, connection) in group.connections().iter().enumerate() {
        let title = connection.meta.title.as_deref().unwrap_or("(untitled)");
        if let Some(error) = connection.error() {
            println!("  [{}] {}: error: {}", index, title, error.description);
            continue;
        }

        let decoded = connection.decode_all();
        println!(
            "  [{}] {}: {} event(s), unit {}",
            index,
            title,
            decoded.events.len(),
            connection.time_unit().as_str()
        );
        for skipped in &decoded.skipped {
            println!("      event {}: {}", skipped.index, skipped.error);
        }
        failures += decoded.skipped.len();
    }

    if failures > 0 {
        eprintln!("{} event(s) could not be decoded", failures);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
