use sqlshelf::config::{default_config_path, load_config};
use sqlshelf::{FetchOptions, QueryParams, Registry, ShelfError};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

const USAGE: &str = "usage: sqlshelf [CONFIG] <REFERENCE> <SQL>";

fn run(config_path: PathBuf, name: &str, sql: &str) -> sqlshelf::Result<usize> {
    info!("Loading references from {}", config_path.display());
    let registry = Registry::from_config(load_config(&config_path)?);
    let facade = registry.resolve(name)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut printed = 0;
    for item in facade.fetch_one_by_one(sql, QueryParams::None, FetchOptions::default())? {
        serde_json::to_writer(&mut out, &item?.to_json())?;
        writeln!(out)?;
        printed += 1;
    }
    drop(facade);
    registry.shutdown()?;
    Ok(printed)
}

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the JSON rows.
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, name, sql) = match args.as_slice() {
        [name, sql] => match default_config_path() {
            Some(path) => (path, name, sql),
            None => {
                eprintln!("No config directory on this platform; pass CONFIG explicitly");
                return ExitCode::FAILURE;
            }
        },
        [config, name, sql] => (PathBuf::from(config), name, sql),
        _ => {
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    match run(config_path, name, sql) {
        Ok(rows) => {
            info!("Printed {} rows", rows);
            ExitCode::SUCCESS
        }
        Err(ShelfError::UnknownReference { name }) => {
            eprintln!("No reference named [{}] in the configuration", name);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
