use clap::*;
use clap_num::maybe_hex;
use exhume_sparse::{Body, CacheConfig, OpenError};
use log::{debug, error, info, LevelFilter};
use std::io::Read;

fn load_cache_config(path: Option<&String>, no_cache: bool) -> Result<CacheConfig, OpenError> {
    if no_cache {
        return Ok(CacheConfig::disabled());
    }
    match path {
        Some(path) => CacheConfig::from_json_file(path),
        None => Ok(CacheConfig::default()),
    }
}

fn process_file(
    file_path: &str,
    format: &str,
    size: u64,
    offset: u64,
    config: CacheConfig,
    json_info: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Processing the file '{}' in '{}' format...", file_path, format);
    let mut reader = Body::open_with(file_path.to_string(), format, Some(offset), config)?;

    debug!("------------------------------------------------------------");
    reader.print_info();
    info!("Sector size: {}", reader.get_sector_size());
    info!("Total sectors: {}", reader.total_sectors());
    debug!("------------------------------------------------------------");

    if json_info {
        println!("{}", serde_json::to_string_pretty(&reader.summary())?);
        return Ok(());
    }

    let mut bytes = Vec::new();
    (&mut reader).take(size).read_to_end(&mut bytes)?;
    if (bytes.len() as u64) < size {
        info!(
            "Reached the end of the image after {} of {} bytes",
            bytes.len(),
            size
        );
    }
    let result = String::from_utf8_lossy(&bytes);
    println!("{}", result);
    debug!("Cache statistics: {:?}", reader.image().cache_stats());
    Ok(())
}

fn main() {
    let matches = Command::new("exhume_sparse")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Exhume a body of data from sparse disk image containers.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the body to exhume."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(value_parser!(String))
                .default_value("auto")
                .help("The format of the file, either 'qed', 'vdi', 'parallels', 'partclone' or 'auto'."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required_unless_present("info")
                .help("The size (in bytes) to read."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .default_value("0")
                .help("Read at a specific offset."),
        )
        .arg(
            Arg::new("info")
                .long("info")
                .action(ArgAction::SetTrue)
                .help("Print the image geometry, table layout and cache settings as JSON."),
        )
        .arg(
            Arg::new("cache_config")
                .long("cache-config")
                .value_parser(value_parser!(String))
                .conflicts_with("no_cache")
                .help("Path to a JSON cache configuration."),
        )
        .arg(
            Arg::new("no_cache")
                .long("no-cache")
                .action(ArgAction::SetTrue)
                .help("Disable every cache tier."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let log_level_str = matches
        .get_one::<String>("log_level")
        .map(String::as_str)
        .unwrap_or("info");
    let level_filter = match log_level_str {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    env_logger::Builder::new().filter_level(level_filter).init();

    let file_path = match matches.get_one::<String>("body") {
        Some(path) => path,
        None => {
            error!("Missing --body argument.");
            std::process::exit(1);
        }
    };
    let format = matches
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("auto");
    let size = matches.get_one::<u64>("size").copied().unwrap_or(0);
    let offset = matches.get_one::<u64>("offset").copied().unwrap_or(0);
    let json_info = matches.get_flag("info");

    let config = match load_cache_config(
        matches.get_one::<String>("cache_config"),
        matches.get_flag("no_cache"),
    ) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = process_file(file_path, format, size, offset, config, json_info) {
        error!("{}", err);
        std::process::exit(1);
    }
}
