use std::error::Error;

use clap::Parser;
use log::{error, info};

use nids_v2::{PluginManager, Sensor, SensorOptions, Settings, default_cache_root, list_devices};

#[derive(Parser, Debug)]
#[command(version, about = "Network sensor with pluggable connection analyzers")]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short = 'c', long = "config", default_value = "config.yml")]
    config: String,

    /// Print the capturable interfaces and exit
    #[arg(long)]
    list_interfaces: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    if args.list_interfaces {
        for device in list_devices()? {
            println!("{}", device);
        }
        return Ok(());
    }

    let settings = Settings::new(&args.config)?;

    env_logger::Builder::new()
        .parse_filters(&settings.log_level)
        .init();

    info!("Finding network devices...");
    let devices = list_devices()?;
    if devices.is_empty() {
        error!("No network devices found. Try running with sudo or as an administrator");
        return Err("No network devices found.".into());
    }
    let capture = settings.capture_options(&devices)?;

    // Plugins are fetched and built before capture starts; any failure stops
    // the sensor rather than running with a partial set.
    let cache_root = match settings.plugin_dir() {
        Some(dir) => dir,
        None => default_cache_root()?,
    };
    let manager = PluginManager::new(cache_root, settings.update_analyzers);
    let registry = manager.load_all(settings.enabled_analyzers())?;
    if registry.is_empty() {
        info!("No analyzers configured; connections will be logged without analysis");
    }

    let options = SensorOptions {
        capture,
        log_file: settings.log_file.clone(),
        worker_threads: settings.worker_threads,
        flow_timeout: settings.flow_timeout(),
        max_flow_bytes: settings.max_flow_bytes,
        slow_analysis: settings.slow_analysis(),
    };
    Sensor::new(options, registry).run()?;

    Ok(())
}
