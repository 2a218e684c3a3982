//! CLI for the tsring round-robin time-series store.
//!
//! Provides commands for inspecting, querying, writing to and benchmarking
//! tsring stores.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use tsring::{Item, Store, StoreConfig};

/// tsring: filesystem-backed round-robin time-series storage CLI.
#[derive(Parser)]
#[command(name = "tsring", version, about)]
struct Cli {
    /// JSON store configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display the series of a store, their sizes and properties.
    Info {
        /// Path to the store directory.
        store_path: PathBuf,
    },

    /// Query items from a series.
    Query {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Series id to query.
        series: String,

        /// Earliest timestamp to include (milliseconds).
        #[arg(long, default_value_t = i64::MIN)]
        start: i64,

        /// Latest timestamp to include (milliseconds).
        #[arg(long, default_value_t = i64::MAX)]
        end: i64,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Append one value to a series, creating the series if needed.
    Append {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Series id to append to.
        series: String,

        /// Value to append.
        value: f64,

        /// Timestamp in milliseconds. Defaults to now.
        #[arg(long)]
        timestamp: Option<i64>,

        /// Capacity of the series if it is created.
        #[arg(long)]
        length: Option<usize>,

        /// Description of the series if it is created.
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Set a property on an existing series.
    SetProperty {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Series id.
        series: String,

        /// Property key.
        key: String,

        /// Property value.
        value: String,
    },

    /// Run an append-path microbenchmark.
    Bench {
        /// Number of items to append.
        #[arg(long, default_value = "1000000")]
        points: u64,

        /// Number of series to spread the items over.
        #[arg(long, default_value = "30")]
        series: u32,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Info { store_path } => cmd_info(&store_path, config),
        Commands::Query {
            store_path,
            series,
            start,
            end,
            format,
        } => cmd_query(&store_path, config, &series, start, end, &format),
        Commands::Append {
            store_path,
            series,
            value,
            timestamp,
            length,
            description,
        } => cmd_append(&store_path, config, &series, value, timestamp, length, &description),
        Commands::SetProperty {
            store_path,
            series,
            key,
            value,
        } => cmd_set_property(&store_path, config, &series, &key, &value),
        Commands::Bench { points, series } => cmd_bench(config, points, series),
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    })
}

/// Opens a store that must already exist.
fn open_existing(store_path: &Path, config: StoreConfig) -> Result<Store, Box<dyn std::error::Error>> {
    if !store_path.is_dir() {
        return Err(format!("No store found at '{}'", store_path.display()).into());
    }
    Ok(Store::open(store_path, config)?)
}

/// Implements `tsring info <store_path>`.
fn cmd_info(store_path: &Path, config: StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(store_path, config)?;

    println!("Store: {}", store_path.display());
    println!("Series: {}", store.len());
    println!();

    for id in store.ids() {
        let Some(series) = store.get(&id) else {
            continue;
        };
        let latest = series
            .latest_timestamp()
            .map_or_else(|| "-".to_string(), |ts| ts.to_string());

        println!("  {id}");
        if !series.description().is_empty() {
            println!("    Description: {}", series.description());
        }
        println!("    Size: {}/{}", series.size(), series.max_length());
        println!("    Latest: {latest}");
        let properties = series.properties();
        if !properties.is_empty() {
            let pairs: Vec<_> = properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
            println!("    Properties: {{{}}}", pairs.join(", "));
        }
    }

    let total_size = dir_size(store_path)?;
    println!();
    println!("Total disk usage: {} ({total_size} bytes)", format_bytes(total_size));

    Ok(())
}

/// Implements `tsring query <store_path> <series>`.
fn cmd_query(
    store_path: &Path,
    config: StoreConfig,
    series_id: &str,
    start: i64,
    end: i64,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(store_path, config)?;
    let series = store
        .get(series_id)
        .ok_or_else(|| format!("Series '{series_id}' not found"))?;

    let data = series.range(start, end)?;

    match format {
        OutputFormat::Csv => {
            println!("# series={series_id}, points={}", data.len());
            println!("timestamp,value");
            for item in &data {
                println!("{},{}", item.timestamp, item.value);
            }
        }
        OutputFormat::Json => {
            let json_data: Vec<serde_json::Value> = data
                .iter()
                .map(|item| {
                    serde_json::json!({
                        "timestamp": item.timestamp,
                        "value": item.value,
                    })
                })
                .collect();

            let output = serde_json::json!({
                "series": series_id,
                "count": data.len(),
                "data": json_data,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `tsring append <store_path> <series> <value>`.
fn cmd_append(
    store_path: &Path,
    config: StoreConfig,
    series_id: &str,
    value: f64,
    timestamp: Option<i64>,
    length: Option<usize>,
    description: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let timestamp = match timestamp {
        Some(ts) => ts,
        None => now_millis()?,
    };

    let store = Store::open(store_path, config)?;
    let series = store.series(series_id, description, length)?;
    series.append(Item::new(timestamp, value))?;
    store.close()?;

    println!("{series_id}: appended {value} at {timestamp}");
    Ok(())
}

/// Implements `tsring set-property <store_path> <series> <key> <value>`.
fn cmd_set_property(
    store_path: &Path,
    config: StoreConfig,
    series_id: &str,
    key: &str,
    value: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(store_path, config)?;
    let series = store
        .get(series_id)
        .ok_or_else(|| format!("Series '{series_id}' not found"))?;

    match series.set_property(key, value) {
        Some(previous) => println!("{series_id}: {key}={value} (was {previous})"),
        None => println!("{series_id}: {key}={value}"),
    }
    store.close()?;
    Ok(())
}

/// Implements `tsring bench`.
#[allow(clippy::cast_precision_loss)] // Benchmark stats are fine with f64 precision
fn cmd_bench(config: StoreConfig, points: u64, series_count: u32) -> Result<(), Box<dyn std::error::Error>> {
    if series_count == 0 {
        return Err("--series must be at least 1".into());
    }

    println!("tsring append-path benchmark");
    println!("  Points: {points}");
    println!("  Series: {series_count}");
    println!();

    let temp_dir = std::env::temp_dir().join("tsring_bench");
    let _ = std::fs::remove_dir_all(&temp_dir);

    let store = Store::open(&temp_dir, config)?;

    let mut handles = Vec::with_capacity(series_count as usize);
    for i in 0..series_count {
        handles.push(store.series(&format!("metric_{i}"), "benchmark series", None)?);
    }

    println!("Appending {points} items across {series_count} series...");

    let base_time = 1_700_000_000_000i64;
    let points_per_series = points / u64::from(series_count);

    let start = Instant::now();

    let mut ts = base_time;
    for _ in 0..points_per_series {
        ts += 1_000;
        for (i, handle) in handles.iter().enumerate() {
            handle.append(Item::new(ts, i as f64))?;
        }
    }

    let append_elapsed = start.elapsed();
    let flushed = store.flush_all()?;
    let total_elapsed = start.elapsed();

    let total_writes = points_per_series * u64::from(series_count);
    let ns_per_write = append_elapsed.as_nanos() as f64 / total_writes.max(1) as f64;
    let writes_per_sec = total_writes as f64 / append_elapsed.as_secs_f64();

    println!();
    println!("Results:");
    println!("  Total appends: {total_writes}");
    println!("  Append time: {append_elapsed:.3?}");
    println!("  Including flush of {flushed} series: {total_elapsed:.3?}");
    println!("  Avg latency: {ns_per_write:.1} ns/append");
    println!("  Throughput: {writes_per_sec:.0} appends/sec");
    println!();

    drop(handles);
    drop(store);
    let _ = std::fs::remove_dir_all(&temp_dir);

    Ok(())
}

/// Returns the current time as epoch milliseconds.
fn now_millis() -> Result<i64, Box<dyn std::error::Error>> {
    let elapsed = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?;
    Ok(i64::try_from(elapsed.as_millis())?)
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

/// Recursively calculates directory size.
fn dir_size(path: &Path) -> Result<u64, Box<dyn std::error::Error>> {
    let mut total = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path)?;
            } else {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}
