//! adlytics-run - Executes query documents against a prepared store.
//!
//! Reads a JSON queries file (a list, or an object with a `queries`
//! list), executes each query and writes `q<i>.csv` per query. A failing
//! query is reported and the batch continues.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use serde_json::{Value as Json, json};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use adlytics::error::{EngineError, Result};
use adlytics::query::QueryEngine;

/// Runs benchmark queries against an optimized store.
#[derive(Parser)]
#[command(name = "adlytics-run", about = "Ad-event query runner", version)]
struct Args {
    /// Directory containing the optimized store (from adlytics-prepare).
    #[arg(long)]
    optimized_dir: PathBuf,

    /// Output directory for query results (q1.csv, q2.csv, ...).
    #[arg(long)]
    out_dir: PathBuf,

    /// JSON file with the queries to run: either a list or an object
    /// {"queries": [...]}. Defaults to the built-in query set.
    #[arg(long)]
    queries_file: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("adlytics={}", level).parse().unwrap())
        .add_directive(format!("adlytics_run={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// The built-in query set, used when no queries file is given.
fn default_queries() -> Vec<Json> {
    vec![
        json!({
            "select": ["day", {"SUM": "bid_price"}],
            "from": "events",
            "where": [{"col": "type", "op": "eq", "val": "impression"}],
            "group_by": ["day"],
        }),
        json!({
            "select": ["country", {"AVG": "total_price"}],
            "from": "events",
            "where": [{"col": "type", "op": "eq", "val": "purchase"}],
            "group_by": ["country"],
            "order_by": [{"col": "country", "dir": "asc"}],
        }),
        json!({
            "select": ["advertiser_id", "type", {"COUNT": "*"}],
            "from": "events",
            "group_by": ["advertiser_id", "type"],
            "order_by": [{"col": "advertiser_id", "dir": "asc"}],
        }),
        json!({
            "select": ["publisher_id", {"SUM": "bid_price"}],
            "from": "events",
            "where": [{"col": "type", "op": "eq", "val": "impression"}],
            "group_by": ["publisher_id"],
            "order_by": [{"col": "sum(bid_price)", "dir": "desc"}],
        }),
        json!({
            "select": ["minute", {"SUM": "bid_price"}],
            "from": "events",
            "where": [{"col": "type", "op": "eq", "val": "impression"}],
            "group_by": ["minute"],
            "order_by": [{"col": "minute", "dir": "asc"}],
        }),
        json!({
            "select": ["country", {"SUM": "bid_price"}, {"COUNT": "*"}],
            "from": "events",
            "where": [{"col": "type", "op": "eq", "val": "impression"}],
            "group_by": ["country"],
            "order_by": [{"col": "sum(bid_price)", "dir": "desc"}],
        }),
    ]
}

/// Loads queries from a JSON file: a bare list, or `{"queries": [...]}`.
fn load_queries(path: &Path) -> Result<Vec<Json>> {
    let text = std::fs::read_to_string(path)?;
    let doc: Json = serde_json::from_str(&text)?;
    match doc {
        Json::Array(queries) => Ok(queries),
        Json::Object(mut obj) => match obj.remove("queries") {
            Some(Json::Array(queries)) => Ok(queries),
            _ => Err(EngineError::Malformed(format!(
                "{}: expected a list of queries or an object with a 'queries' list",
                path.display()
            ))),
        },
        _ => Err(EngineError::Malformed(format!(
            "{}: expected a list of queries or an object with a 'queries' list",
            path.display()
        ))),
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let queries = match &args.queries_file {
        Some(path) => match load_queries(path) {
            Ok(queries) => {
                info!("Loaded {} queries from {}", queries.len(), path.display());
                queries
            }
            Err(e) => {
                error!("Failed to load queries: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            let queries = default_queries();
            info!("Using built-in query set ({} queries)", queries.len());
            queries
        }
    };

    let mut engine = match QueryEngine::new(&args.optimized_dir) {
        Ok(engine) => engine,
        Err(e) => {
            error!("{}", e);
            error!("Run adlytics-prepare first to build the optimized store.");
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&args.out_dir) {
        error!("Cannot create output directory {}: {}", args.out_dir.display(), e);
        std::process::exit(1);
    }

    // Per-query outcome: Ok((rows, seconds)) or the error message.
    let mut outcomes: Vec<std::result::Result<(usize, f64), String>> = Vec::new();

    for (i, query) in queries.iter().enumerate() {
        let number = i + 1;
        info!("Query {}: {}", number, query);
        let start = Instant::now();
        match execute_and_write(&mut engine, query, &args.out_dir, number) {
            Ok(rows) => {
                let elapsed = start.elapsed().as_secs_f64();
                info!("Query {}: {} rows in {:.3}s", number, rows, elapsed);
                outcomes.push(Ok((rows, elapsed)));
            }
            Err(e) => {
                error!("Query {} failed: {}", number, e);
                outcomes.push(Err(e.to_string()));
            }
        }
    }

    info!("==== Summary ====");
    let mut total_time = 0.0;
    for (i, outcome) in outcomes.iter().enumerate() {
        match outcome {
            Ok((rows, secs)) => {
                info!("Q{}: {:.3}s ({} rows)", i + 1, secs, rows);
                total_time += secs;
            }
            Err(message) => info!("Q{}: ERROR - {}", i + 1, message),
        }
    }
    info!("Total time: {:.3}s", total_time);

    let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
    if succeeded == 0 && !outcomes.is_empty() {
        std::process::exit(1);
    }
}

fn execute_and_write(
    engine: &mut QueryEngine,
    query: &Json,
    out_dir: &Path,
    number: usize,
) -> Result<usize> {
    let result = engine.execute(query)?;
    let out_path = out_dir.join(format!("q{}.csv", number));
    result.to_csv(File::create(&out_path)?)?;
    Ok(result.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_queries_list_and_wrapped() {
        let dir = tempfile::tempdir().unwrap();

        let list_path = dir.path().join("list.json");
        std::fs::write(&list_path, r#"[{"select": ["day"]}]"#).unwrap();
        assert_eq!(load_queries(&list_path).unwrap().len(), 1);

        let wrapped_path = dir.path().join("wrapped.json");
        std::fs::write(&wrapped_path, r#"{"queries": [{"select": ["day"]}, {}]}"#).unwrap();
        assert_eq!(load_queries(&wrapped_path).unwrap().len(), 2);
    }

    #[test]
    fn test_load_queries_rejects_other_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");

        std::fs::write(&path, r#""just a string""#).unwrap();
        assert!(matches!(
            load_queries(&path).unwrap_err(),
            EngineError::Malformed(_)
        ));

        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{{not json").unwrap();
        assert!(matches!(
            load_queries(&path).unwrap_err(),
            EngineError::Malformed(_)
        ));
    }

    #[test]
    fn test_default_queries_parse() {
        for query in default_queries() {
            adlytics::query::parse_query(&query).unwrap();
        }
    }
}
