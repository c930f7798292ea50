//! Operator CLI for Steward.
//!
//! Every subcommand maps onto one operation of `steward_ops`, runs it
//! against a named database target from the configuration, and prints the
//! structured report as JSON. The process exit code reflects the outcome;
//! the library itself never terminates the process.

mod connect;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::PathBuf;
use steward_core::StewardConfig;
use steward_ops::batch_count::{BatchAverageCounter, BatchCounter, FALLBACK, FALLBACK_AVG};
use steward_ops::collation::CollationChecker;
use steward_ops::consistency::ConsistencyChecker;
use steward_ops::hll::HllBatchDistinctCounter;
use steward_ops::loose_index_scan::LooseIndexScanDistinctCount;
use steward_ops::partition::{AlterPartition, PartitionMode, TruncatePartition};
use steward_ops::reindex::ConcurrentReindex;
use steward_ops::repair_index::RepairIndex;
use steward_ops::schema_check::SchemaChecker;
use steward_ops::tree_batch::{TreeBatchIterator, TreeCursor};

#[derive(Parser)]
#[command(name = "stewardctl")]
#[command(about = "Low-downtime PostgreSQL maintenance toolkit")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, env = "STEWARD_CONFIG", default_value = "steward.toml")]
    config: PathBuf,

    /// Database target name from the config's [databases] table
    #[arg(long, default_value = "main")]
    database: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TableArgs {
    /// Schema holding the table
    #[arg(long, default_value = "public")]
    schema: String,

    #[arg(long)]
    table: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Exact batched row count
    Count {
        #[command(flatten)]
        target: TableArgs,
        /// Numeric key column to range over
        #[arg(long, default_value = "id")]
        column: String,
        #[arg(long)]
        batch_size: Option<i64>,
    },
    /// Exact batched sum of a column
    Sum {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long, default_value = "id")]
        key_column: String,
        /// Column to sum
        #[arg(long)]
        column: String,
        #[arg(long)]
        batch_size: Option<i64>,
    },
    /// Exact batched average of a column
    Average {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long, default_value = "id")]
        key_column: String,
        #[arg(long)]
        column: String,
    },
    /// Exact batched distinct count of a column
    DistinctCount {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        column: String,
        #[arg(long)]
        batch_size: Option<i64>,
    },
    /// Probabilistic (HyperLogLog) distinct count of a column
    EstimateDistinct {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        column: String,
        #[arg(long, default_value = "id")]
        key_column: String,
    },
    /// Distinct count via loose index scan
    LooseDistinct {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long)]
        column: String,
        #[arg(long)]
        from: Option<i64>,
        #[arg(long)]
        to: Option<i64>,
    },
    /// One bounded slice of a rolling source/target audit
    ConsistencyCheck {
        #[arg(long, default_value = "public")]
        schema: String,
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
        #[arg(long, default_value = "id")]
        key_column: String,
        /// Comma-separated columns to compare
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
        /// Cursor returned by the previous invocation
        #[arg(long)]
        start_id: Option<i64>,
    },
    /// Rebuild an index concurrently and swap it in
    Reindex {
        #[arg(long, default_value = "public")]
        schema: String,
        #[arg(long)]
        index: String,
    },
    /// Partition lifecycle operations (allow-listed partitions only)
    Partition {
        #[command(subcommand)]
        command: PartitionCommands,
    },
    /// Diagnostics sweeps
    Check {
        #[command(subcommand)]
        command: CheckCommands,
    },
    /// Run the configured index repair plan
    RepairIndex {
        /// Log the SQL without mutating anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Depth-first walk over a hierarchical table, printing id batches
    TreeWalk {
        #[command(flatten)]
        target: TableArgs,
        #[arg(long, default_value = "id")]
        id_column: String,
        #[arg(long, default_value = "parent_id")]
        parent_column: String,
        #[arg(long)]
        start_id: i64,
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
        /// Resume cursor (JSON) from a previous run
        #[arg(long)]
        cursor: Option<String>,
    },
}

#[derive(Subcommand)]
enum PartitionCommands {
    Attach {
        #[arg(long)]
        name: String,
    },
    Detach {
        #[arg(long)]
        name: String,
    },
    Truncate {
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand)]
enum CheckCommands {
    /// Expected-vs-live schema drift
    Schema,
    /// Collation version drift and duplicate-key spot checks
    Collation,
}

fn load_config(path: &PathBuf) -> Result<StewardConfig> {
    let config: StewardConfig = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("STEWARD_").split("__"))
        .extract()
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let db = config
        .database(&cli.database)
        .with_context(|| format!("unknown database target '{}'", cli.database))?;
    let pool = connect::pool(db).await?;
    let policy = config.lock_retries.policy();

    match cli.command {
        Commands::Count {
            target,
            column,
            batch_size,
        } => {
            let mut counter = BatchCounter::new(&target.schema, &target.table, &column);
            if let Some(batch_size) = batch_size {
                counter = counter.batch_size(batch_size);
            }
            let mut conn = pool.acquire().await?;
            let count = counter.count(&mut conn).await?;
            print_count(count)?;
        }
        Commands::Sum {
            target,
            key_column,
            column,
            batch_size,
        } => {
            let mut counter = BatchCounter::new(&target.schema, &target.table, &key_column);
            if let Some(batch_size) = batch_size {
                counter = counter.batch_size(batch_size);
            }
            let mut conn = pool.acquire().await?;
            let sum = counter.sum(&mut conn, &column).await?;
            print_count(sum)?;
        }
        Commands::Average {
            target,
            key_column,
            column,
        } => {
            let counter = BatchAverageCounter::new(&target.schema, &target.table, &key_column);
            let mut conn = pool.acquire().await?;
            let average = counter.average(&mut conn, &column).await?;
            if average == FALLBACK_AVG {
                bail!("average aborted (empty relation or guard rail tripped)");
            }
            println!("{}", serde_json::json!({ "average": average }));
        }
        Commands::DistinctCount {
            target,
            column,
            batch_size,
        } => {
            let mut counter = BatchCounter::new(&target.schema, &target.table, &column);
            if let Some(batch_size) = batch_size {
                counter = counter.batch_size(batch_size);
            }
            let mut conn = pool.acquire().await?;
            let count = counter.count_distinct(&mut conn).await?;
            print_count(count)?;
        }
        Commands::EstimateDistinct {
            target,
            column,
            key_column,
        } => {
            let counter =
                HllBatchDistinctCounter::new(&target.schema, &target.table, &column, &key_column);
            let mut conn = pool.acquire().await?;
            let estimate = counter.estimate(&mut conn).await?;
            print_count(estimate)?;
        }
        Commands::LooseDistinct {
            target,
            column,
            from,
            to,
        } => {
            let counter = LooseIndexScanDistinctCount::new(&target.schema, &target.table, &column);
            let mut conn = pool.acquire().await?;
            let count = counter.count(&mut conn, from, to).await?;
            print_count(count)?;
        }
        Commands::ConsistencyCheck {
            schema,
            source,
            target,
            key_column,
            columns,
            start_id,
        } => {
            if columns.is_empty() {
                bail!("--columns requires at least one column");
            }
            let checker = ConsistencyChecker::new(&schema, &source, &target, &key_column, columns);
            let mut conn = pool.acquire().await?;
            let report = checker.execute(&mut conn, start_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.mismatches > 0 {
                std::process::exit(1);
            }
        }
        Commands::Reindex { schema, index } => {
            ConcurrentReindex::new(&pool, policy)
                .schema(&schema)
                .execute(&index)
                .await?;
            tracing::info!(index = %index, "reindex complete");
        }
        Commands::Partition { command } => {
            let changed = match command {
                PartitionCommands::Attach { name } => {
                    AlterPartition::new(&pool, &config.partitions, policy)
                        .execute(&name, PartitionMode::Attach)
                        .await?
                }
                PartitionCommands::Detach { name } => {
                    AlterPartition::new(&pool, &config.partitions, policy)
                        .execute(&name, PartitionMode::Detach)
                        .await?
                }
                PartitionCommands::Truncate { name } => {
                    TruncatePartition::new(&pool, &config.partitions, policy)
                        .execute(&name)
                        .await?
                }
            };
            if !changed {
                bail!("partition precondition not met; nothing was changed");
            }
        }
        Commands::Check { command } => match command {
            CheckCommands::Schema => {
                let mut conn = pool.acquire().await?;
                let report = SchemaChecker::new(&config.expected_schema)
                    .execute(&mut conn)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.is_clean() {
                    std::process::exit(1);
                }
            }
            CheckCommands::Collation => {
                let mut conn = pool.acquire().await?;
                let report = CollationChecker::new(&config.collation_check.risky_indexes)
                    .execute(&mut conn)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.is_clean() {
                    std::process::exit(1);
                }
            }
        },
        Commands::RepairIndex { dry_run } => {
            let report = RepairIndex::new(&pool, &config.repair)
                .dry_run(dry_run)
                .execute()
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::TreeWalk {
            target,
            id_column,
            parent_column,
            start_id,
            batch_size,
            cursor,
        } => {
            let mut conn = pool.acquire().await?;
            let mut iter = match cursor {
                Some(json) => {
                    let cursor: TreeCursor =
                        serde_json::from_str(&json).context("invalid --cursor JSON")?;
                    TreeBatchIterator::with_cursor(
                        &mut conn,
                        &target.schema,
                        &target.table,
                        &id_column,
                        &parent_column,
                        cursor,
                    )
                }
                None => TreeBatchIterator::new(
                    &mut conn,
                    &target.schema,
                    &target.table,
                    &id_column,
                    &parent_column,
                    start_id,
                ),
            };
            while let Some(batch) = iter.next_batch(batch_size).await? {
                println!(
                    "{}",
                    serde_json::json!({ "ids": batch, "cursor": iter.cursor() })
                );
            }
        }
    }

    Ok(())
}

/// Counters signal failure through a sentinel, not an error; translate it
/// into a non-zero exit for scripts.
fn print_count(value: i64) -> Result<()> {
    if value == FALLBACK {
        bail!("counting aborted (guard rail tripped); see logs");
    }
    println!("{}", serde_json::json!({ "count": value }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_loads_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [databases.main]
            url = "postgres://localhost/steward"

            [lock_retries]
            timings_ms = [[100, 50], [200, 100]]

            [[partitions]]
            partition_name = "events_2024_01"
            parent_table = "events"
            bounds_clause = "FOR VALUES FROM ('2024-01-01') TO ('2024-02-01')"
            required_constraint = "events_2024_01_bounds"
            "#
        )
        .unwrap();

        let config = load_config(&file.path().to_path_buf()).unwrap();
        assert!(config.database("main").is_ok());
        assert_eq!(config.lock_retries.policy().steps().len(), 2);
        assert_eq!(config.partitions.len(), 1);
        assert_eq!(config.partitions[0].parent_schema, "public");
    }

    #[test]
    fn invalid_config_is_rejected_at_load_time() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [databases.main]
            host = "localhost"
            "#
        )
        .unwrap();

        assert!(load_config(&file.path().to_path_buf()).is_err());
    }
}
