//! REM database CLI.
//!
//! Exit codes: 0 on success, 1 on user error (bad input, validation),
//! 2 on system error (store corruption, provider down).

use clap::{Parser, Subcommand};
use rem_db::config::{ReplicationMode, Settings};
use rem_db::export::ExportFormat;
use rem_db::graph::TraversalDirection;
use rem_db::{Database, DatabaseError};
use std::path::PathBuf;

/// REM database - Resources, Entities, Moments.
#[derive(Parser)]
#[command(name = "rem")]
#[command(about = "Embedded multi-tenant database for semantic search, graph queries, and structured data", long_about = None)]
#[command(version)]
struct Cli {
    /// Database path (overrides P8_DB_PATH)
    #[arg(long, env = "P8_DB_PATH", default_value = "~/.rem/db")]
    db_path: PathBuf,

    /// Tenant id (overrides P8_TENANT_ID)
    #[arg(long, env = "P8_TENANT_ID", default_value = "default")]
    tenant: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database directory
    Init,

    /// Schema management
    #[command(subcommand)]
    Schema(SchemaCommands),

    /// Insert an entity (JSON argument or JSONL batch from a file)
    Insert {
        /// Schema short name
        schema: String,

        /// JSON properties
        json: Option<String>,

        /// Batch insert from a JSONL file
        #[arg(long)]
        batch: Option<PathBuf>,
    },

    /// Get an entity by id
    Get {
        /// Entity UUID
        id: String,
    },

    /// Key lookup within a schema
    Lookup {
        /// Schema short name
        schema: String,

        /// Key value
        key: String,
    },

    /// Ingest ready-made entity records (JSONL)
    Ingest {
        /// JSONL file path
        file: PathBuf,

        /// Schema short name
        #[arg(long)]
        schema: String,
    },

    /// Semantic search
    Search {
        /// Search query
        query: String,

        /// Schema short name
        #[arg(long)]
        schema: String,

        /// Number of results
        #[arg(long, default_value = "10")]
        top_k: usize,

        /// Search effort (beam width)
        #[arg(long)]
        ef: Option<usize>,
    },

    /// SQL or REM statement query
    Query {
        /// Query string
        sql: String,

        /// Show the plan without executing
        #[arg(long)]
        plan: bool,
    },

    /// Natural-language query (needs a registered planner capability)
    Ask {
        /// Question
        question: String,

        /// Schema hint
        #[arg(long)]
        schema: Option<String>,
    },

    /// Graph traversal
    Traverse {
        /// Starting entity UUID
        id: String,

        /// Traversal depth
        #[arg(long, default_value = "2")]
        depth: usize,

        /// Direction: out, in, both
        #[arg(long, default_value = "out")]
        direction: String,

        /// Edge type filter
        #[arg(long)]
        edge_type: Option<String>,

        /// Result cap
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Export a schema's entities
    Export {
        /// Schema short name
        schema: String,

        /// Format: csv, jsonl, parquet
        #[arg(long, default_value = "jsonl")]
        format: String,

        /// Output path
        #[arg(long)]
        output: PathBuf,
    },

    /// Remove tombstones and compact the WAL
    Vacuum,

    /// Serve the replication stream (primary)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:50051")]
        addr: String,
    },

    /// Run as a follower of a primary
    Replicate {
        /// Primary address, e.g. http://primary:50051
        #[arg(long, env = "P8_REPLICATION_PRIMARY")]
        primary: String,
    },

    /// Show WAL position and recent entries
    WalStatus {
        /// Entries to show
        #[arg(long, default_value = "10")]
        tail: usize,
    },

    /// Show node status
    Status,
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Register a schema from a JSON or YAML file
    Add {
        /// Schema file
        file: PathBuf,
    },

    /// List registered schemas
    List,

    /// Show a schema definition
    Show {
        /// Schema short name
        name: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    if cli.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            match e.downcast_ref::<DatabaseError>() {
                Some(db_err) => db_err.exit_code(),
                None => 2,
            }
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::from_env()?;
    settings.db_path = PathBuf::from(shellexpand::tilde(&cli.db_path.to_string_lossy()).to_string());
    settings.tenant_id = cli.tenant.clone();
    if matches!(cli.command, Commands::Replicate { .. }) {
        settings.replication_mode = ReplicationMode::Follower;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(cli, settings))
}

async fn dispatch(cli: Cli, settings: Settings) -> anyhow::Result<()> {
    let tenant = settings.tenant_id.clone();
    let db = Database::open(settings, &tenant)?;

    match cli.command {
        Commands::Init => {
            let status = db.status()?;
            println!("initialized {} ({:?})", cli.db_path.display(), status.mode);
            println!("  tenant: {}", status.tenant);
            println!("  schemas: {}", status.schema_count);
        }

        Commands::Schema(cmd) => match cmd {
            SchemaCommands::Add { file } => {
                let content = std::fs::read_to_string(&file)?;
                let extension = file.extension().and_then(|s| s.to_str());
                let doc: serde_json::Value = if matches!(extension, Some("yaml") | Some("yml")) {
                    serde_yaml::from_str(&content)?
                } else {
                    serde_json::from_str(&content)?
                };
                let schema = db.register_schema(&doc)?;
                println!("registered {} v{}", schema.short_name, schema.version);
            }
            SchemaCommands::List => {
                for name in db.list_schemas() {
                    println!("{name}");
                }
            }
            SchemaCommands::Show { name } => {
                let schema = db.get_schema(&name)?;
                println!("{}", serde_json::to_string_pretty(&*schema)?);
            }
        },

        Commands::Insert { schema, json, batch } => match (json, batch) {
            (Some(json), None) => {
                let properties: serde_json::Value = serde_json::from_str(&json)?;
                let id = db.insert(&schema, properties).await?;
                println!("{id}");
            }
            (None, Some(file)) => {
                let ids = db.ingest_jsonl(&file, &schema).await?;
                println!("inserted {} entities", ids.len());
            }
            _ => anyhow::bail!("provide JSON data or --batch <file>"),
        },

        Commands::Get { id } => {
            let id = uuid::Uuid::parse_str(&id)?;
            match db.get(id)? {
                Some(entity) => println!("{}", serde_json::to_string_pretty(&entity)?),
                None => {
                    return Err(DatabaseError::NotFound(id.to_string()).into());
                }
            }
        }

        Commands::Lookup { schema, key } => match db.lookup(&schema, &key).await? {
            Some(entity) => println!("{}", serde_json::to_string_pretty(&entity)?),
            None => {
                return Err(DatabaseError::NotFound(key).into());
            }
        },

        Commands::Ingest { file, schema } => {
            let ids = db.ingest_jsonl(&file, &schema).await?;
            println!("ingested {} entities from {}", ids.len(), file.display());
        }

        Commands::Search {
            query,
            schema,
            top_k,
            ef,
        } => {
            let hits = db.search(&schema, &query, top_k, ef).await?;
            for (entity, score) in hits {
                println!("{:.4}  {}  {}", score, entity.system.id, summary(&entity));
            }
        }

        Commands::Query { sql, plan } => {
            if plan {
                let planned = db.explain(&sql)?;
                println!(
                    "plan: {} (confidence {:.2}{})",
                    planned.plan.kind(),
                    planned.confidence,
                    planned
                        .fallback
                        .as_ref()
                        .map(|f| format!(", fallback {}", f.kind()))
                        .unwrap_or_default()
                );
                return Ok(());
            }

            let output = db.query(&sql).await?;
            if let Some(count) = output.count {
                println!("{count}");
            } else {
                print_rows(&output.rows, output.columns.as_deref())?;
            }
        }

        Commands::Ask { question, schema } => {
            let output = db.ask(&question, schema.as_deref()).await?;
            print_rows(&output.rows, output.columns.as_deref())?;
        }

        Commands::Traverse {
            id,
            depth,
            direction,
            edge_type,
            limit,
        } => {
            let id = uuid::Uuid::parse_str(&id)?;
            let direction: TraversalDirection = direction.parse()?;
            let entities = db
                .traverse(id, direction, depth, edge_type.as_deref(), Some(limit))
                .await?;
            for entity in entities {
                println!("{}  {}", entity.system.id, summary(&entity));
            }
        }

        Commands::Export {
            schema,
            format,
            output,
        } => {
            let format: ExportFormat = format.parse()?;
            let rows = db.export(&schema, format, &output)?;
            println!("exported {rows} rows to {}", output.display());
        }

        Commands::Vacuum => {
            let report = db.vacuum(None)?;
            println!(
                "purged {} entities, compacted {} WAL entries",
                report.purged_entities, report.compacted_wal_entries
            );
        }

        Commands::Serve { addr } => {
            let server = db.replication_server()?;
            let addr: std::net::SocketAddr = addr.parse()?;
            server.serve(addr).await?;
        }

        Commands::Replicate { primary } => {
            let replica = db.replica_node(&primary)?;
            replica.follow().await?;
        }

        Commands::WalStatus { tail } => {
            let status = db.status()?;
            println!("current_seq: {}", status.current_seq);
            println!("applied_seq: {}", status.applied_seq);
            let from = status
                .current_seq
                .saturating_sub((tail as u64).saturating_sub(1))
                .max(1);
            for entry in db.wal_entries(from, tail)? {
                println!(
                    "  {}  {}  {}  {}",
                    entry.seq,
                    entry.op.as_str(),
                    entry.schema,
                    entry.entity_id
                );
            }
        }

        Commands::Status => {
            let status = db.status()?;
            println!("mode: {:?}", status.mode);
            println!("tenant: {}", status.tenant);
            println!("current_seq: {}", status.current_seq);
            println!("applied_seq: {}", status.applied_seq);
            println!("schemas: {}", status.schema_count);
        }
    }

    Ok(())
}

/// One-line preview of an entity for terminal output.
fn summary(entity: &rem_db::Entity) -> String {
    for field in ["title", "name", "slug", "summary", "uri"] {
        if let Some(value) = entity.property(field).and_then(|v| v.as_str()) {
            return value.to_string();
        }
    }
    entity.system.schema_name.clone()
}

fn print_rows(
    rows: &[rem_db::query::ScoredEntity],
    columns: Option<&[String]>,
) -> anyhow::Result<()> {
    for row in rows {
        match columns {
            Some(columns) => {
                let values: Vec<String> = columns
                    .iter()
                    .map(|c| {
                        row.entity
                            .property(c)
                            .map(|v| match v {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_default()
                    })
                    .collect();
                println!("{}", values.join("\t"));
            }
            None => match row.score {
                Some(score) => println!(
                    "{:.4}  {}",
                    score,
                    serde_json::to_string(&row.entity)?
                ),
                None => println!("{}", serde_json::to_string(&row.entity)?),
            },
        }
    }
    Ok(())
}
