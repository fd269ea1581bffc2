use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use docket::config;
use docket::context::AppContext;
use docket::models::{DocType, PipelineStatus};
use docket::search::SearchFilters;
use docket::{documents, ingest, migrate, queue, search, server};

#[derive(Parser)]
#[command(
    name = "docket",
    about = "Docket — an event-anchored ingestion and retrieval pipeline for shared-drive archives",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/docket.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations and build the vector index
    Init {
        /// Roll back migrations above this version instead of migrating up
        #[arg(long)]
        rollback_to: Option<i64>,
    },

    /// Scan a drive folder, then run the queue until it drains
    Ingest {
        /// Remote folder id
        folder_id: String,

        /// Delete documents whose drive id vanished remotely
        #[arg(long)]
        reconcile: bool,
    },

    /// Run the worker pool until interrupted
    Worker,

    /// Re-run a document's pipeline from a given stage
    Reprocess {
        /// Document id (UUID)
        document_id: Uuid,

        /// First stage to re-run (2..=7)
        #[arg(long, default_value_t = 2)]
        from_step: i32,
    },

    /// Search the knowledge base
    Search {
        /// Query text
        query: String,

        #[arg(long)]
        year: Option<i32>,

        #[arg(long)]
        department: Option<String>,

        #[arg(long)]
        doc_type: Option<String>,

        /// Caller access level (1 = most privileged)
        #[arg(long, default_value_t = 1)]
        user_level: i32,

        /// Maximum number of hits
        #[arg(long)]
        limit: Option<i64>,
    },

    /// List documents and their pipeline state
    Documents {
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 0)]
        skip: i64,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Show one task's state
    Tasks {
        /// Task id (UUID)
        task_id: Uuid,
    },

    /// Start the HTTP server
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("docket=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init { rollback_to } => {
            let pool = docket::db::connect(&cfg).await?;
            match rollback_to {
                Some(version) => {
                    migrate::rollback_to(&pool, version).await?;
                    println!("Rolled back to version {}.", version);
                }
                None => {
                    migrate::run_migrations(&cfg, &pool).await?;
                    println!("Database initialized successfully.");
                }
            }
        }
        Commands::Ingest {
            folder_id,
            reconcile,
        } => {
            let ctx = AppContext::init(cfg).await?;
            let options = ingest::ScanOptions {
                reconcile_missing: reconcile,
            };
            let task_id = queue::enqueue_ingest_folder(&ctx.pool, &folder_id, &options).await?;
            println!("ingest {}", folder_id);
            println!("  task: {}", task_id);

            queue::run_workers(ctx.clone(), true).await?;

            if let Some(task) = queue::get_task(&ctx.pool, task_id).await? {
                println!("  state: {}", task.state);
                if let Some(result) = task.result {
                    println!("  result: {}", result);
                }
                if let Some(error) = task.error {
                    println!("  error: {}", error);
                }
            }
            println!("ok");
        }
        Commands::Worker => {
            let ctx = AppContext::init(cfg).await?;
            queue::run_workers(ctx, false).await?;
        }
        Commands::Reprocess {
            document_id,
            from_step,
        } => {
            let ctx = AppContext::init(cfg).await?;
            let task_id = queue::enqueue_reprocess(&ctx.pool, document_id, from_step).await?;
            println!("reprocess {} from step {}", document_id, from_step);
            println!("  task: {}", task_id);
            queue::run_workers(ctx, true).await?;
            println!("ok");
        }
        Commands::Search {
            query,
            year,
            department,
            doc_type,
            user_level,
            limit,
        } => {
            let ctx = AppContext::init(cfg).await?;
            let doc_type = match doc_type.as_deref() {
                None => None,
                Some(s) => match DocType::parse(s) {
                    Some(t) => Some(t),
                    None => anyhow::bail!("unknown doc_type: {}", s),
                },
            };
            let filters = SearchFilters {
                year,
                department,
                doc_type,
                user_level,
                semantic_weight: None,
            };
            let top_k = limit.unwrap_or(ctx.config.retrieval.default_top_k);

            let results = search::search(&ctx, &query, top_k, &filters)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;

            if results.hits.is_empty() {
                println!("No results.");
                return Ok(());
            }

            for (i, hit) in results.hits.iter().enumerate() {
                let name = hit.document_name.as_deref().unwrap_or("(untitled)");
                println!("{}. [{:.3}] {}", i + 1, hit.score, name);
                if let Some(ref header) = hit.section_header {
                    println!("    section: {}", header);
                }
                if let Some(ref event) = hit.event_title {
                    println!("    event: {}", event);
                }
                println!("    excerpt: \"{}\"", hit.content.replace('\n', " ").trim());
                println!("    chunk: {}", hit.chunk_id);
                println!();
            }
            println!("latency: {} ms", results.latency_ms);
        }
        Commands::Documents { status, skip, limit } => {
            let pool = docket::db::connect(&cfg).await?;
            let status = match status.as_deref() {
                None => None,
                Some(s) => match PipelineStatus::parse(s) {
                    Some(st) => Some(st),
                    None => anyhow::bail!("unknown status: {}", s),
                },
            };
            let page = documents::list_documents(&pool, skip, limit, status).await?;

            println!("{:<38} {:<10} STEP  NAME", "ID", "STATUS");
            for doc in &page.documents {
                let name = doc
                    .standardized_name
                    .as_deref()
                    .or(doc.drive_name.as_deref())
                    .unwrap_or("(unnamed)");
                println!(
                    "{:<38} {:<10} {}/7   {}",
                    doc.id, doc.status, doc.current_step, name
                );
            }
            println!("total: {}", page.total);
        }
        Commands::Tasks { task_id } => {
            let pool = docket::db::connect(&cfg).await?;
            match queue::get_task(&pool, task_id).await? {
                Some(task) => {
                    println!("task {}", task.task_id);
                    println!("  state: {}", task.state);
                    println!("  progress: {}%", task.progress);
                    if let Some(step) = task.step {
                        println!("  step: {}", step);
                    }
                    if let Some(result) = task.result {
                        println!("  result: {}", result);
                    }
                    if let Some(error) = task.error {
                        println!("  error: {}", error);
                    }
                }
                None => println!("unknown task: {}", task_id),
            }
        }
        Commands::Serve => {
            let ctx = AppContext::init(cfg).await?;
            server::run_server(ctx).await?;
        }
    }

    Ok(())
}
