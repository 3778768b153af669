//! agent-kbd CLI — the agent-run knowledge base server and maintenance tools.
//!
//! Usage:
//!   agent-kbd serve [--db PATH] [--host H] [--port P]
//!   agent-kbd init [--db PATH]
//!   agent-kbd clear [--db PATH] [--yes]
//!   agent-kbd fix-embedding-dimensions [--db PATH]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use agent_kb::api::{build_router, AppState};
use agent_kb::config::Config;
use agent_kb::embedding::{self, Embedder};
use agent_kb::llm;
use agent_kb::storage::{GraphStore, OpenStore, SqliteStore};

#[derive(Parser)]
#[command(name = "agent-kbd", version, about = "Agent-run knowledge base")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Bootstrap the SQLite schema
    Init {
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Delete all nodes and edges
    Clear {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        yes: bool,
    },
    /// Drop embeddings whose dimension no longer matches the configured provider
    FixEmbeddingDimensions {
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn db_path(config: &Config, override_path: Option<PathBuf>) -> String {
    override_path
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| config.db_path.clone())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Serve { db, host, port } => run_serve(db, host, port).await,
        Commands::Init { db } => run_init(db),
        Commands::Clear { db, yes } => run_clear(db, yes).await,
        Commands::FixEmbeddingDimensions { db } => run_fix_embedding_dimensions(db).await,
    };
    std::process::exit(code);
}

async fn run_serve(db: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> i32 {
    let config = Config::load();
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        return 1;
    }

    let store: Arc<dyn GraphStore> = match SqliteStore::open(db_path(&config, db)) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("error: failed to open store: {e}");
            return 1;
        }
    };
    let embedder: Arc<dyn Embedder> = match embedding::build_embedder(&config) {
        Ok(e) => Arc::from(e),
        Err(e) => {
            eprintln!("error: failed to build embedder: {e}");
            return 1;
        }
    };
    let llm_client = match llm::build_llm(&config) {
        Ok(l) => Arc::from(l),
        Err(e) => {
            eprintln!("error: failed to build LLM client: {e}");
            return 1;
        }
    };

    let host = host.unwrap_or_else(|| config.api_host.clone());
    let port = port.unwrap_or(config.api_port);
    let config = Arc::new(config);

    let state = AppState {
        store,
        embedder,
        llm: llm_client,
        config,
    };
    let app = build_router(state);

    let addr = format!("{host}:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: failed to bind {addr}: {e}");
            return 1;
        }
    };
    tracing::info!(%addr, "agent-kbd listening");
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("error: server exited: {e}");
        return 1;
    }
    0
}

fn run_init(db: Option<PathBuf>) -> i32 {
    let config = Config::load();
    match SqliteStore::open(db_path(&config, db)) {
        Ok(_) => {
            println!("schema initialized");
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

async fn run_clear(db: Option<PathBuf>, yes: bool) -> i32 {
    let config = Config::load();
    let path = db_path(&config, db);

    if !yes {
        print!("This will delete all data in {path}. Continue? [y/N] ");
        let _ = std::io::stdout().flush();
        let mut response = String::new();
        if std::io::stdin().read_line(&mut response).is_err() || !response.trim().eq_ignore_ascii_case("y") {
            println!("aborted");
            return 0;
        }
    }

    let store = match SqliteStore::open(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    match store.clear_all().await {
        Ok(()) => {
            println!("store cleared");
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

async fn run_fix_embedding_dimensions(db: Option<PathBuf>) -> i32 {
    let config = Config::load();
    let store = match SqliteStore::open(db_path(&config, db)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    match store.fix_embedding_dimensions(config.embedding_dimension).await {
        Ok(touched) => {
            println!("nulled {touched} mismatched embedding(s); expected dimension {}", config.embedding_dimension);
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}
