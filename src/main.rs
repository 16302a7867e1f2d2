use std::sync::Arc;

use anyhow::Context;

use compliance_review::config::AppConfig;
use compliance_review::embeddings::{EmbeddingConfig, create_embedder};
use compliance_review::guidelines::{GuidelineRetriever, GuidelineStore};
use compliance_review::llm::{LlmConfig, create_provider};
use compliance_review::pipeline::{
    Evaluator, ReportAssembler, ScreeningRules, StallSweeper, VerificationMachine,
    spawn_pending_pickup, spawn_stall_sweep,
};
use compliance_review::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env();

    let llm_config = LlmConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });
    let llm = create_provider(&llm_config)?;

    eprintln!("Compliance review v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );

    // ── Guidelines ───────────────────────────────────────────────────────
    let embedder = create_embedder(&EmbeddingConfig::from_env()?)?;
    let store = Arc::new(GuidelineStore::with_database(embedder, Arc::clone(&db)));
    let restored = store.load_from_db().await?;
    let indexed = match &config.guidelines_dir {
        Some(dir) => store
            .index_directory(dir)
            .await
            .with_context(|| format!("indexing guidelines from {}", dir.display()))?,
        None => 0,
    };
    eprintln!(
        "   Guidelines: {} restored, {} indexed from disk",
        restored, indexed
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let retriever = Arc::new(GuidelineRetriever::new(store, config.retrieval.clone()));
    let screening = ScreeningRules::default_rules();
    eprintln!("   Screening rules: {}", screening.rule_count());
    let evaluator = Arc::new(Evaluator::new(
        llm,
        Arc::clone(&db),
        screening,
        config.pipeline.clone(),
    ));
    let assembler = Arc::new(ReportAssembler::new(Arc::clone(&db)));
    let machine = Arc::new(VerificationMachine::new(
        Arc::clone(&db),
        retriever,
        evaluator,
        assembler,
        config.pipeline.clone(),
    ));

    // ── Background loops ─────────────────────────────────────────────────
    let sweeper = Arc::new(StallSweeper::new(Arc::clone(&db), config.sweep.clone()));
    let _sweep_handle = spawn_stall_sweep(sweeper, config.sweep.interval);
    let _pickup_handle = spawn_pending_pickup(
        Arc::clone(&db),
        Arc::clone(&machine),
        config.sweep.pickup_interval,
    );
    eprintln!(
        "   Stall sweep every {}s, pickup every {}s\n",
        config.sweep.interval.as_secs(),
        config.sweep.pickup_interval.as_secs()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}
