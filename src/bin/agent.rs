use clap::{Parser, Subcommand};
use cohort_agent::cache::ArtifactCache;
use cohort_agent::config::Config;
use cohort_agent::embedder::OpenAiEmbedder;
use cohort_agent::llm::OpenAiChat;
use cohort_agent::orchestrator::Orchestrator;
use cohort_agent::schema_gen::SchemaGenerator;
use cohort_agent::storage::{ArtifactPaths, FsObjectStore, ObjectStore};
use cohort_agent::turns::FsTurnStore;
use cohort_agent::ui::NullShaper;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent", about = "Clinical cohort query agent")]
struct Cli {
    /// Root directory of the local object store.
    #[arg(long, default_value = "./store")]
    store_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one message to a project conversation and print the reply.
    Chat {
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "local")]
        user: String,
        /// The message text.
        message: String,
    },
    /// Generate schema, concept, and embedding artifacts for a database
    /// file and upload them under the project's artifact prefix.
    Generate {
        #[arg(long)]
        project: String,
        /// Path to the project's SQLite database.
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let store = Arc::new(FsObjectStore::new(&cli.store_root));

    match cli.command {
        Command::Chat {
            project,
            user,
            message,
        } => {
            let cache = Arc::new(ArtifactCache::new(&config.cache_dir, config.cache_ttl));
            let turns = Arc::new(FsTurnStore::new(config.cache_dir.join("turns")));
            let llm = Arc::new(OpenAiChat::new(
                config.api_key.clone(),
                config.base_url.clone(),
                config.chat_model.clone(),
            ));
            let embedder = Arc::new(OpenAiEmbedder::new(
                config.api_key.clone(),
                config.base_url.clone(),
                config.embedding_model.clone(),
            ));
            let orchestrator = Orchestrator::new(
                cache,
                store,
                turns,
                llm,
                embedder,
                Arc::new(NullShaper),
                config.artifact_prefix.clone(),
                config.cache_dir.join("db"),
            );
            let reply = orchestrator.handle_message(&project, &user, &message).await?;
            println!("{}", reply);
        }
        Command::Generate { project, db } => {
            let llm = Arc::new(OpenAiChat::new(
                config.api_key.clone(),
                config.base_url.clone(),
                config.chat_model.clone(),
            ));
            let embedder = Arc::new(OpenAiEmbedder::new(
                config.api_key.clone(),
                config.base_url.clone(),
                config.embedding_model.clone(),
            ));
            let generator = SchemaGenerator::new(llm, embedder);

            let (catalog, key_graph, concepts) = generator.generate(&db).await?;
            let field_index = generator.build_field_embedding_index(&catalog).await?;
            let paths = ArtifactPaths::for_project(&config.artifact_prefix, &project);
            let matrix_scratch = config.cache_dir.join(format!("{}_concept_matrix.f32", project));
            let concept_index = generator
                .build_concept_embedding_index(&concepts, &matrix_scratch)
                .await?;

            store
                .upload(&serde_json::to_vec(&catalog)?, &paths.schema)
                .await?;
            store
                .upload(&serde_json::to_vec(&key_graph)?, &paths.schema_keys)
                .await?;
            store
                .upload(&field_index.to_json()?, &paths.field_embeddings)
                .await?;
            store
                .upload(&concepts.to_csv()?, &paths.concept_table)
                .await?;
            store
                .upload(
                    &serde_json::to_vec(concept_index.keys())?,
                    &paths.concept_keys,
                )
                .await?;
            store
                .upload(&std::fs::read(&matrix_scratch)?, &paths.concept_matrix)
                .await?;
            let db_name = db
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project.db".to_string());
            store
                .upload(&std::fs::read(&db)?, &format!("{}/{}", paths.prefix, db_name))
                .await?;

            println!(
                "generated artifacts for {}: {} tables, {} concept rows",
                project,
                catalog.tables.len(),
                concepts.len()
            );
        }
    }
    Ok(())
}
