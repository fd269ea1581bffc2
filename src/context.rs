//! Shared handles passed into stage workers and request handlers.
//!
//! Built once at startup from the immutable [`Config`]: the connection pool,
//! the blob store, the four external adapters, the chat session store, and
//! the intra-stage fan-out semaphore. There are no global singletons; every
//! component receives this context explicitly.

use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::chat::SessionStore;
use crate::config::Config;
use crate::docparser::DocParser;
use crate::drive::DriveClient;
use crate::embedding::Embedder;
use crate::llm::LlmClient;
use crate::storage::Storage;

pub struct AppContext {
    pub config: Config,
    pub pool: PgPool,
    pub storage: Storage,
    pub drive: DriveClient,
    pub parser: DocParser,
    pub llm: LlmClient,
    pub embedder: Embedder,
    pub sessions: SessionStore,
    /// Bounds adapter fan-out inside one stage (captions, embed batches).
    pub stage_semaphore: Arc<Semaphore>,
}

impl AppContext {
    pub async fn init(config: Config) -> Result<Arc<Self>> {
        let pool = crate::db::connect(&config).await?;
        let storage = Storage::new(&config.storage);
        let drive = DriveClient::new(&config.drive)?;
        let parser = DocParser::new(&config.parser)?;
        let llm = LlmClient::new(&config.llm)?;
        let embedder = Embedder::new(&config.embedding)?;
        let sessions = SessionStore::new(&config.session);
        let stage_semaphore = Arc::new(Semaphore::new(config.queue.max_concurrency_per_stage));

        Ok(Arc::new(Self {
            pool,
            storage,
            drive,
            parser,
            llm,
            embedder,
            sessions,
            stage_semaphore,
            config,
        }))
    }
}
