//! # Docket
//!
//! **An event-anchored ingestion and retrieval pipeline for shared-drive
//! document archives.**
//!
//! Docket mirrors office documents out of a cloud drive, pushes each one
//! through a seven-stage pipeline, and serves the result as an
//! access-controlled vector knowledge base with a conversational front.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────────────────────────┐   ┌───────────────┐
//! │  Drive   │──▶│ Ingest → Classify → Parse →  │──▶│  Postgres +   │
//! │  sync    │   │ Preprocess → Chunk → Enrich  │   │  pgvector     │
//! └─────────┘   │ → Embed   (task queue)       │   │  (HNSW)       │
//!               └──────────────────────────────┘   └──────┬────────┘
//!                                                         │
//!                                     ┌───────────────────┤
//!                                     ▼                   ▼
//!                               ┌──────────┐       ┌──────────┐
//!                               │   CLI    │       │   HTTP   │
//!                               │ (docket) │       │  (axum)  │
//!                               └──────────┘       └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A folder-scan task mirrors the remote folder ([`drive`]) into scratch
//!    storage ([`storage`]) and registers documents ([`ingest`]).
//! 2. One pipeline task per document drives the stages in order
//!    ([`pipeline`]): classification ([`classify`]), parsing with image
//!    captions ([`parse`]), header normalization ([`preprocess`]),
//!    parent/child chunking ([`chunk`]), event anchoring ([`enrich`]), and
//!    embedding ([`embed_stage`]).
//! 3. The retrieval engine ([`search`]) ranks child chunks by blended
//!    cosine similarity and exponential time decay under access-level
//!    filters.
//! 4. The chat layer ([`chat`]) rewrites queries over session history,
//!    retrieves, and generates grounded answers with citations.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, loaded once, immutable |
//! | [`models`] | Entities and the closed enums stored in Postgres |
//! | [`error`] | The four error kinds that cross component boundaries |
//! | [`db`] / [`migrate`] | Connection pool and versioned schema migrations |
//! | [`storage`] | Scratch directory + object-storage bucket (SigV4) |
//! | [`drive`] / [`docparser`] / [`llm`] / [`embedding`] | External adapters |
//! | [`ratelimit`] | Process-wide token buckets |
//! | [`ingest`] … [`embed_stage`] | The seven pipeline stages |
//! | [`pipeline`] | Per-document orchestrator with retries and reprocess |
//! | [`queue`] | Durable table-backed task queue and worker pool |
//! | [`search`] | Hybrid retrieval engine |
//! | [`chat`] | Session cache, query rewrite, grounded answers |
//! | [`documents`] | Listing shared by CLI and server |
//! | [`server`] | Axum HTTP API with X-API-Key auth |

pub mod chat;
pub mod chunk;
pub mod classify;
pub mod config;
pub mod context;
pub mod db;
pub mod docparser;
pub mod documents;
pub mod drive;
pub mod embed_stage;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod preprocess;
pub mod queue;
pub mod ratelimit;
pub mod search;
pub mod server;
pub mod storage;
