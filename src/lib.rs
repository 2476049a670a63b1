//! # docqa
//!
//! A document-ingestion webhook that turns uploaded documents into
//! question/answer fine-tuning datasets.
//!
//! When an object lands in storage, docqa extracts its text, asks a language
//! model for question/answer pairs per page, stores the pairs under
//! idempotent keys, and rewrites a JSONL training dataset back to storage.
//! Pages can optionally be embedded into a vector index on the way through.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌──────────────┐
//! │ Webhook  │──▶│  Queue   │──▶│ Pipeline  │──▶│ Record store │
//! │ (axum)   │   │ (SQLite) │   │           │   │   (SQLite)   │
//! └──────────┘   └──────────┘   └─────┬─────┘   └──────┬───────┘
//!                                     │                │
//!                  ┌──────────────────┼─────────┐      ▼
//!                  ▼                  ▼         ▼   ┌──────────────┐
//!             ┌─────────┐      ┌──────────┐ ┌──────┐│ Materializer │
//!             │ Extract │      │ Generate │ │Embed ││  (JSONL)     │
//!             │ OCR/PDF │      │ per page │ │Index │└──────────────┘
//!             └─────────┘      └──────────┘ └──────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docqa init                               # create database
//! docqa process --bucket in --name a.pdf   # run one document now
//! docqa serve                              # webhook + worker
//! docqa stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Events, records and dataset entries |
//! | [`storage`] | Object storage (local directory, S3) |
//! | [`extract`] | Text extraction (local, OCR service) |
//! | [`generate`] | Question/answer generation |
//! | [`embedding`] | Embedding providers |
//! | [`index`] | Vector index |
//! | [`store`] | Keyed record store with merge-upsert |
//! | [`materialize`] | JSONL dataset rendering |
//! | [`pipeline`] | Per-event orchestration |
//! | [`queue`] | Durable work queue and worker |
//! | [`server`] | Webhook HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generate;
pub mod index;
pub mod logging;
pub mod materialize;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod process;
pub mod queue;
pub mod retry;
pub mod search;
pub mod server;
pub mod stats;
pub mod storage;
pub mod store;
