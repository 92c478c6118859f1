//! # gharvest
//!
//! A resource-aware ingestion pipeline for the GitHub Archive.
//!
//! gharvest downloads the hourly gzip-compressed JSONL files published at
//! data.gharchive.org, validates and normalizes each event, and ingests
//! them into a local SQLite database in idempotent batches. It is built
//! for small always-on hosts: downloads stream to disk, parsing streams
//! from disk, and a resource monitor throttles or pauses the pipeline
//! when memory, disk, or CPU run hot.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────┐   ┌──────────┐
//! │ Catalog  │──▶│ Downloader │──▶│  Stream    │──▶│  SQLite  │
//! │ planning │   │ HTTP+retry │   │ parse/val │   │  batches │
//! └──────────┘   └────────────┘   └───────────┘   └────┬─────┘
//!       ▲                                              │
//!       │        ┌───────────────┐   ┌────────────┐    │
//!       └────────┤ Orchestrator  │◀──│  Resource   │    │
//!                │ worker pool   │   │  monitor   │    │
//!                └───────┬───────┘   └────────────┘    │
//!                        ▼                             ▼
//!                  ┌───────────┐               ┌────────────┐
//!                  │ Reconcile │◀──────────────│   Ledger    │
//!                  │   gaps    │               │ + metrics  │
//!                  └───────────┘               └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gharvest init                          # create database
//! gharvest run                           # catch up and follow the archive
//! gharvest run --mode single-date --date 2024-01-15
//! gharvest run --mode discover           # plan without downloading
//! gharvest stats                         # what's in the database
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`catalog`] | Archive hour enumeration and fetch planning |
//! | [`downloader`] | HTTP fetching with retry and conditional requests |
//! | [`stream`] | Streaming gzip decode and event validation |
//! | [`ingest`] | Transactional batch ingestion |
//! | [`reconcile`] | Gap detection and missing-range bookkeeping |
//! | [`monitor`] | Host resource sampling and pressure classification |
//! | [`orchestrator`] | Run modes and the bounded worker pool |
//! | [`status`] | Shared pipeline status counters |
//! | [`stats`] | Database statistics command |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod catalog;
pub mod config;
pub mod db;
pub mod downloader;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod monitor;
pub mod orchestrator;
pub mod reconcile;
pub mod stats;
pub mod status;
pub mod stream;
