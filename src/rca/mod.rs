//! Alert-driven root cause analysis.
//!
//! ## Overview
//!
//! An Alertmanager webhook is parked as a pending session; a client then
//! opens a WebSocket for that session and watches a staged investigation
//! unfold: service graph lookup, concurrent cluster and log inspection,
//! codebase search, and a final written report.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐ POST /alerts ┌──────────────────────────────────────────────┐
//! │  Client  │ ───────────> │  server.rs  (Router, ServerConfig)           │
//! │          │ <─────────── │    └─ api.rs  (submit, AppState)             │
//! └──────────┘ /ws/{id}     │         │ SessionStore::create()             │
//!                           │         v                                    │
//!                           │  session.rs  (claim-once store, sweeper)     │
//!                           │         │                                    │
//!                           │  ws.rs ─┤ SessionLifecycle::run()            │
//!                           │         v                                    │
//!                           │  lifecycle.rs  (claim, status, cleanup)      │
//!                           │         │ Orchestrator::run()                │
//!                           │         v                                    │
//!                           │  pipeline.rs  (state machine, fork-join)     │
//!                           │         │ launch() + relay()                 │
//!                           │         v                                    │
//!                           │  capability.rs / relay.rs                    │
//!                           │         │                                    │
//!                           │         v                                    │
//!                           │  capabilities.rs → backends.rs               │
//!                           └──────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module         | Responsibility                                          |
//! |----------------|---------------------------------------------------------|
//! | `models`       | `AlertGroup`, `Stage`, `StageResult`, `PipelineRun`     |
//! | `backends`     | Neo4j, kubectl, Observe and git clients behind traits   |
//!
//! ## Stage order
//!
//! `neo4j` → (`k8s` ∥ `observe`) → `github` → `report`. Events within one
//! stage are strictly ordered; the two concurrent stages may interleave.

pub mod api;
pub mod backends;
pub mod capabilities;
pub mod capability;
pub mod lifecycle;
pub mod models;
pub mod pipeline;
pub mod relay;
pub mod server;
pub mod session;
pub mod ws;
