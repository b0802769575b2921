//! # LKO Agent
//!
//! A local operations agent that watches host resources, remembers past
//! incidents as semantically searchable records, and escalates remediation
//! of misbehaving processes.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌──────────────┐
//! │  Observer  │──▶│  Runbooks  │──▶│ Alert sink   │
//! │  sysinfo   │   │  triggers  │   │ file/desktop │
//! └─────┬──────┘   └────────────┘   └──────────────┘
//!       │ hogs
//!       ▼
//! ┌────────────┐   ┌────────────┐   ┌──────────────┐
//! │ Escalator  │   │  Incident  │◀──│   Planner    │
//! │ nice/TERM/ │   │  memory    │   │ + probes     │
//! │ KILL       │   │ (vectors)  │   │ (`lko ask`)  │
//! └────────────┘   └────────────┘   └──────────────┘
//!          ▲              ▲
//!          └── daemon ────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lko ask "Why is my disk filling up?"
//! lko search "disk full on /var" -k 3
//! lko runbooks check
//! lko remediate 4242            # dry run unless --live
//! lko daemon run
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors at component seams |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`memory`] | Incident vector store |
//! | [`runbook`] | Runbook loading, triggers and actions |
//! | [`remediation`] | Three-tier process remediation |
//! | [`observe`] | Disk, memory and process observation |
//! | [`network`] | Interface, gateway, ping, DNS and port checks |
//! | [`containers`] | Docker container health and resource use |
//! | [`subprocess`] | Bounded child processes, killed by group on timeout |
//! | [`alerts`] | Alert sinks |
//! | [`planner`] | LLM query planning |
//! | [`tools`] | Diagnostic probe execution |
//! | [`incidents`] | Incident and query logs |
//! | [`logs`] | Log rotation |
//! | [`daemon`] | Monitoring scheduler |

pub mod alerts;
pub mod ask;
pub mod config;
pub mod containers;
pub mod daemon;
pub mod embedding;
pub mod error;
pub mod incidents;
pub mod logs;
pub mod memory;
pub mod models;
pub mod network;
pub mod observe;
pub mod planner;
pub mod remediate_cmd;
pub mod remediation;
pub mod runbook;
pub mod runbook_cmd;
pub mod search;
pub mod service;
pub mod stats;
pub mod subprocess;
pub mod tools;
