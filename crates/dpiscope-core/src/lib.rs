//! # DPI Scope Core
//!
//! Platform-independent core library for diagnosing network blockage and
//! planning DPI bypass.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Packet parsing and interception** - Packet views and the filter chain
//! - **Wire inspection** - RST, retransmission, redirect and UDP inspectors
//! - **Signals and diagnosis** - Per-host fact store and rule-based diagnosis
//! - **Strategy selection** - Ranked bypass plans with feedback weighting
//! - **Apply with rollback** - Transactional application of a plan
//! - **Flow policies** - Declarative policies compiled into a decision graph
//!
//! ## Example
//!
//! ```rust,no_run
//! use dpiscope_core::{Config, IntelSession};
//! use dpiscope_core::apply::{ApplyRequest, ApplyService};
//! use dpiscope_core::bypass::{BypassFilter, InProcessBypassEngine};
//! use dpiscope_core::intercept::FilterChain;
//! use dpiscope_core::policy::PolicyGates;
//! use std::sync::Arc;
//!
//! let config = Config::load("dpiscope.toml")?;
//! let chain = Arc::new(FilterChain::new());
//! let engine = Arc::new(InProcessBypassEngine::new(
//!     Arc::new(BypassFilter::new(PolicyGates::from_env())),
//!     Arc::clone(&chain),
//! ));
//! let session = IntelSession::from_config(&config, ApplyService::new(engine, None), None);
//!
//! // Feed host test results, then evaluate and apply
//! // session.observe(&tested, &inspection, None);
//! // session.evaluate_and_apply(&tested, &inspection, request, &cancel, None).await?;
//! # Ok::<(), dpiscope_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod apply;
pub mod bypass;
pub mod config;
pub mod diagnosis;
pub mod error;
pub mod feedback;
pub mod groups;
pub mod inspect;
pub mod intercept;
pub mod packet;
pub mod persist;
pub mod policy;
pub mod progress;
pub mod session;
pub mod signals;
pub mod strategy;

// Re-exports for convenience
pub use config::Config;
pub use diagnosis::{DiagnosisEngine, DiagnosisId, DiagnosisResult};
pub use error::{Error, Result};
pub use intercept::{FilterChain, PacketFilter};
pub use packet::Packet;
pub use session::{IntelSession, SessionOutcome};
pub use signals::{BlockageSignals, HostTested};
pub use strategy::{BypassPlan, StrategySelector};
