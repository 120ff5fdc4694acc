//! Client-side token-portfolio aggregation pipeline.
//!
//! Given an account address (plus optional chain filter and historical
//! timestamp) the pipeline paints a cached snapshot, supersedes it with a
//! live fetch classified into core/customized/blocked sets, and, when a
//! timestamp is set, backfills per-chain net-worth change against
//! historical prices. All aggregate updates produce new immutable
//! [`project::Project`] snapshots; in-flight work is cancelled through
//! per-load [`session::LoadSession`] tokens.

pub mod classify;
pub mod cli;
pub mod history;
pub mod metrics;
pub mod pipeline;
pub mod project;
pub mod providers;
pub mod session;
pub mod view;

pub use pipeline::PortfolioService;
pub use providers::LocalStore;
pub use view::PortfolioView;
