//! Quotegate Runner — query dispatch, result cache, trial tracking.
//!
//! This crate builds on `quotegate-core` to provide:
//! - File-backed result cache with staleness and quarantine
//! - Persistent counter of empty bar/tick fetches
//! - The dispatcher that reconciles cached and fresh units
//! - Result tables with polars conversion
//! - Gateway configuration (TOML + environment) and logging setup

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod logging;
pub mod table;
pub mod trials;

pub use cache::{cache_suffix, CacheError, CacheLocation, CacheStore};
pub use config::{ConfigError, GatewayConfig};
pub use dispatcher::{DispatchError, DispatchReport, Phase, QueryDispatcher};
pub use table::ResultTable;
pub use trials::{TrialKey, TrialTracker};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn dispatcher_is_send_sync() {
        assert_send::<QueryDispatcher>();
        assert_sync::<QueryDispatcher>();
    }

    #[test]
    fn stores_are_send_sync() {
        assert_send::<CacheStore>();
        assert_sync::<CacheStore>();
        assert_send::<TrialTracker>();
        assert_sync::<TrialTracker>();
    }

    #[test]
    fn results_are_send_sync() {
        assert_send::<ResultTable>();
        assert_sync::<ResultTable>();
        assert_send::<DispatchError>();
        assert_sync::<DispatchError>();
    }
}
