//! Repository core
//!
//! Everything needed to keep a tenant's published index consistent with
//! its storage prefix:
//!
//! - [`object_cache`]: snapshot of the latest successful listing
//! - [`index`]: pure snapshot -> index transformation
//! - [`coordinator`]: single-flight refresh, rebuild and publish
//! - [`tenancy`]: one isolated coordinator per tenant key

pub mod coordinator;
pub mod flight;
pub mod index;
pub mod object_cache;
pub mod tenancy;
pub mod version;

pub use coordinator::{RegenerationCoordinator, SyncResult, SyncSettings, SyncStatus};
pub use flight::{Flight, FlightAborted, FlightRole, SingleFlight};
pub use index::{
    build_index, build_index_with_report, parse_package_file_name, ChartVersion,
    IndexBuildReport, RepositoryIndex, API_VERSION,
};
pub use object_cache::{ObjectCache, ObjectSnapshot};
pub use tenancy::{TenancyRegistry, TenantKey, TenantState};
pub use version::SemVer;
