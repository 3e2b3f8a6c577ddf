//! modelgrid-core — shared building blocks for ModelGrid.
//!
//! - [`Settings`]: the `modelgrid.toml` schema with defaults for every field.
//! - [`SettingsHandle`]: live-reloadable settings backed by a watch channel.
//! - [`time`]: duration strings and wall-clock helpers.
//! - [`fingerprint`]: SHA-256 content fingerprints for artifact payloads.

pub mod dynamic;
pub mod fingerprint;
pub mod settings;
pub mod time;

pub use dynamic::SettingsHandle;
pub use settings::{
    ClusterSettings, DeploySettings, EligibilitySettings, EngineSettings, NodeSettings,
    ReconcileSettings, Settings,
};
pub use time::{epoch_millis, parse_duration};
