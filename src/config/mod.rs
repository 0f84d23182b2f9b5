// Configuration module
// Public interface for configuration loading

mod loader;
mod settings;

pub use loader::{apply_overrides, load_config, parse_override};
pub use settings::{Config, MatchMaxReset, TaskSpace, MAX_SEED};
