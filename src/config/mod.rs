mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BusSettings, DEFAULT_PORT, EndpointSettings, ServerSettings, Settings, SyncSettings,
};

/// Loads the configuration from the default file (or `path`), a `.env` file
/// and `BICAMERAL__*` environment variables, then merges it with default
/// values.
///
/// Nested keys use a double underscore: `BICAMERAL__REMOTE__HOST`.
pub fn load_config(path: Option<&Path>) -> Result<Settings, ConfigError> {
    // A missing .env is fine; the environment may already be populated.
    let _ = dotenvy::dotenv();

    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name("config/default").required(false),
    };

    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix("BICAMERAL")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}
