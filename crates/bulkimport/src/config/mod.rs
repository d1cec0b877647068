pub mod loader;
pub mod schema;

pub use loader::{
    load_config, load_config_from_str, load_from_env, validate_config, ENV_CONFIG, ENV_DATABASE,
    ENV_LOCK_DIR, ENV_WORKER,
};
pub use schema::{default_database_path, ImporterConfig, StartFailurePolicy};
