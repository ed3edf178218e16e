//! Configuration management
//!
//! Node settings come from an optional TOML file, then environment
//! overrides. The resulting [`Config`] is handed to the node explicitly.

pub mod settings;

pub use settings::Config;
