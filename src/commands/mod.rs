// ABOUTME: Command implementations for the CLI
// ABOUTME: Exports sync, validate, and init-config commands

pub mod init_config;
pub mod sync;
pub mod validate;

pub use init_config::init_config;
pub use sync::sync;
pub use validate::validate;
