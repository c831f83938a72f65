// rdasync-common - Shared vocabulary for the async RESP client
//
// Error taxonomy, command/reply values, connection options and service config.

pub mod config;
pub mod error;
pub mod options;
pub mod types;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use options::*;
pub use types::*;
