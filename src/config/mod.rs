//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RelayConfig (validated, immutable)
//!     → handed to Relay::build, which sizes every subsystem from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, AuditConfig, CircuitBreakerConfig, DeliveryConfig, HealthConfig, HealthTarget,
    ObservabilityConfig, RateLimitConfig, RelayConfig, RetryConfig, SubscriptionConfig,
    TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
