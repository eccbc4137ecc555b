// Connector registry, typed actions and the executor that runs them

pub mod builtin;
pub mod executor;
pub mod redact;
pub mod registry;

pub use builtin::register_builtin_connectors;
pub use executor::{ConnectorExecutor, RATE_LIMITED_ATTEMPTS};
pub use redact::{redact_secrets, REDACTED};
pub use registry::{
    Action, ActionInfo, AuthKind, ConnectorDefinition, ConnectorInfo, ConnectorRegistry,
    ExecutionContext, RateLimitPolicy,
};
