pub mod breaker_state;
pub mod global_config;
pub mod provider;
pub mod request_body;
pub mod request_log;

pub use breaker_state::Entity as BreakerStates;
pub use global_config::Entity as GlobalConfigs;
pub use provider::Entity as Providers;
pub use request_body::Entity as RequestBodies;
pub use request_log::Entity as RequestLogs;
