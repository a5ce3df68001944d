mod isolate_provider;
mod judge;
mod provider;
mod simple_provider;

// Re-export the provider traits and the engine
pub use isolate_provider::IsolateProvider;
pub use judge::{INPUT_FILE, Judge, Judgement, normalize, outputs_match, run_timeout};
pub use provider::{CommandOutput, Environment, EnvironmentProvider, RunLimits};
pub use simple_provider::SimpleProvider;
