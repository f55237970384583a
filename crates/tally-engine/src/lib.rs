pub mod coordinator;
pub mod mock;
pub mod orchestrator;
pub mod registry;
pub mod timeout;

pub use coordinator::SessionCoordinator;
pub use mock::MockGateway;
pub use orchestrator::{Reporter, ReporterOptions, StatsSnapshot};
pub use registry::OperationRegistry;
pub use timeout::TimeoutGateway;
