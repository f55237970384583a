pub mod context;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod ids;
pub mod status;

pub use errors::ReportError;
pub use status::TestStatus;
