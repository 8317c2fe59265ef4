pub mod broker;
pub mod job_handler;

pub use broker::*;
pub use job_handler::*;
