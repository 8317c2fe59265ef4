pub mod app;
pub mod shutdown;

pub use app::{builtin_registry, parse_args, Application};
pub use shutdown::ShutdownManager;
