pub mod disk;
pub mod inject;

pub use disk::{into_anonymous, parse_size, DiskPreparer, DiskSpec};
pub use inject::Injector;
