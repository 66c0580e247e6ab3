pub mod spawn;

pub use spawn::cmd_spawn;
