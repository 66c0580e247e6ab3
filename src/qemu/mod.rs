pub mod arch;
pub mod fdset;
pub mod launcher;
pub mod machine;

pub use arch::{Arch, ArchProfile};
pub use fdset::ExtraFiles;
pub use launcher::{ConfigDelivery, LaunchRequest, Launcher};
pub use machine::Machine;
