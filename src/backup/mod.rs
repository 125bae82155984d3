pub(crate) mod artifact;
mod cycle;
mod dump;
mod retention;
mod scheduler;

pub use artifact::BackupArtifact;
pub use cycle::BackupCycle;
pub use scheduler::run_scheduler;
