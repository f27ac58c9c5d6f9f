//! Per-partition machinery: read loop, supervision, lifecycle control, and
//! split handling.
//!
//! For each owned lease the controller runs one supervisor, which couples a
//! lease-renewer task with a processor task. The processor streams change
//! batches to the observer and checkpoints progress; the renewer keeps the
//! lease alive. The first terminal outcome wins, the other task is cancelled,
//! and the supervisor translates the outcome into a close reason and a lease
//! disposition (release, retire, or leave for the new owner).

mod controller;
mod processor;
mod supervisor;
mod synchronizer;

pub use controller::{HealthMonitoredController, PartitionController, PartitionLifecycle};
pub use processor::{PartitionProcessor, ProcessorOutcome, ProcessorSettings};
pub use supervisor::PartitionSupervisor;
pub use synchronizer::PartitionSynchronizer;
