//! Request admission and queueing

pub mod admission;

pub use admission::{AdmissionController, AdmissionSlot, AdmissionStats, ReleaseReason};
