//! Client-side workflow orchestration.
//!
//! This module owns the capture/match and upload/reveal state machines, the
//! detection polling loop and the command loop that binds user input to them.
//! Presentation layers only read state and forward commands.

mod controller;
pub(crate) mod poller;
pub(crate) mod scan;
pub(crate) mod session;
#[cfg(test)]
pub(crate) mod testing;
pub(crate) mod upload;

pub(crate) use controller::{
    run_scan_controller, run_upload_controller, ControllerOptions, ScanCommand, UploadOptions,
};

/// Result of a submit action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A request was issued.
    Started,
    /// A request is already pending; nothing was sent.
    InFlight,
    /// Preconditions not met; nothing was sent.
    Refused,
}
