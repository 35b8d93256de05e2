//! Workflow lifecycle drivers.
//!
//! Binds user commands and workflow events on one task and emits text lines
//! for presentation layers.

use crate::cli::OutputLine;
use crate::engine::load_images;
use crate::error::WorkflowError;
use crate::export;
use crate::orchestrator::scan::{ScanEvent, ScanPhase, ScanWorkflow};
use crate::orchestrator::upload::{UploadEvent, UploadPhase, UploadSequencer};
use crate::orchestrator::SubmitOutcome;
use crate::text_summary;
use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::str::FromStr;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Split a command line into its lowercased verb and the trimmed rest.
fn split_command(line: &str) -> (String, &str) {
    let line = line.trim();
    let (cmd, rest) = line
        .split_once(char::is_whitespace)
        .map(|(c, r)| (c, r.trim()))
        .unwrap_or((line, ""));
    (cmd.to_ascii_lowercase(), rest)
}

/// 1-based position typed by the user, as a zero-based index.
fn parse_position(rest: &str, usage: &str) -> Result<usize, String> {
    rest.parse::<usize>()
        .ok()
        .filter(|n| *n >= 1)
        .map(|n| n - 1)
        .ok_or_else(|| format!("usage: {usage}"))
}

/// Commands typed by the user while a scan workflow runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScanCommand {
    Capture,
    Contact(String),
    Submit,
    /// Zero-based index into the current result set.
    Download(usize),
    Dismiss,
    Retry,
    Status,
    Quit,
}

impl FromStr for ScanCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (cmd, rest) = split_command(line);
        match cmd.as_str() {
            "capture" | "c" => Ok(ScanCommand::Capture),
            "contact" => Ok(ScanCommand::Contact(rest.to_string())),
            "submit" | "s" => Ok(ScanCommand::Submit),
            "download" | "d" => parse_position(rest, "download <n>").map(ScanCommand::Download),
            "dismiss" => Ok(ScanCommand::Dismiss),
            "retry" | "r" => Ok(ScanCommand::Retry),
            "status" => Ok(ScanCommand::Status),
            "quit" | "q" | "exit" => Ok(ScanCommand::Quit),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

/// Commands typed by the user while an upload batch is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UploadCommand {
    /// Image file or directory of images.
    Add(PathBuf),
    /// Zero-based index into the batch.
    Remove(usize),
    Folder(String),
    Submit,
    Dismiss,
    Status,
    Quit,
}

impl FromStr for UploadCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (cmd, rest) = split_command(line);
        match cmd.as_str() {
            "add" | "a" if !rest.is_empty() => Ok(UploadCommand::Add(PathBuf::from(rest))),
            "add" | "a" => Err("usage: add <path>".to_string()),
            "remove" | "rm" => parse_position(rest, "remove <n>").map(UploadCommand::Remove),
            "folder" => Ok(UploadCommand::Folder(rest.to_string())),
            "submit" | "s" => Ok(UploadCommand::Submit),
            "dismiss" => Ok(UploadCommand::Dismiss),
            "status" | "list" | "ls" => Ok(UploadCommand::Status),
            "quit" | "q" | "exit" => Ok(UploadCommand::Quit),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

pub(crate) struct ControllerOptions {
    /// Contact id applied automatically once a frame is captured.
    pub preset_contact: Option<String>,
    /// Stop after the first result set (headless runs).
    pub exit_on_result: bool,
    pub download_dir: PathBuf,
}

pub(crate) struct UploadOptions {
    /// Submit the batch as soon as the controller starts.
    pub submit_on_start: bool,
}

fn say(out: &UnboundedSender<OutputLine>, line: impl Into<String>) {
    let _ = out.send(OutputLine::Stderr(line.into()));
}

/// Drive a scan workflow from user commands until quit, Ctrl-C, or (in
/// headless mode) the first result.
pub(crate) async fn run_scan_controller(
    mut workflow: ScanWorkflow,
    mut events: UnboundedReceiver<ScanEvent>,
    mut cmd_rx: UnboundedReceiver<ScanCommand>,
    out: UnboundedSender<OutputLine>,
    opts: ControllerOptions,
) -> Result<()> {
    let mut input_closed = false;
    say(
        &out,
        format!(
            "Session {}: scanning for a face…",
            workflow.session().id
        ),
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let res = loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !input_closed => {
                match cmd {
                    Some(ScanCommand::Quit) => break Ok(()),
                    Some(cmd) => handle_scan_command(&mut workflow, cmd, &out, &opts),
                    None => {
                        // Input ended; headless runs keep going until a result arrives.
                        input_closed = true;
                        if !opts.exit_on_result {
                            break Ok(());
                        }
                    }
                }
            }
            Some(ev) = events.recv() => {
                let before = workflow.phase();
                if workflow.apply(ev) {
                    on_scan_transition(&mut workflow, before, &out, &opts);
                }
            }
            _ = &mut ctrl_c => {
                say(&out, "Interrupted");
                break Ok(());
            }
        }

        if opts.exit_on_result {
            if workflow.phase() == ScanPhase::Result {
                break Ok(());
            }
            if input_closed {
                if let Some(err) = headless_stall(&workflow) {
                    break Err(err);
                }
            }
        }
    };

    workflow.teardown();
    res
}

/// With input closed, the states that can only move on through a command
/// that will never come.
fn headless_stall(workflow: &ScanWorkflow) -> Option<anyhow::Error> {
    match workflow.phase() {
        ScanPhase::Scanning if !workflow.auto_capture() => Some(anyhow!(
            "input closed before a frame was captured (use --auto-capture)"
        )),
        ScanPhase::AwaitingIdentity => match workflow.last_error() {
            Some(e) => Some(anyhow!("match submission failed: {e}")),
            None if !workflow.identity().is_some_and(|i| i.is_valid()) => Some(anyhow!(
                "no contact id to submit (use --contact)"
            )),
            None => None,
        },
        _ => None,
    }
}

fn handle_scan_command(
    workflow: &mut ScanWorkflow,
    cmd: ScanCommand,
    out: &UnboundedSender<OutputLine>,
    opts: &ControllerOptions,
) {
    let before = workflow.phase();
    match cmd {
        ScanCommand::Capture => {
            if workflow.capture_frame() {
                on_scan_transition(workflow, before, out, opts);
            } else {
                say(out, "No face in view right now");
            }
        }
        ScanCommand::Contact(id) => {
            if workflow.set_contact(&id) {
                say(out, "Contact set; type `submit` to find your photos");
            } else {
                say(out, "Capture a frame first");
            }
        }
        ScanCommand::Submit => match workflow.submit() {
            SubmitOutcome::Started => say(out, "Searching for matching photos…"),
            SubmitOutcome::InFlight => say(out, "Already searching…"),
            SubmitOutcome::Refused => debug!(phase = %workflow.phase(), "submit unavailable"),
        },
        ScanCommand::Download(i) => {
            let saved = workflow
                .download(i)
                .map_err(anyhow::Error::from)
                .and_then(|art| export::write_artifact(&opts.download_dir, &art));
            match saved {
                Ok(path) => say(out, format!("Saved: {}", path.display())),
                Err(e) => say(out, format!("Download failed: {e:#}")),
            }
        }
        ScanCommand::Dismiss => {
            workflow.dismiss_error();
        }
        ScanCommand::Retry => {
            workflow.retry();
            say(
                out,
                format!("Session {}: scanning for a face…", workflow.session().id),
            );
        }
        ScanCommand::Status => say(out, text_summary::scan_status_line(workflow)),
        ScanCommand::Quit => {}
    }
}

fn on_scan_transition(
    workflow: &mut ScanWorkflow,
    before: ScanPhase,
    out: &UnboundedSender<OutputLine>,
    opts: &ControllerOptions,
) {
    match workflow.phase() {
        ScanPhase::Scanning => {
            if workflow.face_detected() {
                say(out, "Face detected: type `capture`");
            } else {
                say(out, "No face in view");
            }
        }
        ScanPhase::Captured => {
            let score = workflow.capture().map(|c| c.source_score).unwrap_or_default();
            say(out, format!("Captured (score {score:.2})"));
            workflow.request_identity();
            match opts.preset_contact.as_deref() {
                Some(contact) => {
                    workflow.set_contact(contact);
                    if workflow.submit() == SubmitOutcome::Started {
                        say(out, "Searching for matching photos…");
                    }
                }
                None => say(out, "Enter `contact <phone or email>` then `submit`"),
            }
        }
        ScanPhase::AwaitingIdentity => {
            if before == ScanPhase::Submitting {
                if let Some(e) = workflow.last_error() {
                    say(
                        out,
                        format!("Search failed: {e}. `submit` to try again, `dismiss` to hide"),
                    );
                }
            }
        }
        ScanPhase::Submitting => {}
        ScanPhase::Result => {
            for line in text_summary::match_lines(workflow.session(), workflow.matches()) {
                let _ = out.send(OutputLine::Stdout(line));
            }
            say(out, "`download <n>` saves a photo, `retry` starts over");
        }
    }
}

/// Drive an upload batch from user commands until the link is revealed.
/// A failed upload returns the batch to collecting so it can be fixed and
/// resubmitted; once input has closed, a batch left collecting is an error.
pub(crate) async fn run_upload_controller(
    mut seq: UploadSequencer,
    mut events: UnboundedReceiver<UploadEvent>,
    mut cmd_rx: UnboundedReceiver<UploadCommand>,
    out: UnboundedSender<OutputLine>,
    opts: UploadOptions,
) -> Result<String> {
    if opts.submit_on_start {
        submit_upload(&mut seq, &out);
    } else {
        say(&out, "`add <path>`, `folder <name>`, then `submit`");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut input_closed = false;
    let res = loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !input_closed => {
                match cmd {
                    Some(UploadCommand::Quit) => break Err(anyhow!("upload cancelled")),
                    Some(cmd) => handle_upload_command(&mut seq, cmd, &out),
                    None => input_closed = true,
                }
            }
            Some(ev) = events.recv() => {
                if seq.apply(ev) {
                    match seq.phase() {
                        UploadPhase::Collecting => {
                            if let Some(e) = seq.error() {
                                say(&out, format!(
                                    "Upload failed: {e}. `submit` to try again, `dismiss` to hide"
                                ));
                            }
                        }
                        UploadPhase::Revealed => {
                            break seq
                                .link()
                                .map(str::to_owned)
                                .ok_or_else(|| anyhow!("revealed without a link"));
                        }
                        phase => {
                            let line = text_summary::upload_progress_line(phase, seq.progress());
                            let _ = out.send(OutputLine::Progress(line));
                        }
                    }
                }
            }
            _ = &mut ctrl_c => break Err(anyhow!("upload cancelled")),
        }

        if input_closed && seq.phase() == UploadPhase::Collecting {
            break Err(match seq.error() {
                Some(e) => anyhow!("upload failed: {e}"),
                None => refusal(&seq),
            });
        }
    };

    seq.teardown();
    res
}

fn submit_upload(seq: &mut UploadSequencer, out: &UnboundedSender<OutputLine>) {
    match seq.submit() {
        SubmitOutcome::Started => say(
            out,
            format!(
                "Uploading {} image(s) to folder {}",
                seq.items().len(),
                seq.folder_name()
            ),
        ),
        SubmitOutcome::InFlight => say(out, "Already uploading…"),
        SubmitOutcome::Refused => say(out, format!("Cannot upload yet: {}", refusal(seq))),
    }
}

/// Why a collecting batch cannot be submitted.
fn refusal(seq: &UploadSequencer) -> anyhow::Error {
    if seq.items().is_empty() {
        WorkflowError::EmptyBatch.into()
    } else if seq.folder_name().is_empty() {
        WorkflowError::MissingFolderName.into()
    } else {
        anyhow!("input closed before the batch was submitted")
    }
}

fn handle_upload_command(
    seq: &mut UploadSequencer,
    cmd: UploadCommand,
    out: &UnboundedSender<OutputLine>,
) {
    if seq.phase() != UploadPhase::Collecting
        && matches!(
            cmd,
            UploadCommand::Add(_) | UploadCommand::Remove(_) | UploadCommand::Folder(_)
        )
    {
        say(out, "The batch is frozen while it uploads");
        return;
    }
    match cmd {
        UploadCommand::Add(path) => match load_images(&[path]) {
            Ok(items) => {
                let added = items.len();
                for item in items {
                    seq.add_item(item);
                }
                say(out, format!("Added {added} image(s), {} in batch", seq.items().len()));
            }
            Err(e) => say(out, format!("Cannot add: {e}")),
        },
        UploadCommand::Remove(i) => match seq.remove_item(i) {
            Some(item) => say(out, format!("Removed {}", item.file_name)),
            None => say(out, format!("No image #{}", i + 1)),
        },
        UploadCommand::Folder(name) => {
            seq.set_folder_name(&name);
            say(out, format!("Folder: {}", seq.folder_name()));
        }
        UploadCommand::Submit => submit_upload(seq, out),
        UploadCommand::Dismiss => {
            seq.dismiss_error();
        }
        UploadCommand::Status => {
            for line in text_summary::upload_status_lines(seq) {
                say(out, line);
            }
        }
        UploadCommand::Quit => {}
    }
}
