use crate::engine::{load_images, HttpFaceModel, ReadyModel, ServiceClient, StillFrames};
use crate::export;
use crate::model::WorkflowConfig;
use crate::orchestrator::scan::ScanWorkflow;
use crate::orchestrator::session::SessionSource;
use crate::orchestrator::upload::UploadSequencer;
use crate::orchestrator::{
    run_scan_controller, run_upload_controller, ControllerOptions, ScanCommand, UploadOptions,
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Output line routing for stdout/stderr writer.
pub(crate) enum OutputLine {
    Stdout(String),
    Stderr(String),
    /// Status line for stderr, dropped when it repeats the previous one.
    Progress(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());
        write_lines(&mut rx, &mut out, &mut err);
    });
    (tx, handle)
}

/// Drain `rx` until every sender is gone. Consecutive identical progress
/// lines are written once.
fn write_lines(
    rx: &mut mpsc::UnboundedReceiver<OutputLine>,
    out: &mut impl Write,
    err: &mut impl Write,
) {
    let mut last_progress: Option<String> = None;
    while let Some(line) = rx.blocking_recv() {
        match line {
            OutputLine::Stdout(msg) => {
                last_progress = None;
                let _ = writeln!(out, "{msg}");
            }
            OutputLine::Stderr(msg) => {
                last_progress = None;
                let _ = writeln!(err, "{msg}");
            }
            OutputLine::Progress(msg) => {
                if last_progress.as_deref() != Some(msg.as_str()) {
                    let _ = writeln!(err, "{msg}");
                    last_progress = Some(msg);
                }
            }
        }
    }

    let _ = out.flush();
    let _ = err.flush();
}

/// Read commands from stdin on a plain thread; the channel closes at EOF.
///
/// The thread is detached: a blocked `read_line` cannot be cancelled, so the
/// process exits without joining it. It only holds a weak handle to the
/// output channel so the writer can still drain and finish.
fn spawn_input_reader<C>(out: &mpsc::UnboundedSender<OutputLine>) -> mpsc::UnboundedReceiver<C>
where
    C: FromStr<Err = String> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let out = out.downgrade();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<C>() {
                Ok(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                Err(msg) => {
                    if let Some(out) = out.upgrade() {
                        let _ = out.send(OutputLine::Stderr(msg));
                    }
                }
            }
        }
    });
    rx
}

/// Contact ids must carry something besides whitespace.
fn non_blank(s: &str) -> Result<String, String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        Err("must not be blank".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "facelens",
    version,
    about = "Find your photos by face, or upload a batch of event photos"
)]
pub struct Cli {
    /// Base URL of the matching/upload service
    #[arg(long, global = true, default_value = "http://127.0.0.1:5000")]
    pub service_url: String,

    /// Use a fixed session id instead of generating one
    #[arg(long, global = true)]
    pub session: Option<String>,

    /// Log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Scan frames for a face, capture one and look up matching photos
    Scan(ScanArgs),
    /// Upload a batch of images and print the session link
    Upload(UploadArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ScanArgs {
    /// Image file or directory of images used as the camera feed
    #[arg(long)]
    pub frames: PathBuf,

    /// Base URL of the face detection model server
    #[arg(long, default_value = "http://127.0.0.1:8500")]
    pub model_url: String,

    /// Interval between detection probes
    #[arg(long, default_value = "500ms")]
    pub poll_interval: humantime::Duration,

    /// Capture automatically on the first detected face
    #[arg(long)]
    pub auto_capture: bool,

    /// Contact id submitted automatically after capture
    #[arg(long, value_parser = non_blank)]
    pub contact: Option<String>,

    /// Exit after the first result set (no interactive prompt needed)
    #[arg(long)]
    pub once: bool,

    /// Where `download` writes files (defaults to the user's download directory)
    #[arg(long)]
    pub download_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct UploadArgs {
    /// Image files or directories to upload (more can be added with `add <path>`)
    pub files: Vec<PathBuf>,

    /// Folder name on the service (defaults to the session id)
    #[arg(long)]
    pub folder: Option<String>,

    /// Base URL used to build the shareable session link
    #[arg(long, default_value = "http://localhost:5173")]
    pub share_url: String,

    /// Processing animation step
    #[arg(long, default_value = "50ms")]
    pub animation_step: humantime::Duration,

    /// Percentage points added per animation step
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub animation_increment: u8,

    /// Pause between reaching 100% and showing the link
    #[arg(long, default_value = "500ms")]
    pub reveal_delay: humantime::Duration,

    /// Copy the session link to the clipboard
    #[arg(long)]
    pub copy_link: bool,

    /// Wait for a `submit` command instead of uploading right away
    #[arg(long)]
    pub hold: bool,
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    match args.command {
        Command::Scan(scan) => run_scan(cfg, scan).await,
        Command::Upload(upload) => run_upload(cfg, upload).await,
    }
}

/// Build a `WorkflowConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> WorkflowConfig {
    let mut cfg = WorkflowConfig {
        service_url: args.service_url.clone(),
        session_id: args.session.clone(),
        ..WorkflowConfig::default()
    };
    match &args.command {
        Command::Scan(scan) => {
            cfg.model_url = scan.model_url.clone();
            cfg.poll_interval = Duration::from(scan.poll_interval);
            cfg.auto_capture = scan.auto_capture;
            cfg.download_dir = scan
                .download_dir
                .clone()
                .or_else(dirs::download_dir)
                .unwrap_or_else(|| PathBuf::from("."));
        }
        Command::Upload(upload) => {
            cfg.share_url = upload.share_url.clone();
            cfg.animation_step = Duration::from(upload.animation_step);
            cfg.animation_increment = upload.animation_increment;
            cfg.reveal_delay = Duration::from(upload.reveal_delay);
        }
    }
    cfg
}

async fn run_scan(cfg: WorkflowConfig, args: ScanArgs) -> Result<()> {
    let frames = StillFrames::from_path(&args.frames)
        .with_context(|| format!("failed to load frames from {}", args.frames.display()))?;
    let model = HttpFaceModel::new(&cfg).context("failed to build model client")?;
    let model = ReadyModel::load(Arc::new(model))
        .await
        .context("face detection model is not available")?;
    let client = ServiceClient::new(&cfg).context("failed to build service client")?;

    let (out_tx, out_handle) = spawn_output_writer();
    let cmd_rx = spawn_input_reader::<ScanCommand>(&out_tx);
    let (workflow, events) = ScanWorkflow::start(
        &cfg,
        SessionSource::new(cfg.session_id.clone()),
        model,
        Arc::new(frames),
        Arc::new(client),
    );
    let opts = ControllerOptions {
        preset_contact: args.contact.clone(),
        exit_on_result: args.once,
        download_dir: cfg.download_dir.clone(),
    };

    let res = run_scan_controller(workflow, events, cmd_rx, out_tx, opts).await;
    let _ = out_handle.await;
    res
}

async fn run_upload(cfg: WorkflowConfig, args: UploadArgs) -> Result<()> {
    let items = load_images(&args.files).context("failed to read images")?;
    let client = ServiceClient::new(&cfg).context("failed to build service client")?;
    let session = SessionSource::new(cfg.session_id.clone()).next();
    let folder = args.folder.clone().unwrap_or_else(|| session.id.clone());

    let (out_tx, out_handle) = spawn_output_writer();
    let cmd_rx = spawn_input_reader(&out_tx);
    let (mut seq, events) = UploadSequencer::new(&cfg, session, Arc::new(client));
    for item in items {
        seq.add_item(item);
    }
    seq.set_folder_name(&folder);
    let opts = UploadOptions {
        submit_on_start: !args.hold,
    };

    let res = run_upload_controller(seq, events, cmd_rx, out_tx.clone(), opts).await;
    if let Ok(link) = &res {
        let _ = out_tx.send(OutputLine::Stdout(link.clone()));
        if args.copy_link {
            let text = link.clone();
            let copied = tokio::task::spawn_blocking(move || export::copy_to_clipboard(&text))
                .await
                .context("clipboard task failed")
                .and_then(|r| r);
            match copied {
                Ok(()) => {
                    let _ = out_tx.send(OutputLine::Stderr("Link copied to clipboard".into()));
                }
                Err(e) => warn!(error = %e, "clipboard copy failed"),
            }
        }
    }
    drop(out_tx);
    let _ = out_handle.await;
    res.map(|_| ())
}
