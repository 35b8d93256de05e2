//! Text lines for CLI output.
//!
//! Formats result sets, workflow status and upload progress for text mode.

use crate::metrics;
use crate::model::{MatchResult, ProgressState, Session};
use crate::orchestrator::scan::{ScanState, ScanWorkflow};
use crate::orchestrator::upload::{UploadPhase, UploadSequencer, UploadState};

const BAR_WIDTH: usize = 20;

/// Result set in service order, followed by a similarity summary.
pub(crate) fn match_lines(session: &Session, matches: &[MatchResult]) -> Vec<String> {
    if matches.is_empty() {
        return vec![format!("No matching photos found (session {})", session.id)];
    }

    let mut lines = Vec::with_capacity(matches.len() + 2);
    lines.push(format!(
        "{} matching photo(s) (session {})",
        matches.len(),
        session.id
    ));
    for (i, m) in matches.iter().enumerate() {
        lines.push(format!(
            "{:>3}. {:>5.1}%  {}",
            i + 1,
            m.similarity * 100.0,
            m.filename.as_deref().unwrap_or("-")
        ));
    }

    let values: Vec<f64> = matches.iter().map(|m| m.similarity).collect();
    if let Some((best, mean, median)) = metrics::compute_similarity_metrics(&values) {
        lines.push(format!(
            "Similarity: best {:.1}% avg {:.1}% med {:.1}%",
            best * 100.0,
            mean * 100.0,
            median * 100.0
        ));
    }
    lines
}

pub(crate) fn scan_status_line(wf: &ScanWorkflow) -> String {
    let mut line = format!("[{}] session {}", wf.phase(), wf.session().id);
    if wf.is_polling() {
        line.push_str(if wf.face_detected() {
            ", face detected"
        } else {
            ", no face"
        });
        if let ScanState::Scanning {
            snapshot: Some(snap),
            ..
        } = wf.state()
        {
            line.push_str(&format!(" (last face score {:.2})", snap.score));
        }
    }
    if let Some(identity) = wf.identity() {
        if identity.is_valid() {
            line.push_str(&format!(", contact {}", identity.contact_id.trim()));
        }
    }
    if !wf.matches().is_empty() {
        line.push_str(&format!(", {} match(es)", wf.matches().len()));
    }
    if let Some(e) = wf.last_error() {
        line.push_str(&format!(", error: {e}"));
    }
    line
}

pub(crate) fn upload_progress_line(phase: UploadPhase, progress: ProgressState) -> String {
    let pct = match phase {
        UploadPhase::Processing | UploadPhase::Revealed => progress.animation_percent,
        UploadPhase::Collecting | UploadPhase::Submitting => progress.network_percent,
    };
    format!("{:<10} {} {:>3}%", phase.to_string(), bar(pct), pct)
}

/// Batch status followed by one line per queued image.
pub(crate) fn upload_status_lines(seq: &UploadSequencer) -> Vec<String> {
    let folder = match seq.folder_name() {
        "" => "(not set)",
        name => name,
    };
    let mut head = format!(
        "[{}] session {}, folder {}",
        seq.phase(),
        seq.session().id,
        folder
    );
    match seq.state() {
        UploadState::Collecting { error, .. } => {
            if let Some(e) = error {
                head.push_str(&format!(", error: {e}"));
            }
        }
        UploadState::Submitting { progress, .. } => {
            head.push_str(&format!(", sent {}%", progress.network_percent));
        }
        UploadState::Processing { progress, .. } => {
            head.push_str(&format!(", processing {}%", progress.animation_percent));
            if !seq.animation_running() {
                head.push_str(", finishing");
            }
        }
        UploadState::Revealed { link, .. } => head.push_str(&format!(", link {link}")),
    }

    let mut lines = vec![head];
    for (i, item) in seq.items().iter().enumerate() {
        let source = item
            .preview
            .as_deref()
            .map(|p| format!("  {}", p.display()))
            .unwrap_or_default();
        lines.push(format!(
            "{:>3}. {} ({} bytes){source}",
            i + 1,
            item.file_name,
            item.data.len()
        ));
    }
    lines
}

fn bar(pct: u8) -> String {
    let filled = usize::from(pct.min(100)) * BAR_WIDTH / 100;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(BAR_WIDTH - filled))
}
