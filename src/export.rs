//! Writing downloaded matches to disk and handing links to the clipboard.

use crate::model::DownloadArtifact;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;

/// Write a downloaded match into `dir`, creating it if needed. An existing
/// file is never overwritten; the new one gets a timestamp (and, if that is
/// taken too, a counter) appended to its stem.
pub fn write_artifact(dir: &Path, artifact: &DownloadArtifact) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    // Service filenames may carry folders; only the last component lands on disk.
    let name = Path::new(&artifact.file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "match.jpg".to_string());

    let path = free_path(dir, &name)?;
    std::fs::write(&path, &artifact.bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

fn free_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]-[hour][minute][second]"))
        .context("format timestamp")?;
    let with_suffix = |suffix: String| match ext {
        Some(ext) => dir.join(format!("{stem}-{suffix}.{ext}")),
        None => dir.join(format!("{stem}-{suffix}")),
    };

    let stamped = with_suffix(stamp.clone());
    if !stamped.exists() {
        return Ok(stamped);
    }
    (1u32..)
        .map(|n| with_suffix(format!("{stamp}-{n}")))
        .find(|p| !p.exists())
        .context("no free file name")
}

#[cfg(feature = "clipboard")]
mod clipboard {
    use anyhow::{anyhow, Result};
    use std::sync::mpsc as std_mpsc;
    use std::sync::OnceLock;
    use std::time::Duration;

    /// Linux clipboard managers read the selection lazily; the owning
    /// `Clipboard` has to stay alive for a while after `set_text`.
    const HOLD: Duration = Duration::from_secs(2);
    const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

    struct CopyJob {
        text: String,
        reply: std_mpsc::Sender<Result<(), String>>,
    }

    static JOBS: OnceLock<std_mpsc::Sender<CopyJob>> = OnceLock::new();

    fn jobs() -> &'static std_mpsc::Sender<CopyJob> {
        JOBS.get_or_init(|| {
            let (tx, rx) = std_mpsc::channel::<CopyJob>();
            std::thread::spawn(move || {
                for job in rx {
                    let copied = arboard::Clipboard::new().and_then(|mut clipboard| {
                        clipboard.set_text(job.text.as_str())?;
                        Ok(clipboard)
                    });
                    match copied {
                        Ok(clipboard) => {
                            let _ = job.reply.send(Ok(()));
                            std::thread::sleep(HOLD);
                            drop(clipboard);
                        }
                        Err(e) => {
                            let _ = job.reply.send(Err(e.to_string()));
                        }
                    }
                }
            });
            tx
        })
    }

    /// Blocks until the clipboard thread has taken the text (not for the
    /// hold period).
    pub fn copy(text: &str) -> Result<()> {
        let (reply, answer) = std_mpsc::channel();
        jobs()
            .send(CopyJob {
                text: text.to_string(),
                reply,
            })
            .map_err(|_| anyhow!("clipboard thread is gone"))?;
        match answer.recv_timeout(REPLY_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!("clipboard unavailable: {e}")),
            Err(_) => Err(anyhow!("clipboard did not respond")),
        }
    }
}

/// Put `text` on the system clipboard.
#[cfg(feature = "clipboard")]
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    clipboard::copy(text)
}

#[cfg(not(feature = "clipboard"))]
pub fn copy_to_clipboard(_text: &str) -> Result<()> {
    Err(anyhow::anyhow!("built without clipboard support"))
}
