//! Out-of-band recording control.
//!
//! A recording session is steered by three edge-triggered events: save the
//! current episode, start the next one, and exit. Events arrive from a
//! [`SignalSource`] polled on a background thread by [`SignalWatcher`]; the
//! watcher only raises flags in [`ControlEvents`], the control loop consumes
//! them at tick boundaries.
//!
//! [`FileFlags`] is the default source: a small directory where an operator
//! (or the `record-control` binary) touches `save_episode`, `next_episode`
//! or `exit_recording`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default flag polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One operator request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    /// Finish and save the episode being recorded.
    SaveEpisode,
    /// Leave the parking hold and start the next episode.
    NextEpisode,
    /// Stop the whole session.
    Exit,
}

impl ControlSignal {
    /// All signals, in polling order.
    pub const ALL: [ControlSignal; 3] = [
        ControlSignal::SaveEpisode,
        ControlSignal::NextEpisode,
        ControlSignal::Exit,
    ];

    /// Flag file name used by [`FileFlags`].
    pub fn file_name(self) -> &'static str {
        match self {
            ControlSignal::SaveEpisode => "save_episode",
            ControlSignal::NextEpisode => "next_episode",
            ControlSignal::Exit => "exit_recording",
        }
    }
}

#[derive(Debug, Default)]
struct Flags {
    save: AtomicBool,
    next: AtomicBool,
    exit: AtomicBool,
}

/// Pending control events, shared between the watcher and the control loop.
///
/// Save and next-episode are consumed by [`take`](Self::take). Exit is sticky:
/// once raised it stays visible through [`exit_requested`](Self::exit_requested).
#[derive(Clone, Debug, Default)]
pub struct ControlEvents {
    flags: Arc<Flags>,
}

impl ControlEvents {
    /// No pending events.
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, signal: ControlSignal) -> &AtomicBool {
        match signal {
            ControlSignal::SaveEpisode => &self.flags.save,
            ControlSignal::NextEpisode => &self.flags.next,
            ControlSignal::Exit => &self.flags.exit,
        }
    }

    /// Mark an event as pending.
    pub fn raise(&self, signal: ControlSignal) {
        self.flag(signal).store(true, Ordering::SeqCst);
    }

    /// Consume a pending event, returning whether it was set.
    pub fn take(&self, signal: ControlSignal) -> bool {
        self.flag(signal).swap(false, Ordering::SeqCst)
    }

    /// Whether an event is pending, without consuming it.
    pub fn is_raised(&self, signal: ControlSignal) -> bool {
        self.flag(signal).load(Ordering::SeqCst)
    }

    /// Whether exit has been requested.
    pub fn exit_requested(&self) -> bool {
        self.is_raised(ControlSignal::Exit)
    }

    /// Drop pending save and next-episode events.
    pub fn clear_transient(&self) {
        self.flags.save.store(false, Ordering::SeqCst);
        self.flags.next.store(false, Ordering::SeqCst);
    }
}

/// A pollable source of control signals.
pub trait SignalSource: Send {
    /// Return the signals that arrived since the last poll.
    fn poll(&mut self) -> Result<Vec<ControlSignal>>;
}

/// Flag files in a control directory. A flag is removed once observed.
#[derive(Clone, Debug)]
pub struct FileFlags {
    dir: PathBuf,
}

impl FileFlags {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating control directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Control directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the flag file for `signal`.
    pub fn path(&self, signal: ControlSignal) -> PathBuf {
        self.dir.join(signal.file_name())
    }

    /// Remove flags left over from an earlier run.
    pub fn clear_stale(&self) -> Result<()> {
        for signal in ControlSignal::ALL {
            let path = self.path(signal);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing stale flag {}", path.display()))?;
                tracing::info!("Removed stale control flag {}", signal.file_name());
            }
        }
        Ok(())
    }

    /// Raise `signal` by creating its flag file.
    pub fn touch(&self, signal: ControlSignal) -> Result<()> {
        let path = self.path(signal);
        std::fs::write(&path, b"")
            .with_context(|| format!("writing control flag {}", path.display()))
    }
}

impl SignalSource for FileFlags {
    fn poll(&mut self) -> Result<Vec<ControlSignal>> {
        let mut seen = Vec::new();
        for signal in ControlSignal::ALL {
            let path = self.path(signal);
            if path.exists() {
                // Another poller may have won the race; that still counts.
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("removing control flag {}", path.display()))
                    }
                }
                seen.push(signal);
            }
        }
        Ok(seen)
    }
}

/// Background thread that polls a [`SignalSource`] into [`ControlEvents`].
pub struct SignalWatcher {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    /// Start polling `source` every `interval`.
    pub fn spawn<S: SignalSource + 'static>(
        mut source: S,
        events: ControlEvents,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = std::thread::spawn(move || {
            while !token.is_cancelled() {
                match source.poll() {
                    Ok(signals) => {
                        for signal in signals {
                            tracing::info!("Control signal: {:?}", signal);
                            events.raise(signal);
                        }
                    }
                    Err(e) => tracing::warn!("Control signal poll failed: {:#}", e),
                }
                std::thread::sleep(interval);
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop polling and join the thread.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Control signal watcher panicked");
            }
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_events_are_edge_triggered() {
        let events = ControlEvents::new();
        assert!(!events.take(ControlSignal::SaveEpisode));
        events.raise(ControlSignal::SaveEpisode);
        assert!(events.take(ControlSignal::SaveEpisode));
        assert!(!events.take(ControlSignal::SaveEpisode));

        events.raise(ControlSignal::NextEpisode);
        events.raise(ControlSignal::Exit);
        events.clear_transient();
        assert!(!events.is_raised(ControlSignal::NextEpisode));
        assert!(events.exit_requested());
    }

    #[test]
    fn test_file_flags_are_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let mut flags = FileFlags::new(dir.path().join("control")).unwrap();
        flags.touch(ControlSignal::NextEpisode).unwrap();
        flags.touch(ControlSignal::Exit).unwrap();

        let seen = flags.poll().unwrap();
        assert_eq!(seen, vec![ControlSignal::NextEpisode, ControlSignal::Exit]);
        assert!(!flags.path(ControlSignal::Exit).exists());
        assert!(flags.poll().unwrap().is_empty());
    }

    #[test]
    fn test_clear_stale_flags() {
        let dir = tempfile::tempdir().unwrap();
        let flags = FileFlags::new(dir.path()).unwrap();
        flags.touch(ControlSignal::SaveEpisode).unwrap();
        flags.clear_stale().unwrap();
        assert!(!flags.path(ControlSignal::SaveEpisode).exists());
    }

    #[test]
    fn test_watcher_raises_events() {
        let dir = tempfile::tempdir().unwrap();
        let flags = FileFlags::new(dir.path()).unwrap();
        let events = ControlEvents::new();
        let mut watcher =
            SignalWatcher::spawn(flags.clone(), events.clone(), Duration::from_millis(5));
        flags.touch(ControlSignal::SaveEpisode).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !events.is_raised(ControlSignal::SaveEpisode) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        watcher.stop();
        assert!(events.take(ControlSignal::SaveEpisode));
    }
}
