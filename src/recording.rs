//! Episode recording sinks.
//!
//! A session writes each tick as a [`RecordedFrame`] into a [`RecordingSink`].
//! Frames of the episode in progress are only kept once the episode is saved;
//! a discarded episode leaves nothing behind.

use crate::camera::CameraFrame;
use crate::types::{ArmCommand, ArmState};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

/// One recorded control tick.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedFrame {
    /// Episode index.
    pub episode: u32,
    /// Frame index within the episode.
    pub index: u64,
    /// Seconds since the episode started.
    pub timestamp_s: f64,
    /// Follower state read this tick.
    pub observation: ArmState,
    /// Leader state read this tick.
    pub leader: ArmState,
    /// Command applied to the follower.
    pub action: ArmCommand,
    /// Latest camera frames.
    pub images: Vec<CameraFrame>,
}

/// Destination of recorded episodes.
pub trait RecordingSink {
    /// Begin a new episode.
    fn start_episode(&mut self, episode: u32, task: &str) -> Result<()>;

    /// Append a frame to the episode in progress.
    fn add_frame(&mut self, frame: &RecordedFrame) -> Result<()>;

    /// Keep the episode in progress; returns its frame count.
    fn save_episode(&mut self) -> Result<u64>;

    /// Drop the episode in progress.
    fn discard_episode(&mut self) -> Result<()>;

    /// Flush everything; no further calls are made.
    fn finalize(&mut self) -> Result<()>;

    /// Number of saved episodes.
    fn episodes_saved(&self) -> usize;
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Saved episodes, in order.
    pub episodes: Vec<Vec<RecordedFrame>>,
    current: Option<Vec<RecordedFrame>>,
    /// Number of discarded episodes.
    pub discarded: usize,
    /// Set by `finalize`.
    pub finalized: bool,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames in the episode being recorded.
    pub fn pending(&self) -> usize {
        self.current.as_ref().map_or(0, Vec::len)
    }
}

impl RecordingSink for MemorySink {
    fn start_episode(&mut self, _episode: u32, _task: &str) -> Result<()> {
        if self.current.is_some() {
            bail!("episode already in progress");
        }
        self.current = Some(Vec::new());
        Ok(())
    }

    fn add_frame(&mut self, frame: &RecordedFrame) -> Result<()> {
        match self.current.as_mut() {
            Some(frames) => {
                frames.push(frame.clone());
                Ok(())
            }
            None => bail!("no episode in progress"),
        }
    }

    fn save_episode(&mut self) -> Result<u64> {
        let frames = self.current.take().context("no episode to save")?;
        let n = frames.len() as u64;
        self.episodes.push(frames);
        Ok(n)
    }

    fn discard_episode(&mut self) -> Result<()> {
        if self.current.take().is_some() {
            self.discarded += 1;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.finalized = true;
        Ok(())
    }

    fn episodes_saved(&self) -> usize {
        self.episodes.len()
    }
}

/// One line of an episode file.
#[derive(Debug, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Episode index.
    pub episode: u32,
    /// Frame index.
    pub index: u64,
    /// Seconds since episode start.
    pub timestamp_s: f64,
    /// Follower state.
    pub observation: ArmState,
    /// Leader state.
    pub leader: ArmState,
    /// Applied command.
    pub action: ArmCommand,
    /// Image file per camera, relative to the dataset root.
    pub images: Vec<String>,
}

/// Per-episode summary in `meta.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMeta {
    /// Episode index.
    pub episode: u32,
    /// Number of frames.
    pub frames: u64,
    /// Episode file, relative to the dataset root.
    pub file: String,
    /// Task description.
    pub task: String,
}

/// Dataset description written on every save.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    /// Recording rate.
    pub fps: f64,
    /// Saved episodes.
    pub episodes: Vec<EpisodeMeta>,
}

struct OpenEpisode {
    episode: u32,
    task: String,
    frames: u64,
    writer: BufWriter<File>,
    partial: PathBuf,
    /// Image directory relative to the dataset root.
    image_dir: PathBuf,
}

#[cfg(feature = "image")]
const IMAGE_EXT: &str = "jpg";
#[cfg(not(feature = "image"))]
const IMAGE_EXT: &str = "rgb";

type Encoder = Box<dyn Fn(&CameraFrame) -> Result<Vec<u8>> + Send>;

fn encode_image(frame: &CameraFrame) -> Result<Vec<u8>> {
    #[cfg(feature = "image")]
    {
        frame.to_jpeg(90)
    }
    #[cfg(not(feature = "image"))]
    {
        Ok(frame.data.clone())
    }
}

fn write_image(encode: &Encoder, path: &Path, frame: &CameraFrame) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let bytes = encode(frame)?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

enum ImageJob {
    Write { path: PathBuf, frame: CameraFrame },
    /// Answered once every earlier job is done, with the first failure since
    /// the previous flush.
    Flush(mpsc::Sender<Option<String>>),
}

/// Encodes and writes camera images on a background thread; callers only
/// enqueue.
struct ImageWriter {
    tx: Option<mpsc::Sender<ImageJob>>,
    handle: Option<JoinHandle<()>>,
}

impl ImageWriter {
    fn spawn(encode: Encoder) -> Self {
        let (tx, rx) = mpsc::channel::<ImageJob>();
        let handle = std::thread::spawn(move || {
            let mut failure: Option<String> = None;
            for job in rx {
                match job {
                    ImageJob::Write { path, frame } => {
                        if let Err(e) = write_image(&encode, &path, &frame) {
                            tracing::warn!("Image {} dropped: {:#}", path.display(), e);
                            failure.get_or_insert_with(|| format!("{:#}", e));
                        }
                    }
                    ImageJob::Flush(reply) => {
                        let _ = reply.send(failure.take());
                    }
                }
            }
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn send(&self, job: ImageJob) -> Result<()> {
        self.tx
            .as_ref()
            .context("image writer stopped")?
            .send(job)
            .map_err(|_| anyhow::anyhow!("image writer thread exited"))
    }

    fn submit(&self, path: PathBuf, frame: CameraFrame) -> Result<()> {
        self.send(ImageJob::Write { path, frame })
    }

    /// Block until every queued image is on disk.
    fn drain(&self) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(ImageJob::Flush(reply_tx))?;
        match reply_rx.recv() {
            Ok(None) => Ok(()),
            Ok(Some(failure)) => bail!("image write failed: {}", failure),
            Err(_) => bail!("image writer thread exited"),
        }
    }
}

impl Drop for ImageWriter {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Writes `episode_NNNNNN.jsonl` files, camera images and a `meta.json`
/// under a dataset directory.
///
/// The episode in progress is written to a `.partial` file and renamed on
/// save. Images are JPEG with the `image` feature and raw RGB otherwise;
/// they are encoded and written on a worker thread and flushed on save,
/// discard and finalize.
pub struct JsonlSink {
    root: PathBuf,
    meta: DatasetMeta,
    open: Option<OpenEpisode>,
    images: ImageWriter,
}

impl JsonlSink {
    /// Create or reopen a dataset at `root`, appending to existing episodes.
    pub fn create(root: impl Into<PathBuf>, fps: f64) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating dataset directory {}", root.display()))?;
        let meta_path = root.join("meta.json");
        let meta = if meta_path.exists() {
            let content = std::fs::read_to_string(&meta_path)?;
            let meta: DatasetMeta = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", meta_path.display()))?;
            tracing::info!(
                "Resuming dataset {} with {} episodes",
                root.display(),
                meta.episodes.len()
            );
            meta
        } else {
            DatasetMeta {
                fps,
                episodes: Vec::new(),
            }
        };
        Ok(Self {
            root,
            meta,
            open: None,
            images: ImageWriter::spawn(Box::new(encode_image)),
        })
    }

    /// Dataset root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current metadata.
    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    fn episode_file(episode: u32) -> String {
        format!("episode_{:06}.jsonl", episode)
    }

    fn write_meta(&self) -> Result<()> {
        let path = self.root.join("meta.json");
        let tmp = self.root.join("meta.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.meta)?)?;
        std::fs::rename(&tmp, &path).with_context(|| format!("writing {}", path.display()))
    }

}

impl RecordingSink for JsonlSink {
    fn start_episode(&mut self, episode: u32, task: &str) -> Result<()> {
        if self.open.is_some() {
            bail!("episode already in progress");
        }
        let partial = self
            .root
            .join(format!("{}.partial", Self::episode_file(episode)));
        let file = File::create(&partial)
            .with_context(|| format!("creating {}", partial.display()))?;
        let image_dir = Path::new("images").join(format!("episode_{:06}", episode));
        self.open = Some(OpenEpisode {
            episode,
            task: task.to_string(),
            frames: 0,
            writer: BufWriter::new(file),
            partial,
            image_dir,
        });
        Ok(())
    }

    fn add_frame(&mut self, frame: &RecordedFrame) -> Result<()> {
        let image_dir = match self.open.as_ref() {
            Some(open) => open.image_dir.clone(),
            None => bail!("no episode in progress"),
        };
        let mut images = Vec::with_capacity(frame.images.len());
        for image in &frame.images {
            let rel = image_dir.join(format!("{}_{:06}.{}", image.name, frame.index, IMAGE_EXT));
            self.images.submit(self.root.join(&rel), image.clone())?;
            images.push(rel.to_string_lossy().into_owned());
        }

        let record = FrameRecord {
            episode: frame.episode,
            index: frame.index,
            timestamp_s: frame.timestamp_s,
            observation: frame.observation,
            leader: frame.leader,
            action: frame.action,
            images,
        };
        if let Some(open) = self.open.as_mut() {
            serde_json::to_writer(&mut open.writer, &record)?;
            open.writer.write_all(b"\n")?;
            open.frames += 1;
        }
        Ok(())
    }

    fn save_episode(&mut self) -> Result<u64> {
        if self.open.is_none() {
            bail!("no episode to save");
        }
        // A failed image write leaves the episode open for discard.
        self.images.drain()?;
        let mut open = self.open.take().context("no episode to save")?;
        open.writer.flush()?;
        let file = Self::episode_file(open.episode);
        std::fs::rename(&open.partial, self.root.join(&file))
            .with_context(|| format!("saving episode {}", open.episode))?;

        self.meta.episodes.retain(|e| e.episode != open.episode);
        self.meta.episodes.push(EpisodeMeta {
            episode: open.episode,
            frames: open.frames,
            file,
            task: open.task,
        });
        self.write_meta()?;
        tracing::info!("Episode {} saved ({} frames)", open.episode, open.frames);
        Ok(open.frames)
    }

    fn discard_episode(&mut self) -> Result<()> {
        if let Some(open) = self.open.take() {
            drop(open.writer);
            if let Err(e) = self.images.drain() {
                tracing::debug!("Discarded episode {}: {:#}", open.episode, e);
            }
            if open.partial.exists() {
                std::fs::remove_file(&open.partial)?;
            }
            let image_dir = self.root.join(&open.image_dir);
            if image_dir.exists() {
                std::fs::remove_dir_all(&image_dir)?;
            }
            tracing::info!("Episode {} discarded", open.episode);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.discard_episode()?;
        self.images.drain()?;
        self.write_meta()
    }

    fn episodes_saved(&self) -> usize {
        self.meta.episodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(episode: u32, index: u64) -> RecordedFrame {
        RecordedFrame {
            episode,
            index,
            timestamp_s: index as f64 / 30.0,
            observation: ArmState::new([0.1; 6], 10.0),
            leader: ArmState::new([1.0; 6], 1.0),
            action: ArmCommand::new([0.2; 6], 20.0),
            images: Vec::new(),
        }
    }

    fn with_image(episode: u32, index: u64) -> RecordedFrame {
        let mut f = frame(episode, index);
        f.images.push(CameraFrame {
            name: "front".into(),
            width: 2,
            height: 2,
            data: vec![50; 12],
            timestamp_us: 0,
        });
        f
    }

    #[test]
    fn test_memory_sink_save_and_discard() {
        let mut sink = MemorySink::new();
        sink.start_episode(0, "pick").unwrap();
        sink.add_frame(&frame(0, 0)).unwrap();
        sink.add_frame(&frame(0, 1)).unwrap();
        assert_eq!(sink.save_episode().unwrap(), 2);

        sink.start_episode(1, "pick").unwrap();
        sink.add_frame(&frame(1, 0)).unwrap();
        sink.discard_episode().unwrap();
        assert_eq!(sink.episodes_saved(), 1);
        assert_eq!(sink.discarded, 1);
        assert!(sink.add_frame(&frame(1, 1)).is_err());
    }

    #[test]
    fn test_jsonl_sink_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::create(dir.path(), 30.0).unwrap();
        sink.start_episode(0, "stack cups").unwrap();
        for i in 0..3 {
            sink.add_frame(&frame(0, i)).unwrap();
        }
        sink.save_episode().unwrap();

        sink.start_episode(1, "stack cups").unwrap();
        sink.add_frame(&frame(1, 0)).unwrap();
        sink.finalize().unwrap();

        let lines = std::fs::read_to_string(dir.path().join("episode_000000.jsonl")).unwrap();
        let records: Vec<FrameRecord> = lines
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].index, 2);
        assert_eq!(records[0].action.gripper, 20.0);
        assert!(!dir.path().join("episode_000001.jsonl").exists());
        assert!(!dir.path().join("episode_000001.jsonl.partial").exists());

        let reopened = JsonlSink::create(dir.path(), 30.0).unwrap();
        assert_eq!(reopened.episodes_saved(), 1);
        assert_eq!(reopened.meta().episodes[0].frames, 3);
        assert_eq!(reopened.meta().episodes[0].task, "stack cups");
    }

    #[test]
    fn test_jsonl_sink_writes_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::create(dir.path(), 30.0).unwrap();
        sink.start_episode(0, "t").unwrap();
        sink.add_frame(&with_image(0, 7)).unwrap();
        sink.save_episode().unwrap();

        let line = std::fs::read_to_string(dir.path().join("episode_000000.jsonl")).unwrap();
        let record: FrameRecord = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(record.images.len(), 1);
        assert!(dir.path().join(&record.images[0]).exists());
    }

    #[test]
    fn test_add_frame_does_not_wait_for_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::create(dir.path(), 30.0).unwrap();
        let (release, gate) = mpsc::channel::<()>();
        let gate = std::sync::Mutex::new(gate);
        sink.images = ImageWriter::spawn(Box::new(move |frame: &CameraFrame| -> Result<Vec<u8>> {
            gate.lock().unwrap().recv()?;
            Ok(frame.data.clone())
        }));

        sink.start_episode(0, "t").unwrap();
        sink.add_frame(&with_image(0, 0)).unwrap();
        sink.add_frame(&with_image(0, 1)).unwrap();

        // The encoder is still blocked on the first image.
        let image = |i: u64| {
            dir.path()
                .join("images/episode_000000")
                .join(format!("front_{:06}.{}", i, IMAGE_EXT))
        };
        assert!(!image(0).exists());

        release.send(()).unwrap();
        release.send(()).unwrap();
        assert_eq!(sink.save_episode().unwrap(), 2);
        assert!(image(0).exists());
        assert!(image(1).exists());
    }

    #[test]
    fn test_failed_image_write_fails_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::create(dir.path(), 30.0).unwrap();
        sink.images = ImageWriter::spawn(Box::new(
            |_: &CameraFrame| -> Result<Vec<u8>> { anyhow::bail!("encoder broke") },
        ));

        sink.start_episode(0, "t").unwrap();
        sink.add_frame(&with_image(0, 0)).unwrap();
        let err = sink.save_episode().unwrap_err();
        assert!(format!("{:#}", err).contains("encoder broke"));
        assert_eq!(sink.episodes_saved(), 0);

        sink.discard_episode().unwrap();
        assert!(!dir.path().join("episode_000000.jsonl.partial").exists());
        assert!(!dir.path().join("episode_000000.jsonl").exists());

        // The failure is reported once; the next episode saves normally.
        sink.start_episode(1, "t").unwrap();
        sink.add_frame(&frame(1, 0)).unwrap();
        assert_eq!(sink.save_episode().unwrap(), 1);
    }
}
