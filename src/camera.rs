//! Camera side channel for recordings.
//!
//! Cameras run on their own threads: a [`CameraTap`] keeps capturing from a
//! [`FrameSource`] and retains only the newest frame, so the control loop can
//! sample images without ever waiting on a device.
//!
//! With the `camera` feature, [`V4lCamera`] captures from a Video4Linux2
//! device:
//!
//! ```rust,no_run
//! # #[cfg(feature = "camera")]
//! # fn main() -> anyhow::Result<()> {
//! use arx_teleop::camera::{CameraTap, V4lCamera};
//!
//! let camera = V4lCamera::open("front", "/dev/video0", 640, 480)?;
//! let tap = CameraTap::spawn(camera);
//! if let Some(frame) = tap.latest() {
//!     println!("{}: {}x{}", frame.name, frame.width, frame.height);
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "camera"))]
//! # fn main() {}
//! ```

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One RGB frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    /// Camera name.
    pub name: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// RGB8, row-major.
    pub data: Vec<u8>,
    /// Capture time in microseconds since the source was opened.
    pub timestamp_us: u64,
}

impl CameraFrame {
    /// Encode as JPEG.
    #[cfg(feature = "image")]
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        use image::{ImageBuffer, Rgb};

        let img: ImageBuffer<Rgb<u8>, _> =
            ImageBuffer::from_raw(self.width, self.height, self.data.as_slice())
                .ok_or_else(|| anyhow::anyhow!("frame {} has a short buffer", self.name))?;

        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality)
            .encode_image(&img)?;
        Ok(jpeg)
    }
}

/// Anything that produces frames on demand. `capture` may block.
pub trait FrameSource: Send {
    /// Camera name.
    fn name(&self) -> &str;

    /// Block until the next frame is available.
    fn capture(&mut self) -> Result<CameraFrame>;
}

/// Deterministic moving gradient, for `--sim` runs and tests.
pub struct TestPattern {
    name: String,
    width: u32,
    height: u32,
    period: Duration,
    frame: u64,
    start: Instant,
}

impl TestPattern {
    /// Emit `width`×`height` frames at most every `period`.
    pub fn new(name: impl Into<String>, width: u32, height: u32, period: Duration) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            period,
            frame: 0,
            start: Instant::now(),
        }
    }
}

impl FrameSource for TestPattern {
    fn name(&self) -> &str {
        &self.name
    }

    fn capture(&mut self) -> Result<CameraFrame> {
        std::thread::sleep(self.period);
        let shift = (self.frame % 256) as usize;
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h * 3];
        for (i, px) in data.chunks_exact_mut(3).enumerate() {
            let (x, y) = (i % w, i / w);
            px[0] = ((x + shift) % 256) as u8;
            px[1] = (y % 256) as u8;
            px[2] = shift as u8;
        }
        self.frame += 1;
        Ok(CameraFrame {
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            data,
            timestamp_us: self.start.elapsed().as_micros() as u64,
        })
    }
}

/// Background capture thread holding the most recent frame.
pub struct CameraTap {
    name: String,
    latest: Arc<Mutex<Option<CameraFrame>>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CameraTap {
    /// Start capturing from `source`.
    pub fn spawn<S: FrameSource + 'static>(mut source: S) -> Self {
        let name = source.name().to_string();
        let latest = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let slot = latest.clone();
        let token = cancel.clone();
        let thread_name = name.clone();
        let handle = std::thread::spawn(move || {
            let mut failures = 0u32;
            while !token.is_cancelled() {
                match source.capture() {
                    Ok(frame) => {
                        failures = 0;
                        if let Ok(mut slot) = slot.lock() {
                            *slot = Some(frame);
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        if failures == 1 || failures % 30 == 0 {
                            tracing::warn!(
                                "Camera {} capture error ({}x): {}",
                                thread_name,
                                failures,
                                e
                            );
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
            tracing::debug!("Camera {} capture thread stopped", thread_name);
        });

        Self {
            name,
            latest,
            cancel,
            handle: Some(handle),
        }
    }

    /// Camera name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Newest frame, if any has arrived yet. Never blocks on the device.
    pub fn latest(&self) -> Option<CameraFrame> {
        self.latest.lock().ok().and_then(|f| f.clone())
    }

    /// Stop the capture thread and wait for it.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Camera {} capture thread panicked", self.name);
            }
        }
    }
}

impl Drop for CameraTap {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Expand 8-bit greyscale to RGB.
pub fn grey_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let n = width as usize * height as usize;
    let mut rgb = Vec::with_capacity(n * 3);
    for &y in data.iter().take(n) {
        rgb.extend_from_slice(&[y, y, y]);
    }
    rgb.resize(n * 3, 0);
    rgb
}

/// Convert packed YUYV 4:2:2 to RGB (BT.601). Missing bytes decode as black.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut rgb = vec![0u8; w * h * 3];

    let convert = |y: f32, d: f32, e: f32| -> [u8; 3] {
        let c = y - 16.0;
        [
            (1.164 * c + 1.596 * e).clamp(0.0, 255.0) as u8,
            (1.164 * c - 0.392 * d - 0.813 * e).clamp(0.0, 255.0) as u8,
            (1.164 * c + 2.017 * d).clamp(0.0, 255.0) as u8,
        ]
    };

    for row in 0..h {
        for x in (0..w).step_by(2) {
            let idx = (row * w + x) * 2;
            let byte = |off: usize, missing: u8| yuyv.get(idx + off).copied().unwrap_or(missing) as f32;
            let (y0, u, y1, v) = (byte(0, 16), byte(1, 128), byte(2, 16), byte(3, 128));
            let (d, e) = (u - 128.0, v - 128.0);

            let p0 = (row * w + x) * 3;
            rgb[p0..p0 + 3].copy_from_slice(&convert(y0, d, e));
            if x + 1 < w {
                rgb[p0 + 3..p0 + 6].copy_from_slice(&convert(y1, d, e));
            }
        }
    }
    rgb
}

#[cfg(feature = "camera")]
pub use v4l_source::V4lCamera;

#[cfg(feature = "camera")]
mod v4l_source {
    use super::{grey_to_rgb, yuyv_to_rgb, CameraFrame, FrameSource};
    use anyhow::{Context, Result};
    use std::time::Instant;
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;
    use v4l::{Device, FourCC};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum PixelFormat {
        Mjpeg,
        Yuyv,
        Grey,
    }

    /// A V4L2 capture device.
    pub struct V4lCamera {
        name: String,
        stream: Stream<'static>,
        width: u32,
        height: u32,
        format: PixelFormat,
        start: Instant,
    }

    // v4l's mmap stream holds raw pointers but is only touched from one thread.
    unsafe impl Send for V4lCamera {}

    impl V4lCamera {
        /// Open `path`, preferring MJPEG and falling back to YUYV or greyscale.
        pub fn open(name: &str, path: &str, width: u32, height: u32) -> Result<Self> {
            let device =
                Device::with_path(path).with_context(|| format!("opening camera {}", path))?;
            let (format, pixel) = negotiate(&device, width, height)?;
            tracing::info!(
                "Camera {} on {}: {}x{} {:?}",
                name,
                path,
                format.width,
                format.height,
                pixel
            );

            // The stream borrows the device for its whole life.
            let device = Box::leak(Box::new(device));
            let stream = Stream::with_buffers(device, Type::VideoCapture, 4)?;

            Ok(Self {
                name: name.to_string(),
                stream,
                width: format.width,
                height: format.height,
                format: pixel,
                start: Instant::now(),
            })
        }
    }

    fn negotiate(device: &Device, width: u32, height: u32) -> Result<(v4l::Format, PixelFormat)> {
        let mut format = device.format()?;
        format.width = width;
        format.height = height;

        for (fourcc, pixel) in [(b"MJPG", PixelFormat::Mjpeg), (b"YUYV", PixelFormat::Yuyv)] {
            format.fourcc = FourCC::new(fourcc);
            if let Ok(f) = device.set_format(&format) {
                if f.fourcc == format.fourcc {
                    return Ok((f, pixel));
                }
            }
        }

        let f = device.format()?;
        let pixel = if f.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if [b"GREY", b"Y8  ", b"Y800"]
            .iter()
            .any(|c| f.fourcc == FourCC::new(c))
        {
            PixelFormat::Grey
        } else {
            PixelFormat::Mjpeg
        };
        Ok((f, pixel))
    }

    fn decode_mjpeg(data: &[u8]) -> Result<(u32, u32, Vec<u8>)> {
        let img = image::ImageReader::new(std::io::Cursor::new(data))
            .with_guessed_format()?
            .decode()?
            .to_rgb8();
        Ok((img.width(), img.height(), img.into_raw()))
    }

    impl FrameSource for V4lCamera {
        fn name(&self) -> &str {
            &self.name
        }

        fn capture(&mut self) -> Result<CameraFrame> {
            let (data, _meta) = self.stream.next()?;
            let timestamp_us = self.start.elapsed().as_micros() as u64;
            let full_yuyv = self.width as usize * self.height as usize * 2;

            let (width, height, rgb) = match self.format {
                PixelFormat::Yuyv if data.len() >= full_yuyv => (
                    self.width,
                    self.height,
                    yuyv_to_rgb(data, self.width, self.height),
                ),
                // Short YUYV buffers are compressed frames from drivers that
                // silently switched format.
                PixelFormat::Yuyv => {
                    self.format = PixelFormat::Mjpeg;
                    decode_mjpeg(data)?
                }
                PixelFormat::Grey => (
                    self.width,
                    self.height,
                    grey_to_rgb(data, self.width, self.height),
                ),
                PixelFormat::Mjpeg => decode_mjpeg(data)?,
            };

            Ok(CameraFrame {
                name: self.name.clone(),
                width,
                height,
                data: rgb,
                timestamp_us,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_keeps_latest_frame() {
        let mut tap = CameraTap::spawn(TestPattern::new("wrist", 4, 2, Duration::from_millis(1)));
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut frame = None;
        while frame.is_none() && Instant::now() < deadline {
            frame = tap.latest();
            std::thread::sleep(Duration::from_millis(2));
        }
        tap.stop();
        let frame = frame.unwrap();
        assert_eq!(frame.name, "wrist");
        assert_eq!(frame.data.len(), 4 * 2 * 3);
    }

    #[test]
    fn test_grey_expands_to_rgb() {
        assert_eq!(grey_to_rgb(&[10, 200], 2, 1), vec![10, 10, 10, 200, 200, 200]);
    }

    #[test]
    fn test_yuyv_white_and_black() {
        // Y=235 is full white, Y=16 black, with neutral chroma.
        let rgb = yuyv_to_rgb(&[235, 128, 16, 128], 2, 1);
        assert!(rgb[0..3].iter().all(|&c| c >= 254));
        assert_eq!(&rgb[3..6], &[0, 0, 0]);
    }

    #[cfg(feature = "image")]
    #[test]
    fn test_jpeg_encoding() {
        let frame = CameraFrame {
            name: "front".into(),
            width: 8,
            height: 8,
            data: vec![128; 8 * 8 * 3],
            timestamp_us: 0,
        };
        let jpeg = frame.to_jpeg(80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
