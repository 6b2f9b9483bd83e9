use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// File name of the feed the transcoder pushes into, as declared in the server config.
pub const FEED_NAME: &str = "feed1.ffm";

pub const DEFAULT_FRAME_RATE: u32 = 15;
pub const DEFAULT_BIT_RATE_KBPS: u32 = 800;
pub const DEFAULT_RTSP_PORT: u16 = 7654;

/// Raw pixel layout of the frames handed to the relay.
///
/// Both variants are 4:2:0 subsampled, so a frame is always
/// `width * height * 12 / 8` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// Y plane followed by interleaved V/U. Default camera preview layout.
    #[default]
    Nv21,
    /// Y, U and V planes one after another.
    Yuv420p,
}

impl PixelFormat {
    pub fn bits_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Nv21 | PixelFormat::Yuv420p => 12,
        }
    }

    /// Name understood by ffmpeg's `-pix_fmt`.
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Nv21 => "nv21",
            PixelFormat::Yuv420p => "yuv420p",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

/// Geometry and encoding parameters of one streaming session.
///
/// Immutable once built. `width`/`height` must be exactly the size the frame
/// source delivers: the transcoder is told the raw geometry out-of-band and
/// cannot detect a mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParameters {
    width: u32,
    height: u32,
    frame_rate: u32,
    bit_rate_kbps: u32,
    rtsp_port: u16,
    feed_file_path: PathBuf,
    pixel_format: PixelFormat,
}

impl StreamParameters {
    pub fn builder() -> StreamParametersBuilder {
        StreamParametersBuilder::new()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn bit_rate_kbps(&self) -> u32 {
        self.bit_rate_kbps
    }

    pub fn rtsp_port(&self) -> u16 {
        self.rtsp_port
    }

    pub fn feed_file_path(&self) -> &Path {
        &self.feed_file_path
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// `"{width}x{height}"`, the form used by both the server config and `-video_size`.
    pub fn video_size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Size in bytes of one raw frame.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bits_per_pixel() / 8
    }
}

/// Builder for [`StreamParameters`].
///
/// Only the video size is required; everything else falls back to the values
/// the stock camera pipeline streams with (15 fps, 800 kbit/s, RTSP on 7654).
///
/// Width and height must be non-zero and even: both supported pixel formats
/// subsample chroma 2x2, so an odd dimension has no exact frame size.
///
/// # Example
///
/// ```rust
/// use ffrelay::StreamParameters;
///
/// let params = StreamParameters::builder()
///     .video_size(640, 480)
///     .frame_rate(15)
///     .bit_rate_kbps(800)
///     .rtsp_port(7654)
///     .feed_file_path("/tmp/feed1.ffm")
///     .build()
///     .unwrap();
///
/// assert_eq!(params.video_size(), "640x480");
/// assert_eq!(params.frame_size(), 640 * 480 * 12 / 8);
/// ```
#[derive(Debug, Clone)]
pub struct StreamParametersBuilder {
    video_size: Option<(u32, u32)>,
    frame_rate: u32,
    bit_rate_kbps: u32,
    rtsp_port: u16,
    feed_file_path: Option<PathBuf>,
    pixel_format: PixelFormat,
}

impl Default for StreamParametersBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParametersBuilder {
    pub fn new() -> Self {
        Self {
            video_size: None,
            frame_rate: DEFAULT_FRAME_RATE,
            bit_rate_kbps: DEFAULT_BIT_RATE_KBPS,
            rtsp_port: DEFAULT_RTSP_PORT,
            feed_file_path: None,
            pixel_format: PixelFormat::default(),
        }
    }

    /// Sets the negotiated preview size of the frame source.
    pub fn video_size(mut self, width: u32, height: u32) -> Self {
        self.video_size = Some((width, height));
        self
    }

    pub fn frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn bit_rate_kbps(mut self, bit_rate_kbps: u32) -> Self {
        self.bit_rate_kbps = bit_rate_kbps;
        self
    }

    pub fn rtsp_port(mut self, rtsp_port: u16) -> Self {
        self.rtsp_port = rtsp_port;
        self
    }

    /// Sets the file backing the server's feed. Defaults to `feed1.ffm` in the
    /// system temp directory.
    pub fn feed_file_path(mut self, path: impl AsRef<Path>) -> Self {
        self.feed_file_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    pub fn build(self) -> Result<StreamParameters> {
        let (width, height) = self
            .video_size
            .ok_or(Error::MissingParameter("video_size"))?;

        if width == 0 || height == 0 {
            return Err(Error::invalid(
                "video_size",
                format!("{width}x{height} has a zero dimension"),
            ));
        }
        // 4:2:0 chroma planes are half size in both directions.
        if width % 2 != 0 || height % 2 != 0 {
            return Err(Error::invalid(
                "video_size",
                format!("{width}x{height} is not even, required by {}", self.pixel_format),
            ));
        }
        if self.frame_rate == 0 {
            return Err(Error::invalid("frame_rate", "must be greater than zero"));
        }
        if self.bit_rate_kbps == 0 {
            return Err(Error::invalid("bit_rate_kbps", "must be greater than zero"));
        }
        if self.rtsp_port == 0 {
            return Err(Error::invalid("rtsp_port", "must be in 1..=65535"));
        }

        let feed_file_path = match self.feed_file_path {
            Some(path) if path.as_os_str().is_empty() => {
                return Err(Error::invalid("feed_file_path", "must not be empty"));
            }
            Some(path) => path,
            None => std::env::temp_dir().join(FEED_NAME),
        };

        Ok(StreamParameters {
            width,
            height,
            frame_rate: self.frame_rate,
            bit_rate_kbps: self.bit_rate_kbps,
            rtsp_port: self.rtsp_port,
            feed_file_path,
            pixel_format: self.pixel_format,
        })
    }
}
