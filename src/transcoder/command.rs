use crate::config::EncoderOptions;
use crate::core::stream_params::{PixelFormat, StreamParameters};

/// Builds the transcoder command line: raw frames on stdin in, low-latency
/// encoded feed pushed to the relay server out.
#[derive(Debug, Clone)]
pub struct TranscoderCommandBuilder {
    video_size: String,
    pixel_format: PixelFormat,
    frame_rate: Option<u32>,
    crf: u32,
    preset: String,
    tune: String,
    log_level: String,
    output_url: String,
}

impl TranscoderCommandBuilder {
    pub fn new(output_url: impl Into<String>) -> Self {
        let encoder = EncoderOptions::default();
        Self {
            video_size: String::new(),
            pixel_format: PixelFormat::default(),
            frame_rate: None,
            crf: encoder.crf,
            preset: encoder.preset,
            tune: encoder.tune,
            log_level: encoder.log_level,
            output_url: output_url.into(),
        }
    }

    /// Takes geometry, pixel format and frame rate from `params`.
    pub fn with_params(mut self, params: &StreamParameters) -> Self {
        self.video_size = params.video_size();
        self.pixel_format = params.pixel_format();
        self.frame_rate = Some(params.frame_rate());
        self
    }

    pub fn with_encoder(mut self, encoder: &EncoderOptions) -> Self {
        self.crf = encoder.crf;
        self.preset = encoder.preset.clone();
        self.tune = encoder.tune.clone();
        self.log_level = encoder.log_level.clone();
        self
    }

    pub fn build(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(), self.log_level.clone(),
            "-nostdin".to_string(),
            "-f".to_string(), "rawvideo".to_string(),
            "-vcodec".to_string(), "rawvideo".to_string(),
            "-pix_fmt".to_string(), self.pixel_format.ffmpeg_name().to_string(),
            "-video_size".to_string(), self.video_size.clone(),
        ];

        if let Some(fps) = self.frame_rate {
            args.push("-framerate".to_string());
            args.push(fps.to_string());
        }

        args.extend(vec![
            "-i".to_string(), "pipe:".to_string(),
            "-crf".to_string(), self.crf.to_string(),
            "-preset".to_string(), self.preset.clone(),
            "-tune".to_string(), self.tune.clone(),
            self.output_url.clone(),
        ]);

        args
    }
}
