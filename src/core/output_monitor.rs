//! Drains the combined stdout/stderr of a supervised child into the log.
//!
//! The pipe must be drained even when nobody is interested in the text, or
//! the child stalls once the OS pipe buffer fills up.

use log::{debug, info};
use std::io::{self, BufRead, BufReader, Read};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) fn spawn(
    label: &str,
    output: Box<dyn Read + Send>,
    forward: bool,
) -> io::Result<JoinHandle<()>> {
    let label = label.to_string();
    std::thread::Builder::new()
        .name(format!("{label}-output"))
        .spawn(move || {
            if forward {
                forward_lines(&label, output);
            } else {
                let mut output = output;
                let _ = io::copy(&mut output, &mut io::sink());
            }
        })
}

fn forward_lines(label: &str, output: Box<dyn Read + Send>) {
    let mut reader = BufReader::new(output);
    let mut progress = ProgressThrottle::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                // ffmpeg rewrites its progress line in place with '\r'.
                for segment in buf.split(|b| *b == b'\r') {
                    let line = String::from_utf8_lossy(segment);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if is_progress_line(line) {
                        if progress.should_log() {
                            info!("{label} | {}", summarize_progress(line));
                        }
                    } else {
                        debug!("{label}: {line}");
                    }
                }
            }
            Err(e) => {
                debug!("{label}: output stream error: {e}");
                break;
            }
        }
    }
    debug!("{label}: output stream closed");
}

struct ProgressThrottle {
    last: Option<Instant>,
}

impl ProgressThrottle {
    fn new() -> Self {
        Self { last: None }
    }

    fn should_log(&mut self) -> bool {
        match self.last {
            Some(last) if last.elapsed() < PROGRESS_LOG_INTERVAL => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }
}

fn is_progress_line(line: &str) -> bool {
    line.contains("time=") && line.contains("bitrate=")
}

fn summarize_progress(line: &str) -> String {
    let field = |key: &str| extract_value(line, key).unwrap_or_else(|| "??".to_string());
    let mut summary = format!(
        "Time: {} | Bitrate: {} | Speed: {}",
        field("time="),
        field("bitrate="),
        field("speed=")
    );
    if let Some(fps) = extract_value(line, "fps=") {
        summary.push_str(&format!(" | FPS: {fps}"));
    }
    if let Some(drop) = extract_value(line, "drop=") {
        summary.push_str(&format!(" | Drop: {drop}"));
    }
    summary
}

fn extract_value(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)?;
    let after_key = line[start + key.len()..].trim_start();
    let end = after_key
        .find(char::is_whitespace)
        .unwrap_or(after_key.len());
    Some(after_key[..end].to_string())
}
