//! ffserver configuration rendering.
//!
//! Rendering is pure; writing the text out is left to
//! [`StreamServerManager`](crate::server::StreamServerManager).

use crate::core::stream_params::{StreamParameters, FEED_NAME};
use std::fmt::Write;

/// HTTP control port the server listens on; the transcoder pushes the feed here.
pub const SERVER_HTTP_PORT: u16 = 8090;

/// Name of the RTP stream republished from the feed.
pub const STREAM_NAME: &str = "livefeed";

/// URL the transcoder pushes encoded data to.
pub fn feed_url() -> String {
    format!("http://127.0.0.1:{SERVER_HTTP_PORT}/{FEED_NAME}")
}

/// Renders the server configuration for `params`.
///
/// Numbers are written in plain base 10 and the result ends with the closing
/// `</Stream>` tag, no trailing newline.
pub fn render(params: &StreamParameters) -> String {
    let mut conf = String::with_capacity(512);

    // Writing into a String cannot fail.
    let _ = write!(
        conf,
        "Port {SERVER_HTTP_PORT}\n\
         RTSPPort {rtsp_port}\n\
         BindAddress 0.0.0.0\n\
         MaxHTTPConnections 2000\n\
         MaxClients 1000\n\
         MaxBandwidth 1000\n\
         CustomLog -\n\
         NoDaemon\n\
         \n\
         <Feed {FEED_NAME}>\n\
         \x20   File {feed_file}\n\
         \x20   FileMaxSize 5M\n\
         \x20   ACL allow 127.0.0.1\n\
         </Feed>\n\
         \n\
         <Stream {STREAM_NAME}>\n\
         \x20   Feed {FEED_NAME}\n\
         \x20   Format rtp\n\
         \x20   VideoBitRate {bit_rate}\n\
         \x20   VideoBufferSize 40\n\
         \x20   VideoFrameRate {frame_rate}\n\
         \x20   VideoSize {video_size}\n\
         \x20   VideoGopSize 12\n\
         \x20   NoAudio\n\
         </Stream>",
        rtsp_port = params.rtsp_port(),
        feed_file = params.feed_file_path().display(),
        bit_rate = params.bit_rate_kbps(),
        frame_rate = params.frame_rate(),
        video_size = params.video_size(),
    );

    conf
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPECTED_640X480: &str = "Port 8090
RTSPPort 7654
BindAddress 0.0.0.0
MaxHTTPConnections 2000
MaxClients 1000
MaxBandwidth 1000
CustomLog -
NoDaemon

<Feed feed1.ffm>
    File feed1.ffm
    FileMaxSize 5M
    ACL allow 127.0.0.1
</Feed>

<Stream livefeed>
    Feed feed1.ffm
    Format rtp
    VideoBitRate 800
    VideoBufferSize 40
    VideoFrameRate 15
    VideoSize 640x480
    VideoGopSize 12
    NoAudio
</Stream>";

    #[test]
    fn test_render_matches_reference() {
        let params = StreamParameters::builder()
            .video_size(640, 480)
            .frame_rate(15)
            .bit_rate_kbps(800)
            .rtsp_port(7654)
            .feed_file_path("feed1.ffm")
            .build()
            .unwrap();

        assert_eq!(render(&params), EXPECTED_640X480);
    }

    #[test]
    fn test_render_fields_follow_params() {
        let params = StreamParameters::builder()
            .video_size(1280, 720)
            .frame_rate(30)
            .bit_rate_kbps(12000)
            .rtsp_port(65535)
            .feed_file_path("/sdcard/cache/feed1.ffm")
            .build()
            .unwrap();

        let conf = render(&params);
        let lines: Vec<&str> = conf.lines().map(str::trim).collect();
        assert!(lines.contains(&"RTSPPort 65535"));
        assert!(lines.contains(&"File /sdcard/cache/feed1.ffm"));
        assert!(lines.contains(&"VideoBitRate 12000"));
        assert!(lines.contains(&"VideoFrameRate 30"));
        assert!(lines.contains(&"VideoSize 1280x720"));
        // No digit grouping, whatever the locale.
        assert!(!conf.contains("12,000"));
    }

    #[test]
    fn test_feed_url() {
        assert_eq!(feed_url(), "http://127.0.0.1:8090/feed1.ffm");
    }
}
