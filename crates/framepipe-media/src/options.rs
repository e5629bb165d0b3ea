// crates/framepipe-media/src/options.rs
//
// Input/output option tables: realtime source handling, the fixed H.264
// encoder settings, and the HLS muxer option rendering.

use std::path::{Path, PathBuf};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::Dictionary;

/// Container formats that deliver in real time (no seeking, no preroll).
/// Sources in these formats are opened with low-latency demux options.
pub const REALTIME_FORMATS: &[&str] = &[
    "alsa",
    "android_camera",
    "avfoundation",
    "bktr",
    "decklink",
    "dshow",
    "fbdev",
    "gdigrab",
    "iec61883",
    "jack",
    "kmsgrab",
    "openal",
    "oss",
    "pulse",
    "sndio",
    "rtsp",
    "v4l2",
    "vfwcap",
    "x11grab",
];

pub const RTSP_SCHEME: &str = "rtsp://";

/// Demux options for an RTSP source: force the reliable transport and
/// disable input buffering so frames reach the decoder as they arrive.
pub fn rtsp_input_options() -> Dictionary<'static> {
    let mut opts = Dictionary::new();
    opts.set("rtsp_transport", "tcp");
    opts.set("fflags", "nobuffer");
    opts
}

/// Option dictionary for opening `source`, if it needs one. Everything
/// that is not RTSP passes through with container defaults.
pub fn input_options(source: &str) -> Option<Dictionary<'static>> {
    source.starts_with(RTSP_SCHEME).then(rtsp_input_options)
}

// ── Encoder settings ─────────────────────────────────────────────────────────

/// Output stream encoder configuration. The codec is always libx264 with
/// yuv420p; these are the private options handed to the encoder open.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub preset: String,
    pub crf:    u32,
    pub tune:   String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            preset: "fast".into(),
            crf:    28,
            tune:   "zerolatency".into(),
        }
    }
}

impl EncoderSettings {
    pub fn to_dictionary(&self) -> Dictionary<'static> {
        let mut opts = Dictionary::new();
        opts.set("preset", &self.preset);
        opts.set("crf", &self.crf.to_string());
        opts.set("tune", &self.tune);
        opts
    }
}

// ── HLS output ───────────────────────────────────────────────────────────────

pub const HLS_MASTER_FILENAME: &str = "master.m3u8";
pub const HLS_SEGMENT_FILENAME: &str = "%Y-%m-%d_%H-%M-%S.ts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlsPlaylistType {
    /// `#EXT-X-PLAYLIST-TYPE:VOD`: the playlist must not change.
    Vod,
    /// `#EXT-X-PLAYLIST-TYPE:EVENT`: the playlist can only be appended to.
    Event,
}

impl HlsPlaylistType {
    fn as_str(&self) -> &'static str {
        match self {
            HlsPlaylistType::Vod => "vod",
            HlsPlaylistType::Event => "event",
        }
    }
}

/// Options for the `hls` muxer.
///
/// Segments land in `cache_dir` under strftime-expanded names; the master
/// playlist is written next to them. `drop_first_segment` records the
/// policy of discarding the first segment file, which usually contains
/// error packets from the encoder warming up; the surgery itself belongs
/// to whoever moves segments from the cache to their destination.
#[derive(Debug, Clone)]
pub struct HlsOutputOptions {
    pub cache_dir:          PathBuf,
    pub hls_time:           u32,
    pub playlist_type:      HlsPlaylistType,
    pub strftime:           bool,
    pub strftime_mkdir:     bool,
    pub drop_first_segment: bool,
}

impl HlsOutputOptions {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir:          cache_dir.into(),
            hls_time:           10,
            playlist_type:      HlsPlaylistType::Vod,
            strftime:           true,
            strftime_mkdir:     true,
            drop_first_segment: true,
        }
    }

    /// Path of the master playlist inside the cache directory.
    pub fn master_path(&self) -> PathBuf {
        self.cache_dir.join(HLS_MASTER_FILENAME)
    }

    /// strftime pattern for segment files inside the cache directory.
    pub fn segment_pattern(&self) -> PathBuf {
        self.cache_dir.join(HLS_SEGMENT_FILENAME)
    }

    /// Render the muxer option dictionary.
    /// <https://ffmpeg.org/ffmpeg-formats.html#hls-2>
    pub fn to_dictionary(&self) -> Dictionary<'static> {
        let mut opts = Dictionary::new();
        opts.set("strftime", if self.strftime { "1" } else { "0" });
        opts.set("strftime_mkdir", if self.strftime_mkdir { "1" } else { "0" });
        opts.set("hls_time", &self.hls_time.to_string());
        opts.set("hls_playlist_type", self.playlist_type.as_str());
        opts.set(
            "hls_segment_filename",
            &self.segment_pattern().to_string_lossy(),
        );
        opts
    }
}

/// True when `destination` looks like a local path rather than a URI with
/// a scheme, in which case the container format is derived from the file
/// extension by the muxer.
pub fn is_local_destination(destination: &str) -> bool {
    !destination.contains("://") && Path::new(destination).extension().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtsp_sources_get_low_latency_options() {
        let opts = input_options("rtsp://camera.local/stream").unwrap();
        assert_eq!(opts.get("rtsp_transport"), Some("tcp"));
        assert_eq!(opts.get("fflags"), Some("nobuffer"));
    }

    #[test]
    fn plain_files_pass_through() {
        assert!(input_options("clip.mp4").is_none());
        assert!(input_options("/dev/video0").is_none());
    }

    #[test]
    fn encoder_settings_render_fixed_defaults() {
        let opts = EncoderSettings::default().to_dictionary();
        assert_eq!(opts.get("preset"), Some("fast"));
        assert_eq!(opts.get("crf"), Some("28"));
        assert_eq!(opts.get("tune"), Some("zerolatency"));
    }

    #[test]
    fn hls_options_render_segment_policy() {
        let hls = HlsOutputOptions::new("/tmp/hls-cache");
        assert!(hls.drop_first_segment);
        let opts = hls.to_dictionary();
        assert_eq!(opts.get("strftime"), Some("1"));
        assert_eq!(opts.get("hls_time"), Some("10"));
        assert_eq!(opts.get("hls_playlist_type"), Some("vod"));
        assert!(opts
            .get("hls_segment_filename")
            .unwrap()
            .ends_with(HLS_SEGMENT_FILENAME));
    }

    #[test]
    fn realtime_table_covers_rtsp() {
        assert!(REALTIME_FORMATS.contains(&"rtsp"));
        assert!(is_local_destination("out.mp4"));
        assert!(!is_local_destination("rtsp://relay/live"));
    }
}
