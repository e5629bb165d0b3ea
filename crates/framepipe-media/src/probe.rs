// crates/framepipe-media/src/probe.rs
//
// In-process source probing: the pipeline's frame shape follows the
// decoded input, so the application asks here before constructing queues.

use tracing::debug;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::{input, input_with_dictionary};
use ffmpeg::media::Type;

use crate::error::{PipelineError, Result};
use crate::options::input_options;

/// Open `source` just long enough to read the first video stream's
/// dimensions. RTSP sources are opened with the same low-latency options
/// the receiver uses.
pub fn source_dimensions(source: &str) -> Result<(u32, u32)> {
    let ictx = match input_options(source) {
        Some(opts) => input_with_dictionary(&source, opts)?,
        None => input(&source)?,
    };

    let stream = ictx
        .streams()
        .best(Type::Video)
        .ok_or_else(|| PipelineError::NoVideoStream(source.to_owned()))?;

    let (width, height) = unsafe {
        let params = stream.parameters().as_ptr();
        ((*params).width as u32, (*params).height as u32)
    };
    debug!(source, width, height, "probed source dimensions");
    Ok((width, height))
}
