// crates/framepipe-media/src/error.rs

use ffmpeg_the_third as ffmpeg;
use thiserror::Error;

use framepipe_core::QueueError;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline-level failures.
///
/// Codec errors are fatal to the worker that hits them; the manager only
/// ever observes them as a dead worker (`WorkerDied`), which ends the
/// dispatch loop cleanly. `ShapeMismatch` is the one error the manager
/// raises itself, and it takes the whole pipeline down.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no video stream in '{0}'")]
    NoVideoStream(String),

    #[error("only 3-channel BGR frames are supported, got {0}")]
    UnsupportedChannels(usize),

    #[error("{what} is {actual} bytes, expected {expected}")]
    ShapeMismatch {
        what:     &'static str,
        expected: usize,
        actual:   usize,
    },

    #[error("{0} worker is not alive")]
    WorkerDied(&'static str),

    #[error("pipeline workers are already running")]
    AlreadyStarted,

    #[error("failed to spawn {worker} worker")]
    Spawn {
        worker: &'static str,
        #[source]
        source: std::io::Error,
    },

    // anyhow::Error is not a std error source; it is folded into the
    // message instead.
    #[error("module {hook} hook failed: {reason:#}")]
    Callback {
        hook:   &'static str,
        reason: anyhow::Error,
    },

    #[error(transparent)]
    Ffmpeg(#[from] ffmpeg::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
