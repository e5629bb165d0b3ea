// crates/framepipe-media/src/receiver.rs
//
// Receiver worker: demux the source, decode the first video stream, and
// feed packed BGR frames into the pipeline in decode order.

use std::time::Duration;

use tracing::{debug, info, warn};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::threading;
use ffmpeg::format::{input, input_with_dictionary, Pixel};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::frame::video::Video as VideoFrame;

use framepipe_core::{spsc, DoneFlag, FrameShape, QueueError};

use crate::error::{PipelineError, Result};
use crate::helpers::frames::pack_plane;
use crate::options::input_options;

pub const DEFAULT_PUT_TIMEOUT: Duration = Duration::from_secs(32);

pub struct Receiver {
    ictx:      ffmpeg::format::context::Input,
    decoder:   ffmpeg::decoder::video::Video,
    scaler:    SwsContext,
    video_idx: usize,
    shape:     FrameShape,
    producer:  spsc::Producer,
    done:      DoneFlag,
    /// How long one `put` may wait for a free slot before the frame is
    /// dropped (or retried, when `drop_if_put_timeout` is off).
    put_timeout:         Duration,
    drop_if_put_timeout: bool,
}

impl Receiver {
    pub fn open(
        source: &str,
        shape: FrameShape,
        producer: spsc::Producer,
        done: DoneFlag,
    ) -> Result<Self> {
        let ictx = match input_options(source) {
            Some(opts) => input_with_dictionary(&source, opts)?,
            None => input(&source)?,
        };

        let video_idx = ictx
            .streams()
            .best(Type::Video)
            .ok_or_else(|| PipelineError::NoVideoStream(source.to_owned()))?
            .index();

        let stream = ictx.stream(video_idx).unwrap();
        let mut dec_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
        // Frame-parallel decoding plus low-delay output: frames must leave
        // the decoder as soon as they are complete, not a GOP later.
        dec_ctx.set_threading(threading::Config::kind(threading::Type::Frame));
        dec_ctx.set_flags(ffmpeg::codec::Flags::LOW_DELAY);
        let decoder = dec_ctx.decoder().video()?;

        let scaler = SwsContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::BGR24,
            shape.width as u32,
            shape.height as u32,
            Flags::BILINEAR,
        )?;

        info!(
            source,
            decoded_width = decoder.width(),
            decoded_height = decoder.height(),
            "receiver opened input"
        );

        Ok(Self {
            ictx,
            decoder,
            scaler,
            video_idx,
            shape,
            producer,
            done,
            put_timeout: DEFAULT_PUT_TIMEOUT,
            drop_if_put_timeout: true,
        })
    }

    pub fn put_timeout(mut self, timeout: Duration) -> Self {
        self.put_timeout = timeout;
        self
    }

    pub fn drop_if_put_timeout(mut self, drop: bool) -> Self {
        self.drop_if_put_timeout = drop;
        self
    }

    /// Demux and decode until the done flag is set, the source ends, or a
    /// codec error aborts the worker. Demux failures are never retried.
    pub fn run(&mut self) -> Result<()> {
        let mut decoded = VideoFrame::empty();

        for result in self.ictx.packets() {
            if self.done.is_set() {
                return Ok(());
            }
            let (stream, packet) = result?;
            if stream.index() != self.video_idx {
                continue;
            }
            // The demuxer emits flushing packets without a decode
            // timestamp at stream boundaries; skip them.
            if packet.dts().is_none() {
                continue;
            }

            self.decoder.send_packet(&packet)?;
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                if !Self::forward(
                    &mut self.scaler,
                    &mut self.producer,
                    &self.done,
                    self.shape,
                    &decoded,
                    self.put_timeout,
                    self.drop_if_put_timeout,
                )? {
                    return Ok(());
                }
            }
        }

        // Demux ended; drain the frames the decoder still holds.
        let _ = self.decoder.send_eof();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            if self.done.is_set() {
                return Ok(());
            }
            if !Self::forward(
                &mut self.scaler,
                &mut self.producer,
                &self.done,
                self.shape,
                &decoded,
                self.put_timeout,
                self.drop_if_put_timeout,
            )? {
                return Ok(());
            }
        }
        debug!("receiver reached end of source");
        Ok(())
    }

    /// Scale one decoded frame to packed BGR and enqueue it. Returns
    /// `Ok(false)` when the worker should stop (done set, or the router
    /// side of the queue is gone).
    fn forward(
        scaler: &mut SwsContext,
        producer: &mut spsc::Producer,
        done: &DoneFlag,
        shape: FrameShape,
        decoded: &VideoFrame,
        put_timeout: Duration,
        drop_if_put_timeout: bool,
    ) -> Result<bool> {
        let mut bgr = VideoFrame::empty();
        scaler.run(decoded, &mut bgr)?;
        let data = pack_plane(&bgr, shape.row_bytes(), shape.height);

        loop {
            if done.is_set() {
                return Ok(false);
            }
            match producer.put(&data, 0, Some(put_timeout)) {
                Ok(()) => return Ok(true),
                Err(QueueError::Full) => {
                    if drop_if_put_timeout {
                        warn!("frame queue full for {put_timeout:?}; dropping frame");
                        return Ok(true);
                    }
                    // Lossless mode: retry the same frame until it fits
                    // or the pipeline shuts down.
                }
                Err(QueueError::Disconnected) => {
                    debug!("router endpoint closed; receiver stopping");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
