// crates/framepipe-media/src/sender.rs
//
// Sender worker: re-encode composited BGR frames as H.264 and mux them to
// the destination container.
//
// PTS strategy: a monotonically increasing frame counter in 1/fps. The
// pipeline has no source timestamps by the time frames reach this side of
// the queues, so the declared rate is the clock.

use std::time::Duration;

use tracing::{debug, info};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::{output, output_as, Pixel};
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use framepipe_core::{spsc, DoneFlag, FrameShape, QueueError};

use crate::error::Result;
use crate::helpers::frames::unpack_plane;
use crate::options::EncoderSettings;

/// Output frame rate when the caller does not declare one.
pub const DEFAULT_FRAME_RATE: i32 = 24;

pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Sender {
    octx:      ffmpeg::format::context::Output,
    encoder:   ffmpeg::encoder::video::Encoder,
    scaler:    SwsContext,
    consumer:  spsc::Consumer,
    done:      DoneFlag,
    shape:     FrameShape,
    frame_tb:  Rational,
    ost_tb:    Rational,
    frame_idx: i64,
    get_timeout: Duration,
}

impl Sender {
    pub fn open(
        destination: &str,
        file_format: Option<&str>,
        shape: FrameShape,
        frame_rate: i32,
        consumer: spsc::Consumer,
        done: DoneFlag,
    ) -> Result<Self> {
        let mut octx = match file_format {
            Some(format) => output_as(&destination, format)?,
            None => output(&destination)?,
        };

        let (width, height) = (shape.width as u32, shape.height as u32);
        let frame_tb = Rational::new(1, frame_rate);

        let h264 = encoder::find(CodecId::H264).ok_or(ffmpeg::Error::EncoderNotFound)?;

        let mut ost = octx.add_stream(h264)?;
        ost.set_time_base(frame_tb);

        let enc_ctx = codec::context::Context::new_with_codec(h264);
        let mut video_enc = enc_ctx.encoder().video()?;
        video_enc.set_width(width);
        video_enc.set_height(height);
        video_enc.set_format(Pixel::YUV420P);
        video_enc.set_time_base(frame_tb);
        video_enc.set_frame_rate(Some(Rational::new(frame_rate, 1)));
        video_enc.set_bit_rate(0); // CRF drives quality; bit_rate 0 signals VBR

        let encoder = video_enc.open_as_with(h264, EncoderSettings::default().to_dictionary())?;

        // Copy encoder params into the stream's codecpar so the muxer has
        // resolution, format, and codec-private data. No safe setter takes
        // an opened encoder context, so go through the FFI.
        unsafe {
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (**(*octx.as_mut_ptr()).streams.add(0)).codecpar,
                encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                return Err(ffmpeg::Error::from(ret).into());
            }
        }

        octx.write_header()?;
        // The muxer may rewrite the stream timebase during write_header;
        // read it back for packet rescaling.
        let ost_tb = octx.stream(0).unwrap().time_base();

        let scaler = SwsContext::get(
            Pixel::BGR24,
            width,
            height,
            Pixel::YUV420P,
            width,
            height,
            Flags::BILINEAR,
        )?;

        info!(destination, width, height, frame_rate, "sender opened output");

        Ok(Self {
            octx,
            encoder,
            scaler,
            consumer,
            done,
            shape,
            frame_tb,
            ost_tb,
            frame_idx: 0,
            get_timeout: DEFAULT_GET_TIMEOUT,
        })
    }

    /// Encode and mux until the done flag is set or the queue peer goes
    /// away. A mux or encode error aborts the loop; the close path still
    /// flushes whatever the encoder holds.
    pub fn run(&mut self) -> Result<()> {
        while !self.done.is_set() {
            let data = match self.consumer.get(Some(self.get_timeout)) {
                Ok(data) => data,
                Err(QueueError::Empty) => continue,
                Err(QueueError::Disconnected) => break,
                Err(e) => return Err(e.into()),
            };
            self.encode_frame(&data)?;
        }
        debug!(frames = self.frame_idx, "sender stopping");
        Ok(())
    }

    /// Flush the encoder and finalise the container. Runs on every exit
    /// path so a torn-down pipeline still leaves a playable output.
    pub fn close(&mut self) -> Result<()> {
        self.encoder.send_eof()?;
        self.drain_packets()?;
        self.octx.write_trailer()?;
        Ok(())
    }

    fn encode_frame(&mut self, data: &[u8]) -> Result<()> {
        let (width, height) = (self.shape.width as u32, self.shape.height as u32);

        let mut bgr = VideoFrame::new(Pixel::BGR24, width, height);
        unpack_plane(&mut bgr, data, self.shape.row_bytes(), self.shape.height);

        let mut yuv = VideoFrame::empty();
        self.scaler.run(&bgr, &mut yuv)?;
        yuv.set_pts(Some(self.frame_idx));

        self.encoder.send_frame(&yuv)?;
        self.frame_idx += 1;
        self.drain_packets()
    }

    fn drain_packets(&mut self) -> Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(0);
            packet.rescale_ts(self.frame_tb, self.ost_tb);
            packet.write_interleaved(&mut self.octx)?;
        }
        Ok(())
    }
}
