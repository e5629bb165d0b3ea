// crates/framepipe-media/src/manager.rs
//
// PipelineManager: builds the four queues, spawns the three workers, runs
// the callback dispatch loop, and guarantees teardown on every exit path.
//
// The manager is the only aggregator in the system. Workers never raise
// to their peers; they die and are noticed here on the next dispatch
// turn. `join_safe` is the uniform cancellation entry point: it
// sets every termination flag, joins each worker against the same
// deadline, and detaches anything that refuses to stop.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use framepipe_core::callback::{FrameCallback, OnImageResult};
use framepipe_core::mask;
use framepipe_core::{spsc, DoneFlag, FrameShape, QueueError};

use crate::error::{PipelineError, Result};
use crate::receiver::Receiver;
use crate::router::Router;
use crate::sender::{Sender, DEFAULT_FRAME_RATE};

pub const DEFAULT_QUEUE_SIZE: usize = 8;
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(8);

/// How often the dispatch loop checks its own done flag while the improc
/// queue is quiet, and how long it waits to publish an overlay.
const DISPATCH_GET_TIMEOUT: Duration = Duration::from_secs(1);
const OVERLAY_PUT_TIMEOUT: Duration = Duration::from_secs(8);

/// Dispatch progress is logged every this many frames.
const FRAME_LOGGING_STEP: u64 = 100;

/// A failing module is tolerated this many times in a row before the
/// pipeline gives up on it. One bad frame should not kill a live stream;
/// a module that never recovers should not keep one alive either.
const CALLBACK_FAILURE_LIMIT: u32 = 8;

// ── Options ──────────────────────────────────────────────────────────────────

/// Everything needed to construct a pipeline. Field defaults match
/// `new`; callers override the public fields before handing it over.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub source:      String,
    pub destination: String,
    /// Container format of the destination; `None` lets the muxer derive
    /// it from the URI.
    pub file_format: Option<String>,
    pub width:       usize,
    pub height:      usize,
    /// Must be 3; carried explicitly so misconfiguration fails loudly.
    pub channels:    usize,
    /// Color treated as transparent when a callback returns a bare
    /// overlay.
    pub chroma_color: [u8; 3],
    /// Synchronous router mode: every frame waits for its overlay.
    pub synchronize: bool,
    /// Capacity of the receiver and sender queues. The callback-path
    /// queues are always capacity 1.
    pub queue_size:   usize,
    pub join_timeout: Duration,
    pub frame_rate:   i32,
    /// First value of the dispatch frame counter (log continuity when a
    /// pipeline is restarted mid-stream).
    pub start_index:  u64,
}

impl PipelineOptions {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        width: usize,
        height: usize,
    ) -> Self {
        Self {
            source:       source.into(),
            destination:  destination.into(),
            file_format:  None,
            width,
            height,
            channels:     framepipe_core::shape::BGR_CHANNELS,
            chroma_color: mask::DEFAULT_CHROMA_COLOR,
            synchronize:  false,
            queue_size:   DEFAULT_QUEUE_SIZE,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            frame_rate:   DEFAULT_FRAME_RATE,
            start_index:  0,
        }
    }
}

// ── Shutdown handle ──────────────────────────────────────────────────────────

/// Clonable handle that signals the whole pipeline to stop. Handed to the
/// signal handler so SIGINT reaches every worker and the dispatch loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    flags: [DoneFlag; 4],
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        for flag in &self.flags {
            flag.set();
        }
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Endpoints the workers take with them at spawn time.
struct WorkerEndpoints {
    receiver_producer: spsc::Producer,
    receiver_consumer: spsc::Consumer,
    improc_producer:   spsc::Producer,
    overlay_consumer:  spsc::Consumer,
    sender_producer:   spsc::Producer,
    sender_consumer:   spsc::Consumer,
}

pub struct PipelineManager {
    opts:  PipelineOptions,
    shape: FrameShape,

    manager_done:  DoneFlag,
    receiver_done: DoneFlag,
    router_done:   DoneFlag,
    sender_done:   DoneFlag,

    /// Present until `start()` hands them to the workers.
    endpoints: Option<WorkerEndpoints>,

    // Manager-owned queue endpoints; dropped in `join_safe`.
    improc_consumer:  Option<spsc::Consumer>,
    overlay_producer: Option<spsc::Producer>,

    receiver: Option<JoinHandle<()>>,
    router:   Option<JoinHandle<()>>,
    sender:   Option<JoinHandle<()>>,

    callbacks:   Box<dyn FrameCallback>,
    frame_index: u64,
    callback_failures: u32,
}

impl PipelineManager {
    pub fn new(opts: PipelineOptions, callbacks: Box<dyn FrameCallback>) -> Result<Self> {
        if opts.channels != 3 {
            return Err(PipelineError::UnsupportedChannels(opts.channels));
        }
        let shape = FrameShape::bgr(opts.width, opts.height);
        let frame_bytes = shape.frame_bytes();

        let (receiver_producer, receiver_consumer) = spsc::channel(opts.queue_size, frame_bytes);
        let (improc_producer, improc_consumer) = spsc::channel(1, frame_bytes);
        let (overlay_producer, overlay_consumer) = spsc::channel(1, shape.overlay_bytes());
        let (sender_producer, sender_consumer) = spsc::channel(opts.queue_size, frame_bytes);

        let frame_index = opts.start_index;
        Ok(Self {
            opts,
            shape,
            manager_done:  DoneFlag::new(),
            receiver_done: DoneFlag::new(),
            router_done:   DoneFlag::new(),
            sender_done:   DoneFlag::new(),
            endpoints: Some(WorkerEndpoints {
                receiver_producer,
                receiver_consumer,
                improc_producer,
                overlay_consumer,
                sender_producer,
                sender_consumer,
            }),
            improc_consumer:  Some(improc_consumer),
            overlay_producer: Some(overlay_producer),
            receiver: None,
            router:   None,
            sender:   None,
            callbacks,
            frame_index,
            callback_failures: 0,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flags: [
                self.manager_done.clone(),
                self.receiver_done.clone(),
                self.router_done.clone(),
                self.sender_done.clone(),
            ],
        }
    }

    /// Spawn the workers: sender first, then router, then receiver, so
    /// every downstream endpoint is live before frames start flowing.
    pub fn start(&mut self) -> Result<()> {
        let endpoints = self.endpoints.take().ok_or(PipelineError::AlreadyStarted)?;
        let WorkerEndpoints {
            receiver_producer,
            receiver_consumer,
            improc_producer,
            overlay_consumer,
            sender_producer,
            sender_consumer,
        } = endpoints;

        let shape = self.shape;

        let destination = self.opts.destination.clone();
        let file_format = self.opts.file_format.clone();
        let frame_rate = self.opts.frame_rate;
        let done = self.sender_done.clone();
        self.sender = Some(spawn_worker("sender", move || {
            let mut sender = match Sender::open(
                &destination,
                file_format.as_deref(),
                shape,
                frame_rate,
                sender_consumer,
                done,
            ) {
                Ok(sender) => sender,
                Err(e) => {
                    error!("sender failed to open '{destination}': {e}");
                    return;
                }
            };
            if let Err(e) = sender.run() {
                error!("sender: {e}");
            }
            // Flush even after an error so the container stays playable.
            if let Err(e) = sender.close() {
                error!("sender failed to flush output: {e}");
            }
        })?);

        let done = self.router_done.clone();
        let synchronize = self.opts.synchronize;
        self.router = Some(spawn_worker("router", move || {
            let mut router = match Router::new(
                shape,
                receiver_consumer,
                improc_producer,
                overlay_consumer,
                sender_producer,
                done,
                synchronize,
            ) {
                Ok(router) => router,
                Err(e) => {
                    error!("router: {e}");
                    return;
                }
            };
            if let Err(e) = router.run() {
                error!("router: {e}");
            }
        })?);

        let source = self.opts.source.clone();
        let done = self.receiver_done.clone();
        self.receiver = Some(spawn_worker("receiver", move || {
            let mut receiver = match Receiver::open(&source, shape, receiver_producer, done) {
                Ok(receiver) => receiver,
                Err(e) => {
                    error!("receiver failed to open '{source}': {e}");
                    return;
                }
            };
            if let Err(e) = receiver.run() {
                error!("receiver: {e}");
            }
        })?);

        info!("pipeline workers started");
        Ok(())
    }

    /// Fail with the first worker that is no longer running.
    pub fn check_workers_alive(&self) -> Result<()> {
        for (name, handle) in [
            ("sender", &self.sender),
            ("router", &self.router),
            ("receiver", &self.receiver),
        ] {
            match handle {
                Some(handle) if !handle.is_finished() => {}
                _ => return Err(PipelineError::WorkerDied(name)),
            }
        }
        Ok(())
    }

    /// Set every termination flag.
    pub fn done(&self) {
        self.manager_done.set();
        self.receiver_done.set();
        self.router_done.set();
        self.sender_done.set();
    }

    /// Run the whole pipeline to completion on the calling thread.
    ///
    /// Teardown (`on_close`, `join_safe`, endpoint close) happens on
    /// every exit path: normal termination, a dead worker, a validation
    /// error, or an external shutdown signal.
    pub fn run_until_complete(&mut self) -> Result<()> {
        if let Err(reason) = self.callbacks.on_open() {
            self.join_safe();
            return Err(PipelineError::Callback { hook: "on_open", reason });
        }

        let result = match self.start() {
            Ok(()) => self.dispatch(),
            Err(e) => Err(e),
        };

        self.callbacks.on_close();
        self.join_safe();
        result
    }

    /// The callback dispatch loop: one `on_image` in flight at a time,
    /// overlays published back to the router.
    fn dispatch(&mut self) -> Result<()> {
        while !self.manager_done.is_set() {
            if let Err(e) = self.check_workers_alive() {
                // A dead worker ends the pipeline but is not an error of
                // the dispatch loop itself.
                warn!("{e}; stopping dispatch");
                break;
            }

            let data = match self.improc_consumer.as_mut() {
                Some(consumer) => match consumer.get(Some(DISPATCH_GET_TIMEOUT)) {
                    Ok(data) => data,
                    Err(QueueError::Empty) => continue,
                    Err(QueueError::Disconnected) => break,
                    Err(e) => return Err(e.into()),
                },
                None => break,
            };

            match self.callbacks.on_image(&data, self.shape) {
                Ok(result) => {
                    self.callback_failures = 0;
                    let (overlay, mask) = self.split_overlay_and_mask(result);
                    self.validate_overlay_and_mask(&overlay, &mask)?;
                    let bgra = mask::merge_to_bgra(&overlay, &mask);
                    match self.overlay_producer.as_mut() {
                        Some(producer) => {
                            match producer.put(&bgra, 0, Some(OVERLAY_PUT_TIMEOUT)) {
                                Ok(()) => {}
                                Err(QueueError::Full) => {
                                    warn!(
                                        frame = self.frame_index,
                                        "overlay queue blocked; dropping overlay"
                                    );
                                }
                                Err(QueueError::Disconnected) => break,
                                Err(e) => return Err(e.into()),
                            }
                        }
                        None => break,
                    }
                }
                // A failing module does not take the stream down; the
                // router keeps compositing with the previous overlay.
                // Only a module that keeps failing ends the pipeline.
                Err(reason) => {
                    self.callback_failures += 1;
                    error!(
                        frame = self.frame_index,
                        failures = self.callback_failures,
                        "on_image failed: {reason:#}"
                    );
                    if self.callback_failures >= CALLBACK_FAILURE_LIMIT {
                        return Err(PipelineError::Callback { hook: "on_image", reason });
                    }
                }
            }

            self.frame_index += 1;
            if self.frame_index % FRAME_LOGGING_STEP == 0 {
                debug!(frame = self.frame_index, "dispatch progress");
            }
        }
        Ok(())
    }

    /// Resolve a callback result into an (overlay, packed mask) pair,
    /// synthesising the mask by chroma key when the module returned a
    /// bare overlay.
    fn split_overlay_and_mask(&self, result: OnImageResult) -> (Vec<u8>, Vec<u8>) {
        match result {
            OnImageResult::Overlay(overlay) => {
                let mask = mask::generate_mask(&overlay, self.opts.chroma_color);
                (overlay, mask)
            }
            OnImageResult::OverlayWithMask { overlay, mask } => (overlay, mask),
        }
    }

    fn validate_overlay_and_mask(&self, overlay: &[u8], mask: &[u8]) -> Result<()> {
        if overlay.len() != self.shape.frame_bytes() {
            return Err(PipelineError::ShapeMismatch {
                what:     "overlay",
                expected: self.shape.frame_bytes(),
                actual:   overlay.len(),
            });
        }
        if mask.len() != self.shape.pixels() {
            return Err(PipelineError::ShapeMismatch {
                what:     "mask",
                expected: self.shape.pixels(),
                actual:   mask.len(),
            });
        }
        Ok(())
    }

    /// Signal everything, join each worker against `join_timeout`, detach
    /// survivors, and close the manager-owned endpoints. Idempotent.
    pub fn join_safe(&mut self) {
        self.done();

        let timeout = self.opts.join_timeout;
        for (name, slot) in [
            ("receiver", &mut self.receiver),
            ("router", &mut self.router),
            ("sender", &mut self.sender),
        ] {
            if let Some(handle) = slot.take() {
                join_with_timeout(name, handle, timeout);
            }
        }

        self.endpoints = None;
        self.improc_consumer = None;
        self.overlay_producer = None;
    }
}

// ── Worker thread plumbing ───────────────────────────────────────────────────

fn spawn_worker(
    name: &'static str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("framepipe-{name}"))
        .spawn(body)
        .map_err(|source| PipelineError::Spawn { worker: name, source })
}

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Join `handle` within `timeout`; a worker that will not stop is
/// detached (threads cannot be killed) so teardown stays bounded.
fn join_with_timeout(name: &'static str, handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(JOIN_POLL);
    }
    if handle.is_finished() {
        if handle.join().is_err() {
            warn!("{name} worker panicked");
        }
    } else {
        warn!("{name} worker did not stop within {timeout:?}; detaching");
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_core::mask::MASK_OPAQUE;
    use framepipe_core::Identity;

    fn test_manager(width: usize, height: usize) -> PipelineManager {
        let opts = PipelineOptions::new("in.mp4", "out.mp4", width, height);
        PipelineManager::new(opts, Box::new(Identity)).unwrap()
    }

    #[test]
    fn rejects_non_bgr_channel_count() {
        let mut opts = PipelineOptions::new("in.mp4", "out.mp4", 4, 4);
        opts.channels = 1;
        let err = PipelineManager::new(opts, Box::new(Identity)).err().unwrap();
        assert!(matches!(err, PipelineError::UnsupportedChannels(1)));
    }

    #[test]
    fn bare_overlay_gets_chroma_mask() {
        let manager = test_manager(2, 1);
        // One black pixel (transparent under the default chroma color),
        // one red pixel (opaque).
        let (overlay, mask) =
            manager.split_overlay_and_mask(OnImageResult::Overlay(vec![0, 0, 0, 0, 0, 255]));
        assert_eq!(overlay, vec![0, 0, 0, 0, 0, 255]);
        assert_eq!(mask, vec![0, MASK_OPAQUE]);
    }

    #[test]
    fn explicit_pair_is_used_as_is() {
        let manager = test_manager(2, 1);
        let (overlay, mask) = manager.split_overlay_and_mask(OnImageResult::OverlayWithMask {
            overlay: vec![1; 6],
            mask:    vec![7, 8],
        });
        assert_eq!(overlay, vec![1; 6]);
        assert_eq!(mask, vec![7, 8]);
    }

    #[test]
    fn validation_rejects_wrong_sizes() {
        let manager = test_manager(2, 2);
        let good_overlay = vec![0u8; manager.shape.frame_bytes()];
        let good_mask = vec![0u8; manager.shape.pixels()];

        manager.validate_overlay_and_mask(&good_overlay, &good_mask).unwrap();

        let err = manager
            .validate_overlay_and_mask(&good_overlay[1..], &good_mask)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { what: "overlay", .. }));

        let err = manager
            .validate_overlay_and_mask(&good_overlay, &good_mask[1..])
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { what: "mask", .. }));
    }

    #[test]
    fn workers_are_dead_before_start() {
        let manager = test_manager(2, 2);
        assert!(matches!(
            manager.check_workers_alive(),
            Err(PipelineError::WorkerDied("sender"))
        ));
    }

    #[test]
    fn join_safe_sets_flags_and_closes_endpoints() {
        let mut manager = test_manager(2, 2);
        manager.join_safe();
        assert!(manager.manager_done.is_set());
        assert!(manager.receiver_done.is_set());
        assert!(manager.router_done.is_set());
        assert!(manager.sender_done.is_set());
        assert!(manager.improc_consumer.is_none());
        assert!(manager.overlay_producer.is_none());
        // Idempotent.
        manager.join_safe();
    }

    #[test]
    fn shutdown_handle_sets_every_flag() {
        let manager = test_manager(2, 2);
        manager.shutdown_handle().shutdown();
        assert!(manager.manager_done.is_set());
        assert!(manager.sender_done.is_set());
    }

    #[test]
    fn join_with_timeout_is_bounded() {
        let start = Instant::now();
        let stuck = thread::spawn(|| thread::sleep(Duration::from_secs(2)));
        join_with_timeout("stuck", stuck, Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(1));

        let quick = thread::spawn(|| {});
        join_with_timeout("quick", quick, Duration::from_secs(1));
    }
}
