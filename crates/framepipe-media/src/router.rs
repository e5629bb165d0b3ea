// crates/framepipe-media/src/router.rs
//
// Router worker: decouples the callback rate from the frame rate.
//
// At most one frame is ever in flight to the callback path. While a reply
// is outstanding, live frames keep flowing, composited against the last
// known overlay, so the output rate follows the decode rate rather than
// the callback rate. In synchronous mode the router instead blocks on the
// callback handoff, trading throughput for a callback that sees every
// frame.

use std::time::Duration;

use tracing::debug;

use framepipe_core::{mask, spsc, DoneFlag, FrameShape, QueueError};

use crate::error::{PipelineError, Result};

pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_PUT_TIMEOUT: Duration = Duration::from_secs(8);

pub struct Router {
    shape: FrameShape,
    receiver_consumer: spsc::Consumer,
    improc_producer:   spsc::Producer,
    overlay_consumer:  spsc::Consumer,
    sender_producer:   spsc::Producer,
    done: DoneFlag,
    synchronize: bool,
    get_timeout: Duration,
    put_timeout: Duration,

    /// True while one frame is out with the callback and its overlay has
    /// not come back yet.
    awaiting_overlay: bool,

    // Overlay cache. `mask_on`/`mask_off` are the 0/1 select complements,
    // recomputed once per overlay update. All zeros initially, so the
    // composite is the identity until the first overlay arrives.
    overlay:  Vec<u8>,
    mask_on:  Vec<u8>,
    mask_off: Vec<u8>,
}

impl Router {
    pub fn new(
        shape: FrameShape,
        receiver_consumer: spsc::Consumer,
        improc_producer: spsc::Producer,
        overlay_consumer: spsc::Consumer,
        sender_producer: spsc::Producer,
        done: DoneFlag,
        synchronize: bool,
    ) -> Result<Self> {
        if shape.channels != 3 {
            return Err(PipelineError::UnsupportedChannels(shape.channels));
        }
        // The callback path must gate at exactly one frame each way;
        // anything larger silently breaks the state machine.
        assert_eq!(improc_producer.capacity(), 1, "improc queue must have capacity 1");
        assert_eq!(overlay_consumer.capacity(), 1, "overlay queue must have capacity 1");

        let (overlay, mask_on, mask_off) = mask::identity_cache(shape);
        Ok(Self {
            shape,
            receiver_consumer,
            improc_producer,
            overlay_consumer,
            sender_producer,
            done,
            synchronize,
            get_timeout: DEFAULT_GET_TIMEOUT,
            put_timeout: DEFAULT_PUT_TIMEOUT,
            awaiting_overlay: false,
            overlay,
            mask_on,
            mask_off,
        })
    }

    pub fn get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout = timeout;
        self
    }

    pub fn put_timeout(mut self, timeout: Duration) -> Self {
        self.put_timeout = timeout;
        self
    }

    pub fn run(&mut self) -> Result<()> {
        while !self.done.is_set() {
            let data = match self.receiver_consumer.get(Some(self.get_timeout)) {
                Ok(data) => data,
                Err(QueueError::Empty) => continue,
                Err(QueueError::Disconnected) => break,
                Err(e) => return Err(e.into()),
            };
            if !self.route(data)? {
                break;
            }
        }
        debug!("router stopping");
        Ok(())
    }

    /// Move one live frame through the state machine: maybe hand it to
    /// the callback path, maybe collect a finished overlay, then
    /// composite and forward. Returns `Ok(false)` when the worker should
    /// stop.
    fn route(&mut self, mut data: Vec<u8>) -> Result<bool> {
        if !self.awaiting_overlay && !self.offer_to_callback(&data)? {
            return Ok(false);
        }

        if self.awaiting_overlay && !self.collect_overlay()? {
            return Ok(false);
        }

        mask::composite_in_place(&mut data, &self.overlay, &self.mask_on, &self.mask_off);

        match self.sender_producer.put(&data, 0, Some(self.put_timeout)) {
            Ok(()) => Ok(true),
            Err(QueueError::Full) => {
                debug!("sender queue full for {:?}; dropping composited frame", self.put_timeout);
                Ok(true)
            }
            Err(QueueError::Disconnected) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Idle-state handoff. Synchronous mode blocks until the callback
    /// path accepts the frame; asynchronous mode offers it once and moves
    /// on, leaving the frame unseen by the callback when the gate is
    /// occupied.
    fn offer_to_callback(&mut self, data: &[u8]) -> Result<bool> {
        if self.synchronize {
            loop {
                if self.done.is_set() {
                    return Ok(false);
                }
                match self.improc_producer.put(data, 0, Some(self.put_timeout)) {
                    Ok(()) => {
                        self.awaiting_overlay = true;
                        return Ok(true);
                    }
                    Err(QueueError::Full) => continue,
                    Err(QueueError::Disconnected) => return Ok(false),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if !self.improc_producer.is_full() {
            match self.improc_producer.put_nowait(data, 0) {
                Ok(()) => self.awaiting_overlay = true,
                Err(QueueError::Full) => {} // lost the race; stay idle
                Err(QueueError::Disconnected) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Awaiting-state reply pickup. Synchronous mode waits for the
    /// overlay; asynchronous mode polls and keeps streaming with the
    /// cached one.
    fn collect_overlay(&mut self) -> Result<bool> {
        if self.synchronize {
            loop {
                if self.done.is_set() {
                    return Ok(false);
                }
                match self.overlay_consumer.get(Some(self.get_timeout)) {
                    Ok(bgra) => {
                        self.update_overlay(&bgra)?;
                        self.awaiting_overlay = false;
                        return Ok(true);
                    }
                    Err(QueueError::Empty) => continue,
                    Err(QueueError::Disconnected) => return Ok(false),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        match self.overlay_consumer.get_nowait() {
            Ok(bgra) => {
                self.update_overlay(&bgra)?;
                self.awaiting_overlay = false;
                Ok(true)
            }
            Err(QueueError::Empty) => Ok(true),
            Err(QueueError::Disconnected) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Swap in a new overlay payload and recompute the select masks.
    fn update_overlay(&mut self, bgra: &[u8]) -> Result<()> {
        if bgra.len() != self.shape.overlay_bytes() {
            return Err(PipelineError::ShapeMismatch {
                what:     "overlay payload",
                expected: self.shape.overlay_bytes(),
                actual:   bgra.len(),
            });
        }
        let (overlay, packed_mask) = mask::split_bgra(bgra);
        let (mask_on, mask_off) = mask::split_mask_on_off(&packed_mask);
        self.overlay = overlay;
        self.mask_on = mask_on;
        self.mask_off = mask_off;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_core::mask::MASK_OPAQUE;
    use std::thread;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    struct Harness {
        rx_producer:      spsc::Producer,
        improc_consumer:  spsc::Consumer,
        overlay_producer: spsc::Producer,
        tx_consumer:      spsc::Consumer,
        done:             DoneFlag,
        router:           thread::JoinHandle<Result<()>>,
    }

    fn spawn_router(shape: FrameShape, synchronize: bool) -> Harness {
        let (rx_producer, rx_consumer) = spsc::channel(8, shape.frame_bytes());
        let (improc_producer, improc_consumer) = spsc::channel(1, shape.frame_bytes());
        let (overlay_producer, overlay_consumer) = spsc::channel(1, shape.overlay_bytes());
        let (tx_producer, tx_consumer) = spsc::channel(8, shape.frame_bytes());
        let done = DoneFlag::new();

        let mut router = Router::new(
            shape,
            rx_consumer,
            improc_producer,
            overlay_consumer,
            tx_producer,
            done.clone(),
            synchronize,
        )
        .unwrap()
        .get_timeout(Duration::from_millis(20))
        .put_timeout(Duration::from_millis(100));

        let handle = thread::spawn(move || router.run());
        Harness {
            rx_producer,
            improc_consumer,
            overlay_producer,
            tx_consumer,
            done,
            router: handle,
        }
    }

    fn frame(shape: FrameShape, value: u8) -> Vec<u8> {
        vec![value; shape.frame_bytes()]
    }

    #[test]
    fn passes_frames_through_before_any_overlay() {
        let shape = FrameShape::bgr(4, 2);
        let mut h = spawn_router(shape, false);

        for value in [10u8, 20, 30] {
            h.rx_producer.put(&frame(shape, value), 0, WAIT).unwrap();
        }
        for value in [10u8, 20, 30] {
            assert_eq!(h.tx_consumer.get(WAIT).unwrap(), frame(shape, value));
        }

        h.done.set();
        h.router.join().unwrap().unwrap();
    }

    #[test]
    fn forwards_one_frame_to_callback_and_applies_overlay() {
        let shape = FrameShape::bgr(2, 2);
        let mut h = spawn_router(shape, false);

        // First frame reaches the callback path.
        h.rx_producer.put(&frame(shape, 1), 0, WAIT).unwrap();
        assert_eq!(h.improc_consumer.get(WAIT).unwrap(), frame(shape, 1));
        assert_eq!(h.tx_consumer.get(WAIT).unwrap(), frame(shape, 1));

        // While the reply is outstanding, further frames bypass the
        // callback but still reach the sender.
        h.rx_producer.put(&frame(shape, 2), 0, WAIT).unwrap();
        assert_eq!(h.tx_consumer.get(WAIT).unwrap(), frame(shape, 2));
        assert!(h.improc_consumer.get_nowait().is_err());

        // Publish a full-mask overlay; subsequent frames are replaced.
        let overlay = frame(shape, 99);
        let bgra = mask::merge_to_bgra(&overlay, &vec![MASK_OPAQUE; shape.pixels()]);
        h.overlay_producer.put(&bgra, 0, WAIT).unwrap();

        // The overlay is collected when the next frame flows through.
        h.rx_producer.put(&frame(shape, 3), 0, WAIT).unwrap();
        assert_eq!(h.tx_consumer.get(WAIT).unwrap(), overlay);

        // The router is idle again, so this frame goes to the callback.
        h.rx_producer.put(&frame(shape, 4), 0, WAIT).unwrap();
        assert_eq!(h.improc_consumer.get(WAIT).unwrap(), frame(shape, 4));

        h.done.set();
        h.router.join().unwrap().unwrap();
    }

    #[test]
    fn output_preserves_decode_order() {
        let shape = FrameShape::bgr(2, 1);
        let mut h = spawn_router(shape, false);

        // The callback gate stays busy forever (no reply is ever posted),
        // so every frame flows straight through in decode order.
        for value in 0u8..32 {
            h.rx_producer.put(&frame(shape, value), 0, WAIT).unwrap();
            assert_eq!(h.tx_consumer.get(WAIT).unwrap(), frame(shape, value));
        }

        h.done.set();
        h.router.join().unwrap().unwrap();
    }

    #[test]
    fn synchronous_mode_waits_for_every_overlay() {
        let shape = FrameShape::bgr(2, 1);
        let mut h = spawn_router(shape, true);

        h.rx_producer.put(&frame(shape, 5), 0, WAIT).unwrap();
        assert_eq!(h.improc_consumer.get(WAIT).unwrap(), frame(shape, 5));

        // No output yet: the router blocks until the overlay lands.
        assert!(h.tx_consumer.get(Some(Duration::from_millis(50))).is_err());

        let overlay = frame(shape, 200);
        let bgra = mask::merge_to_bgra(&overlay, &vec![MASK_OPAQUE; shape.pixels()]);
        h.overlay_producer.put(&bgra, 0, WAIT).unwrap();
        assert_eq!(h.tx_consumer.get(WAIT).unwrap(), overlay);

        h.done.set();
        h.router.join().unwrap().unwrap();
    }

    #[test]
    fn done_flag_stops_an_idle_router() {
        let shape = FrameShape::bgr(2, 1);
        let h = spawn_router(shape, false);
        h.done.set();
        h.router.join().unwrap().unwrap();
    }

    #[test]
    fn rejects_non_bgr_shapes() {
        let shape = FrameShape { height: 2, width: 2, channels: 4 };
        let (_, rx_consumer) = spsc::channel(1, shape.frame_bytes());
        let (improc_producer, _) = spsc::channel(1, shape.frame_bytes());
        let (_, overlay_consumer) = spsc::channel(1, shape.overlay_bytes());
        let (tx_producer, _) = spsc::channel(1, shape.frame_bytes());
        let err = Router::new(
            shape,
            rx_consumer,
            improc_producer,
            overlay_consumer,
            tx_producer,
            DoneFlag::new(),
            false,
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::UnsupportedChannels(4)));
    }
}
