// crates/framepipe-core/src/mask.rs
//
// Chroma-key masks and masked composition over packed BGR byte buffers.
//
// A mask is one byte per pixel, stored packed as 0/255 on the wire (the
// chroma-key output) and split into 0/1 `mask_on`/`mask_off` complements
// for composition. Because the split masks are binary, the composite
//
//     out = live * mask_off + overlay * mask_on
//
// is a branch-free per-pixel select: two multiplies and an add, no
// comparison in the hot loop. The split costs one `!= 0` pass per overlay
// update, not per frame.

use rayon::prelude::*;

use crate::shape::{FrameShape, BGRA_CHANNELS, BGR_CHANNELS};

/// Chroma color treated as transparent when a callback returns a bare
/// overlay: pixels equal to it get mask 0, everything else 255.
pub const DEFAULT_CHROMA_COLOR: [u8; 3] = [0, 0, 0];

/// Packed mask value for an opaque pixel.
pub const MASK_OPAQUE: u8 = 255;

/// Synthesize a packed 0/255 mask from `overlay` by comparing every pixel
/// against `chroma`. The overlay is packed BGR, the mask one byte per
/// pixel.
pub fn generate_mask(overlay: &[u8], chroma: [u8; 3]) -> Vec<u8> {
    overlay
        .chunks_exact(BGR_CHANNELS)
        .map(|px| if px == chroma { 0 } else { MASK_OPAQUE })
        .collect()
}

/// Split a packed 0/255 mask into its 0/1 select complements
/// `(mask_on, mask_off)`.
pub fn split_mask_on_off(mask: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mask_on: Vec<u8> = mask.iter().map(|&m| u8::from(m != 0)).collect();
    let mask_off: Vec<u8> = mask_on.iter().map(|&on| 1 - on).collect();
    (mask_on, mask_off)
}

/// Interleave a packed BGR overlay and a per-pixel mask into one BGRA
/// buffer (the wire format of the overlay queue).
pub fn merge_to_bgra(overlay: &[u8], mask: &[u8]) -> Vec<u8> {
    debug_assert_eq!(overlay.len(), mask.len() * BGR_CHANNELS);
    let mut bgra = Vec::with_capacity(mask.len() * BGRA_CHANNELS);
    for (px, &m) in overlay.chunks_exact(BGR_CHANNELS).zip(mask.iter()) {
        bgra.extend_from_slice(px);
        bgra.push(m);
    }
    bgra
}

/// Split a BGRA overlay payload back into packed BGR overlay bytes and a
/// packed per-pixel mask.
pub fn split_bgra(bgra: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let pixels = bgra.len() / BGRA_CHANNELS;
    let mut overlay = Vec::with_capacity(pixels * BGR_CHANNELS);
    let mut mask = Vec::with_capacity(pixels);
    for px in bgra.chunks_exact(BGRA_CHANNELS) {
        overlay.extend_from_slice(&px[..BGR_CHANNELS]);
        mask.push(px[BGR_CHANNELS]);
    }
    (overlay, mask)
}

/// Composite `overlay` onto `live` in place under the pre-split select
/// masks: `live = live * mask_off + overlay * mask_on`, saturated to u8.
///
/// Parallelised over pixels; the per-frame cost at 1080p is the dominant
/// CPU load of the router, so this runs on the rayon pool.
pub fn composite_in_place(live: &mut [u8], overlay: &[u8], mask_on: &[u8], mask_off: &[u8]) {
    debug_assert_eq!(live.len(), overlay.len());
    debug_assert_eq!(live.len(), mask_on.len() * BGR_CHANNELS);
    debug_assert_eq!(mask_on.len(), mask_off.len());

    live.par_chunks_exact_mut(BGR_CHANNELS)
        .zip(overlay.par_chunks_exact(BGR_CHANNELS))
        .zip(mask_on.par_iter().zip(mask_off.par_iter()))
        .for_each(|((dst, src), (&on, &off))| {
            for c in 0..BGR_CHANNELS {
                dst[c] = dst[c]
                    .saturating_mul(off)
                    .saturating_add(src[c].saturating_mul(on));
            }
        });
}

/// All-zero overlay cache matching `shape`: identity composition until the
/// first real overlay arrives.
pub fn identity_cache(shape: FrameShape) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let overlay = vec![0u8; shape.frame_bytes()];
    let mask_on = vec![0u8; shape.pixels()];
    let mask_off = vec![1u8; shape.pixels()];
    (overlay, mask_on, mask_off)
}
