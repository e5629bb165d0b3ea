// crates/framepipe-core/src/callback.rs
//
// The seam between the pipeline and user-supplied frame modules.
//
// The manager invokes exactly one `on_image` at a time (the improc queue
// gates at capacity 1), so implementations are free to keep mutable state
// without synchronisation. Hook errors do not use the typed queue errors:
// a module can fail for any reason, so the hooks speak `anyhow`.

use anyhow::Result;

use crate::mask::MASK_OPAQUE;
use crate::shape::FrameShape;

/// What a module hands back for one input frame.
pub enum OnImageResult {
    /// A bare overlay; the manager synthesizes the mask by chroma key.
    Overlay(Vec<u8>),
    /// An explicit overlay/mask pair, used as-is after validation.
    OverlayWithMask { overlay: Vec<u8>, mask: Vec<u8> },
}

/// Per-frame transformation hooks.
///
/// `on_open` runs once before any frame, `on_close` once at shutdown on
/// every exit path. `on_image` receives the live frame as packed BGR bytes
/// of `shape.frame_bytes()` length and returns the overlay to paint onto
/// the stream.
pub trait FrameCallback: Send {
    fn on_open(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_image(&mut self, image: &[u8], shape: FrameShape) -> Result<OnImageResult>;

    fn on_close(&mut self) {}
}

/// Passes every frame through unchanged: the overlay is the input with a
/// fully opaque mask, so the composite output equals the live stream.
#[derive(Debug, Default)]
pub struct Identity;

impl FrameCallback for Identity {
    fn on_image(&mut self, image: &[u8], shape: FrameShape) -> Result<OnImageResult> {
        Ok(OnImageResult::OverlayWithMask {
            overlay: image.to_vec(),
            mask:    vec![MASK_OPAQUE; shape.pixels()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_returns_input_with_opaque_mask() {
        let shape = FrameShape::bgr(2, 1);
        let image = [1u8, 2, 3, 4, 5, 6];
        match Identity.on_image(&image, shape).unwrap() {
            OnImageResult::OverlayWithMask { overlay, mask } => {
                assert_eq!(overlay, image);
                assert_eq!(mask, vec![MASK_OPAQUE; 2]);
            }
            OnImageResult::Overlay(_) => panic!("expected an explicit mask"),
        }
    }
}
