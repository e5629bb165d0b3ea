// src/modules.rs
//
// Built-in frame modules, selected by name on the command line. External
// module discovery lives outside this binary; these cover the common
// cases and double as reference implementations of the callback contract.

use anyhow::{bail, Result};

use framepipe_core::callback::{FrameCallback, Identity, OnImageResult};
use framepipe_core::mask::MASK_OPAQUE;
use framepipe_core::FrameShape;

/// How a module is requested: a name, its arguments, and whether it must
/// be constructed without shared state. Built-ins are constructed fresh
/// per pipeline, so `isolate` is already satisfied for them.
#[derive(Debug, Clone)]
pub struct ModuleOptions {
    pub name:    String,
    pub args:    Vec<String>,
    pub isolate: bool,
}

pub fn create(options: &ModuleOptions) -> Result<Box<dyn FrameCallback>> {
    tracing::debug!(
        args = ?options.args,
        isolate = options.isolate,
        "constructing module '{}'",
        options.name
    );
    match options.name.as_str() {
        "identity" => Ok(Box::new(Identity)),
        "grayscale" => Ok(Box::new(Grayscale)),
        "blackout" => Ok(Box::new(Blackout)),
        name => bail!("unknown module '{name}' (built-ins: identity, grayscale, blackout)"),
    }
}

/// Replaces every pixel with its channel mean.
struct Grayscale;

impl FrameCallback for Grayscale {
    fn on_image(&mut self, image: &[u8], shape: FrameShape) -> Result<OnImageResult> {
        let mut overlay = Vec::with_capacity(image.len());
        for px in image.chunks_exact(3) {
            let mean = ((px[0] as u16 + px[1] as u16 + px[2] as u16) / 3) as u8;
            overlay.extend_from_slice(&[mean, mean, mean]);
        }
        Ok(OnImageResult::OverlayWithMask {
            overlay,
            mask: vec![MASK_OPAQUE; shape.pixels()],
        })
    }
}

/// Covers the whole stream with black: a black overlay under a fully
/// opaque mask. Exercises the explicit-mask path end to end.
struct Blackout;

impl FrameCallback for Blackout {
    fn on_image(&mut self, image: &[u8], shape: FrameShape) -> Result<OnImageResult> {
        Ok(OnImageResult::OverlayWithMask {
            overlay: vec![0; image.len()],
            mask:    vec![MASK_OPAQUE; shape.pixels()],
        })
    }
}
