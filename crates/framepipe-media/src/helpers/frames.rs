// crates/framepipe-media/src/helpers/frames.rs
//
// Packed-bytes ↔ AVFrame plane copies.
//
// swscale aligns rows to the platform's preferred boundary, so a frame's
// stride is usually wider than its visible row. Queue slots carry packed
// rows; these two functions translate between the representations.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::util::frame::video::Video as VideoFrame;

/// Copy the visible pixels out of plane 0 into a packed buffer, dropping
/// the stride padding on every row.
pub fn pack_plane(frame: &VideoFrame, row_bytes: usize, rows: usize) -> Vec<u8> {
    let stride = frame.stride(0);
    let raw = frame.data(0);
    if stride == row_bytes {
        return raw[..rows * row_bytes].to_vec();
    }
    let mut packed = Vec::with_capacity(rows * row_bytes);
    for row in 0..rows {
        let start = row * stride;
        packed.extend_from_slice(&raw[start..start + row_bytes]);
    }
    packed
}

/// Copy packed rows into plane 0 of `frame`, honouring its stride.
pub fn unpack_plane(frame: &mut VideoFrame, packed: &[u8], row_bytes: usize, rows: usize) {
    let stride = frame.stride(0);
    let raw = frame.data_mut(0);
    if stride == row_bytes {
        raw[..rows * row_bytes].copy_from_slice(packed);
        return;
    }
    for row in 0..rows {
        let src = &packed[row * row_bytes..(row + 1) * row_bytes];
        raw[row * stride..row * stride + row_bytes].copy_from_slice(src);
    }
}
