//! Internal utility functions.
//!
//! Helpers for pixel-data copying and timestamp arithmetic shared by the
//! FFmpeg engine, the worker and the bridge.

use ffmpeg_next::{Rational, frame::Video as VideoFrame};

/// Copy pixel data from an FFmpeg video frame into a tightly-packed RGB buffer.
///
/// FFmpeg frames frequently carry per-row padding (stride > width × 3).
/// This function strips that padding so the result can be passed directly to
/// [`image::RgbImage::from_raw`].
pub(crate) fn frame_to_rgb_buffer(video_frame: &VideoFrame, width: u32, height: u32) -> Vec<u8> {
    let stride = video_frame.stride(0);
    let expected_stride = (width as usize) * 3;
    let data = video_frame.data(0);

    if stride == expected_stride {
        data[..expected_stride * (height as usize)].to_vec()
    } else {
        let mut buffer = Vec::with_capacity(expected_stride * (height as usize));
        for row in 0..(height as usize) {
            let row_start = row * stride;
            buffer.extend_from_slice(&data[row_start..row_start + expected_stride]);
        }
        buffer
    }
}

/// Copy a tightly-packed RGB buffer into an FFmpeg frame, honouring its stride.
pub(crate) fn rgb_buffer_to_frame(rgb: &[u8], video_frame: &mut VideoFrame, width: u32, height: u32) {
    let stride = video_frame.stride(0);
    let row_len = (width as usize) * 3;
    let plane = video_frame.data_mut(0);
    for row in 0..(height as usize) {
        let src_start = row * row_len;
        let dst_start = row * stride;
        plane[dst_start..dst_start + row_len].copy_from_slice(&rgb[src_start..src_start + row_len]);
    }
}

/// Rescale a PTS value from stream time base to seconds.
pub(crate) fn pts_to_seconds(pts: i64, time_base: Rational) -> f64 {
    pts as f64 * time_base.numerator() as f64 / time_base.denominator() as f64
}
