//! Frames handed to the downstream compositor
//!
//! An [`OutputFrame`] pairs at most one conformant video frame with at most
//! one audio chunk and carries timing in the global time base. The pixel
//! data stays in the filter sink's buffers until the consumer asks for a
//! packed copy.

use std::ffi::c_int;
use std::sync::Arc;

use ffmpeg_next::ffi;

use crate::format::FieldOrder;

use super::util::Frame;

/// One produced frame in the global (AV_TIME_BASE) clock
#[derive(Clone)]
pub struct OutputFrame {
    pub(crate) video: Option<Arc<Frame>>,
    pub(crate) audio: Option<Arc<Frame>>,
    /// Presentation time in AV_TIME_BASE units, relative to clip start
    pub pts: i64,
    /// Display duration in AV_TIME_BASE units
    pub duration: i64,
}

/// What the consumer receives on each tick
#[derive(Clone)]
pub enum DrawFrame {
    /// Nothing available right now; not an error, repeat the last image
    Late,
    /// One progressive frame (video, audio, or both)
    Progressive(OutputFrame),
    /// Two consecutive field frames composing one interlaced frame
    Interlaced {
        /// Temporally first field frame
        first: OutputFrame,
        /// Temporally second field frame
        second: OutputFrame,
        /// Which field is displayed first
        order: FieldOrder,
    },
    /// A freeze of an earlier frame (no advancement)
    Still(OutputFrame),
}

impl DrawFrame {
    /// True for the underflow sentinel
    pub fn is_late(&self) -> bool {
        matches!(self, DrawFrame::Late)
    }

    /// Presentation time of the (first) frame, when one is carried
    pub fn pts(&self) -> Option<i64> {
        match self {
            DrawFrame::Late => None,
            DrawFrame::Progressive(f) | DrawFrame::Still(f) => Some(f.pts),
            DrawFrame::Interlaced { first, .. } => Some(first.pts),
        }
    }
}

/// A packed copy of one video plane
pub struct Plane {
    /// Row-major bytes, `linesize` per row
    pub data: Vec<u8>,
    /// Packed bytes per row
    pub linesize: usize,
    /// Row count
    pub rows: usize,
}

/// A packed copy of a whole picture
pub struct VideoImage {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Raw `AVPixelFormat` value of the planes
    pub pixel_format: i32,
    /// One entry per plane
    pub planes: Vec<Plane>,
}

impl OutputFrame {
    pub(crate) fn new(
        video: Option<Arc<Frame>>,
        audio: Option<Arc<Frame>>,
        pts: i64,
        duration: i64,
    ) -> Self {
        Self {
            video,
            audio,
            pts,
            duration,
        }
    }

    /// True when a video picture is carried
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// True when audio samples are carried
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Picture width, 0 without video
    pub fn width(&self) -> u32 {
        self.video.as_ref().map(|f| f.width()).unwrap_or(0)
    }

    /// Picture height, 0 without video
    pub fn height(&self) -> u32 {
        self.video.as_ref().map(|f| f.height()).unwrap_or(0)
    }

    /// Interleaved signed 32-bit samples at the channel's sample rate
    pub fn audio_samples(&self) -> Option<&[i32]> {
        let frame = self.audio.as_ref()?;
        unsafe {
            let f = frame.as_ptr();
            let channels = (*f).ch_layout.nb_channels.max(0) as usize;
            let samples = (*f).nb_samples.max(0) as usize;
            if (*f).data[0].is_null() || channels == 0 || samples == 0 {
                return None;
            }
            Some(std::slice::from_raw_parts(
                (*f).data[0] as *const i32,
                samples * channels,
            ))
        }
    }

    /// Copy the picture into packed per-plane buffers.
    ///
    /// Rows are copied one at a time because the source `linesize` may
    /// exceed the packed row width; the result uses the tight stride.
    pub fn copy_video(&self) -> Option<VideoImage> {
        let frame = self.video.as_ref()?;
        unsafe {
            let f = frame.as_ptr();
            let width = (*f).width;
            let height = (*f).height;
            if width <= 0 || height <= 0 || (*f).data[0].is_null() {
                return None;
            }

            let pixel_format: ffi::AVPixelFormat = std::mem::transmute((*f).format);
            let desc = ffi::av_pix_fmt_desc_get(pixel_format);
            if desc.is_null() {
                return None;
            }
            let log2_chroma_h = (*desc).log2_chroma_h;

            let mut planes = Vec::new();
            for plane in 0..(*f).data.len() {
                let src = (*f).data[plane];
                if src.is_null() {
                    break;
                }

                let linesize = ffi::av_image_get_linesize(pixel_format, width, plane as c_int);
                if linesize <= 0 {
                    return None;
                }
                let linesize = linesize as usize;

                let rows = if plane == 1 || plane == 2 {
                    (height >> log2_chroma_h) as usize
                } else {
                    height as usize
                };

                let src_stride = (*f).linesize[plane] as usize;
                let mut data = vec![0u8; linesize * rows];
                for y in 0..rows {
                    std::ptr::copy_nonoverlapping(
                        src.add(y * src_stride),
                        data[y * linesize..].as_mut_ptr(),
                        linesize,
                    );
                }
                planes.push(Plane {
                    data,
                    linesize,
                    rows,
                });
            }

            Some(VideoImage {
                width: width as u32,
                height: height as u32,
                pixel_format: (*f).format,
                planes,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frame_reports_no_media() {
        let frame = OutputFrame::new(None, None, 0, 40_000);
        assert!(!frame.has_video());
        assert!(!frame.has_audio());
        assert_eq!(frame.width(), 0);
        assert_eq!(frame.height(), 0);
        assert!(frame.audio_samples().is_none());
        assert!(frame.copy_video().is_none());
    }

    #[test]
    fn late_sentinel_has_no_pts() {
        assert!(DrawFrame::Late.is_late());
        assert_eq!(DrawFrame::Late.pts(), None);
    }

    #[test]
    fn interlaced_pair_reports_first_field_time() {
        let first = OutputFrame::new(None, None, 20_000, 20_000);
        let second = OutputFrame::new(None, None, 40_000, 20_000);
        let frame = DrawFrame::Interlaced {
            first,
            second,
            order: FieldOrder::TopFieldFirst,
        };
        assert_eq!(frame.pts(), Some(20_000));
        assert!(!frame.is_late());
    }
}
