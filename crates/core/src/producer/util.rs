//! Ownership wrappers for FFmpeg frames, packets and codec parameters
//!
//! Raw `AVFrame`/`AVPacket` allocations are wrapped so native resources are
//! released exactly once on drop, and so they can cross thread boundaries
//! between the demuxer, decoder and orchestrator stages.

use std::ffi::CStr;
use std::ptr::NonNull;

use ffmpeg_next::ffi;

use crate::error::{Error, Result};
use crate::format::Rational;

/// The global time base, 1 / `AV_TIME_BASE` microsecond ticks
pub(crate) const TIME_BASE_Q: ffi::AVRational = ffi::AVRational {
    num: 1,
    den: ffi::AV_TIME_BASE as i32,
};

/// Render an AVERROR code as text via `av_strerror`
pub(crate) fn err_str(code: i32) -> String {
    let mut buf = [0 as libc::c_char; 64];
    unsafe {
        if ffi::av_strerror(code, buf.as_mut_ptr(), buf.len()) < 0 {
            return format!("unknown error {code}");
        }
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}

/// Turn a negative FFmpeg return code into an [`Error::Ffmpeg`]
pub(crate) fn check(call: &'static str, code: libc::c_int) -> Result<libc::c_int> {
    if code < 0 {
        Err(Error::Ffmpeg {
            call,
            code,
            message: err_str(code),
        })
    } else {
        Ok(code)
    }
}

pub(crate) fn to_av_q(r: Rational) -> ffi::AVRational {
    ffi::AVRational {
        num: r.num,
        den: r.den,
    }
}

pub(crate) fn rescale_q(a: i64, from: ffi::AVRational, to: ffi::AVRational) -> i64 {
    unsafe { ffi::av_rescale_q(a, from, to) }
}

// ============================================================================
// Packet
// ============================================================================

/// Owned compressed media unit
pub(crate) struct Packet(NonNull<ffi::AVPacket>);

// The wrapped AVPacket is exclusively owned and only touched through &mut.
unsafe impl Send for Packet {}

impl Packet {
    pub fn alloc() -> Result<Self> {
        NonNull::new(unsafe { ffi::av_packet_alloc() })
            .map(Packet)
            .ok_or(Error::Alloc("av_packet_alloc"))
    }

    pub fn as_mut_ptr(&mut self) -> *mut ffi::AVPacket {
        self.0.as_ptr()
    }

    pub fn stream_index(&self) -> usize {
        unsafe { (*self.0.as_ptr()).stream_index as usize }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let mut ptr = self.0.as_ptr();
        unsafe { ffi::av_packet_free(&mut ptr) };
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Owned decoded media unit (video picture or audio chunk)
pub struct Frame(NonNull<ffi::AVFrame>);

// Owned pointer; shared references only read immutable fields.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    pub(crate) fn alloc() -> Result<Self> {
        NonNull::new(unsafe { ffi::av_frame_alloc() })
            .map(Frame)
            .ok_or(Error::Alloc("av_frame_alloc"))
    }

    pub(crate) fn as_ptr(&self) -> *const ffi::AVFrame {
        self.0.as_ptr()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut ffi::AVFrame {
        self.0.as_ptr()
    }

    /// Presentation timestamp in the producing stage's time base
    pub fn pts(&self) -> i64 {
        unsafe { (*self.0.as_ptr()).pts }
    }

    pub(crate) fn set_pts(&mut self, pts: i64) {
        unsafe { (*self.0.as_ptr()).pts = pts };
    }

    /// Picture width, 0 for audio frames
    pub fn width(&self) -> u32 {
        unsafe { (*self.0.as_ptr()).width.max(0) as u32 }
    }

    /// Picture height, 0 for audio frames
    pub fn height(&self) -> u32 {
        unsafe { (*self.0.as_ptr()).height.max(0) as u32 }
    }

    /// Audio sample count, 0 for video frames
    pub fn samples(&self) -> usize {
        unsafe { (*self.0.as_ptr()).nb_samples.max(0) as usize }
    }

    /// A frame with no payload, used as an end-of-stream marker whose pts
    /// tells downstream where the stream would have continued
    pub(crate) fn is_marker(&self) -> bool {
        unsafe { (*self.0.as_ptr()).data[0].is_null() }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let mut ptr = self.0.as_ptr();
        unsafe { ffi::av_frame_free(&mut ptr) };
    }
}

// ============================================================================
// Codec parameters
// ============================================================================

/// Owned copy of a stream's `AVCodecParameters`
pub(crate) struct CodecParameters(NonNull<ffi::AVCodecParameters>);

unsafe impl Send for CodecParameters {}
unsafe impl Sync for CodecParameters {}

impl CodecParameters {
    /// Snapshot the parameters of an open stream
    pub fn from_raw(src: *const ffi::AVCodecParameters) -> Result<Self> {
        let dst = NonNull::new(unsafe { ffi::avcodec_parameters_alloc() })
            .ok_or(Error::Alloc("avcodec_parameters_alloc"))?;
        unsafe {
            check(
                "avcodec_parameters_copy",
                ffi::avcodec_parameters_copy(dst.as_ptr(), src),
            )?;
        }
        Ok(CodecParameters(dst))
    }

    pub fn as_ptr(&self) -> *const ffi::AVCodecParameters {
        self.0.as_ptr()
    }

    pub fn codec_id(&self) -> ffi::AVCodecID {
        unsafe { (*self.0.as_ptr()).codec_id }
    }
}

impl Drop for CodecParameters {
    fn drop(&mut self) {
        let mut ptr = self.0.as_ptr();
        unsafe { ffi::avcodec_parameters_free(&mut ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_allocates_and_frees() {
        let pkt = Packet::alloc().unwrap();
        assert_eq!(pkt.stream_index(), 0);
    }

    #[test]
    fn fresh_frame_is_a_marker() {
        let frame = Frame::alloc().unwrap();
        assert!(frame.is_marker());
        assert_eq!(frame.samples(), 0);
    }

    #[test]
    fn rescale_microseconds_to_pal_frames() {
        let frames = rescale_q(
            1_000_000,
            TIME_BASE_Q,
            ffi::AVRational { num: 1, den: 25 },
        );
        assert_eq!(frames, 25);
    }

    #[test]
    fn err_str_is_nonempty_for_eof() {
        assert!(!err_str(ffi::AVERROR_EOF).is_empty());
    }
}
