//! Container input: demuxing worker with bounded packet output
//!
//! Opens a local file or network URL through libavformat, snapshots the
//! stream inventory, then reads packets on a worker thread into a bounded
//! queue. End-of-file pushes a null marker and parks the worker until the
//! input is resumed or sought.

use std::collections::VecDeque;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use ffmpeg_next::ffi;

use crate::error::{Error, Result};
use crate::format::Rational;

use super::util::{check, err_str, CodecParameters, Packet};

/// Packets buffered ahead of the decoders
const OUTPUT_CAPACITY: usize = 64;

/// I/O read/write timeout for network inputs, in microseconds
const NETWORK_RW_TIMEOUT: &CStr = c"5000000";

/// Media kind of an elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// A coded video track
    Video,
    /// A coded audio track
    Audio,
}

/// Kind-specific stream properties
#[derive(Debug)]
pub enum StreamDetails {
    /// Video-only properties
    Video {
        /// Coded width in pixels
        width: u32,
        /// Coded height in pixels
        height: u32,
        /// Raw `AVPixelFormat` value
        pixel_format: i32,
        /// Best-guess frame rate, when the container knows one
        frame_rate: Option<Rational>,
        /// Sample aspect ratio, when valid
        sample_aspect: Option<Rational>,
    },
    /// Audio-only properties
    Audio {
        /// Samples per second
        sample_rate: u32,
        /// Raw `AVSampleFormat` value
        sample_format: i32,
        /// Channel layout description (e.g. "stereo")
        channel_layout: String,
    },
}

/// Immutable per-stream metadata snapshotted at open
pub struct StreamInfo {
    /// Container stream index
    pub index: usize,
    /// Video or audio
    pub kind: MediaKind,
    /// Stream time base
    pub time_base: Rational,
    /// Stream start time in its own time base, when known
    pub start_time: Option<i64>,
    /// Stream duration in its own time base, when known
    pub duration: Option<i64>,
    /// Kind-specific properties
    pub details: StreamDetails,
    /// Codec parameters for opening a decoder
    pub(crate) codecpar: CodecParameters,
}

/// Queue entry: `None` is the end-of-file marker
type Entry = Option<Packet>;

struct PacketQueue {
    packets: VecDeque<Entry>,
    paused: bool,
    eof: bool,
}

struct FormatContext(*mut ffi::AVFormatContext);

// Guarded by the format mutex; the interrupt callback only reads an atomic.
unsafe impl Send for FormatContext {}

impl Drop for FormatContext {
    fn drop(&mut self) {
        unsafe { ffi::avformat_close_input(&mut self.0) };
    }
}

struct Shared {
    format: Mutex<FormatContext>,
    queue: Mutex<PacketQueue>,
    cond: Condvar,
    /// Orchestrator wakeup, signalled whenever output lands in the queue
    wake: Arc<Condvar>,
    abort: Arc<AtomicBool>,
}

/// Demuxer front-end owning the format context and the reader thread
pub(crate) struct Input {
    shared: Arc<Shared>,
    streams: Vec<StreamInfo>,
    start_time: Option<i64>,
    duration: Option<i64>,
    url: String,
    thread: Option<thread::JoinHandle<()>>,
}

/// Polled by blocking libavformat I/O; non-zero unwinds the read
extern "C" fn interrupt_cb(opaque: *mut c_void) -> c_int {
    let abort = unsafe { &*(opaque as *const AtomicBool) };
    abort.load(Ordering::Relaxed) as c_int
}

impl Input {
    pub fn open(url: &str, wake: Arc<Condvar>) -> Result<Self> {
        ffmpeg_next::init().map_err(|e| Error::Open {
            url: url.to_string(),
            message: format!("ffmpeg init: {e}"),
        })?;

        let c_url = CString::new(url).map_err(|_| Error::Open {
            url: url.to_string(),
            message: "url contains interior nul".to_string(),
        })?;

        let abort = Arc::new(AtomicBool::new(false));

        let mut ctx = ptr::null_mut();
        unsafe {
            let mut options: *mut ffi::AVDictionary = ptr::null_mut();
            if url.contains("://") {
                ffi::av_dict_set(&mut options, c"reconnect".as_ptr(), c"1".as_ptr(), 0);
                ffi::av_dict_set(
                    &mut options,
                    c"rw_timeout".as_ptr(),
                    NETWORK_RW_TIMEOUT.as_ptr(),
                    0,
                );
            }

            let ret = ffi::avformat_open_input(&mut ctx, c_url.as_ptr(), ptr::null(), &mut options);
            ffi::av_dict_free(&mut options);
            if ret < 0 {
                return Err(Error::Open {
                    url: url.to_string(),
                    message: err_str(ret),
                });
            }

            (*ctx).interrupt_callback = ffi::AVIOInterruptCB {
                callback: Some(interrupt_cb),
                opaque: Arc::as_ptr(&abort) as *mut c_void,
            };

            let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                let message = err_str(ret);
                ffi::avformat_close_input(&mut ctx);
                return Err(Error::Open {
                    url: url.to_string(),
                    message,
                });
            }
        }

        let streams = unsafe { snapshot_streams(ctx) }?;
        let (start_time, duration) = unsafe {
            let st = (*ctx).start_time;
            let dur = (*ctx).duration;
            (
                (st != ffi::AV_NOPTS_VALUE).then_some(st),
                (dur != ffi::AV_NOPTS_VALUE && dur > 0).then_some(dur),
            )
        };

        tracing::debug!(
            url,
            streams = streams.len(),
            start_time = ?start_time,
            duration = ?duration,
            "opened media input"
        );

        let shared = Arc::new(Shared {
            format: Mutex::new(FormatContext(ctx)),
            queue: Mutex::new(PacketQueue {
                packets: VecDeque::new(),
                paused: false,
                eof: false,
            }),
            cond: Condvar::new(),
            wake,
            abort,
        });

        let worker_shared = Arc::clone(&shared);
        let worker_url = url.to_string();
        let thread = thread::Builder::new()
            .name("media-input".to_string())
            .spawn(move || read_loop(worker_shared, worker_url))?;

        Ok(Self {
            shared,
            streams,
            start_time,
            duration,
            url: url.to_string(),
            thread: Some(thread),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    /// Container start time in AV_TIME_BASE units, zero when unknown
    pub fn start_time(&self) -> i64 {
        self.start_time.unwrap_or(0)
    }

    /// Container duration in AV_TIME_BASE units, when known
    pub fn duration(&self) -> Option<i64> {
        self.duration
    }

    pub fn paused(&self) -> bool {
        self.shared.queue.lock().unwrap().paused
    }

    pub fn eof(&self) -> bool {
        self.shared.queue.lock().unwrap().eof
    }

    /// Suspend or resume the reader; resuming clears the eof latch
    pub fn set_paused(&self, paused: bool) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.paused = paused;
            if !paused {
                queue.eof = false;
            }
        }
        self.shared.cond.notify_all();
    }

    /// Seek the container to the nearest keyframe at or before `ts`
    /// (AV_TIME_BASE units). With `flush` the buffered packets are dropped;
    /// without, they are kept so already-produced output survives a loop
    /// point.
    pub fn seek(&self, ts: i64, flush: bool) -> Result<()> {
        let format = self.shared.format.lock().unwrap();
        unsafe {
            check(
                "avformat_seek_file",
                ffi::avformat_seek_file(format.0, -1, i64::MIN, ts, ts, 0),
            )?;
        }

        {
            let mut queue = self.shared.queue.lock().unwrap();
            if flush {
                queue.packets.clear();
            }
            queue.paused = false;
            queue.eof = false;
        }
        self.shared.cond.notify_all();

        tracing::debug!(ts, flush, "input seek");
        Ok(())
    }

    /// Hand buffered packets to `sink` in file order, popping each entry the
    /// sink accepts. The sink takes ownership out of the entry; returning
    /// false leaves the entry queued and stops the drain.
    pub fn drain(&self, mut sink: impl FnMut(&mut Entry) -> bool) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            while let Some(front) = queue.packets.front_mut() {
                if !sink(front) {
                    break;
                }
                queue.packets.pop_front();
            }
        }
        self.shared.cond.notify_all();
    }
}

impl Drop for Input {
    fn drop(&mut self) {
        self.shared.abort.store(true, Ordering::Relaxed);
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn read_loop(shared: Arc<Shared>, url: String) {
    loop {
        {
            let queue = wait_for_capacity(&shared);
            if shared.abort.load(Ordering::Relaxed) {
                return;
            }
            drop(queue);
        }

        let format = shared.format.lock().unwrap();

        let mut packet = match Packet::alloc() {
            Ok(packet) => packet,
            Err(e) => {
                tracing::error!(url = %url, error = %e, "packet allocation failed");
                return;
            }
        };

        let ret = unsafe { ffi::av_read_frame(format.0, packet.as_mut_ptr()) };
        drop(format);

        if ret == ffi::AVERROR_EXIT {
            return;
        }

        let mut queue = shared.queue.lock().unwrap();
        if ret == ffi::AVERROR_EOF {
            queue.paused = true;
            queue.eof = true;
            queue.packets.push_back(None);
        } else if ret < 0 {
            // Read errors other than EOF end the reader; downstream sees an
            // empty queue with eof latched.
            tracing::error!(url = %url, error = %err_str(ret), "read failed, stopping input");
            queue.paused = true;
            queue.eof = true;
            queue.packets.push_back(None);
            drop(queue);
            shared.cond.notify_all();
            shared.wake.notify_all();
            return;
        } else {
            queue.packets.push_back(Some(packet));
        }
        drop(queue);
        shared.cond.notify_all();
        shared.wake.notify_all();
    }
}

/// Block until the reader may read: not paused and below capacity, or abort
fn wait_for_capacity(shared: &Shared) -> std::sync::MutexGuard<'_, PacketQueue> {
    let queue = shared.queue.lock().unwrap();
    shared
        .cond
        .wait_while(queue, |q| {
            !shared.abort.load(Ordering::Relaxed)
                && (q.paused || q.packets.len() >= OUTPUT_CAPACITY)
        })
        .unwrap()
}

unsafe fn snapshot_streams(ctx: *mut ffi::AVFormatContext) -> Result<Vec<StreamInfo>> {
    let mut streams = Vec::new();

    for n in 0..(*ctx).nb_streams as usize {
        let stream = *(*ctx).streams.add(n);
        let par = (*stream).codecpar;

        let kind = match (*par).codec_type {
            ffi::AVMediaType::AVMEDIA_TYPE_VIDEO => MediaKind::Video,
            ffi::AVMediaType::AVMEDIA_TYPE_AUDIO => MediaKind::Audio,
            other => {
                tracing::debug!(stream = n, codec_type = ?other, "ignoring stream");
                continue;
            }
        };

        let details = match kind {
            MediaKind::Video => {
                let fr = ffi::av_guess_frame_rate(ctx, stream, ptr::null_mut());
                let sar = ffi::av_guess_sample_aspect_ratio(ctx, stream, ptr::null_mut());
                StreamDetails::Video {
                    width: (*par).width.max(0) as u32,
                    height: (*par).height.max(0) as u32,
                    pixel_format: (*par).format,
                    frame_rate: (fr.num > 0 && fr.den > 0)
                        .then_some(Rational::new(fr.num, fr.den)),
                    sample_aspect: (sar.num > 0 && sar.den > 0)
                        .then_some(Rational::new(sar.num, sar.den)),
                }
            }
            MediaKind::Audio => StreamDetails::Audio {
                sample_rate: (*par).sample_rate.max(0) as u32,
                sample_format: (*par).format,
                channel_layout: describe_channel_layout(par),
            },
        };

        let tb = (*stream).time_base;
        streams.push(StreamInfo {
            index: n,
            kind,
            time_base: Rational::new(tb.num, tb.den),
            start_time: ((*stream).start_time != ffi::AV_NOPTS_VALUE)
                .then_some((*stream).start_time),
            duration: ((*stream).duration != ffi::AV_NOPTS_VALUE && (*stream).duration > 0)
                .then_some((*stream).duration),
            details,
            codecpar: CodecParameters::from_raw(par)?,
        });
    }

    Ok(streams)
}

unsafe fn describe_channel_layout(par: *const ffi::AVCodecParameters) -> String {
    let mut layout = (*par).ch_layout;
    if layout.nb_channels <= 0 {
        return String::new();
    }
    if layout.order == ffi::AVChannelOrder::AV_CHANNEL_ORDER_UNSPEC {
        ffi::av_channel_layout_default(&mut layout, layout.nb_channels);
    }

    let mut buf = [0 as c_char; 64];
    let ret = ffi::av_channel_layout_describe(&layout, buf.as_mut_ptr(), buf.len());
    if ret < 0 {
        return format!("{}c", layout.nb_channels);
    }
    CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_file_is_an_open_error() {
        let wake = Arc::new(Condvar::new());
        let err = Input::open("/nonexistent/clip.mov", wake).unwrap_err();
        match err {
            Error::Open { url, .. } => assert_eq!(url, "/nonexistent/clip.mov"),
            other => panic!("expected open error, got {other}"),
        }
    }

    #[test]
    fn interrupt_callback_reflects_abort_flag() {
        let abort = Arc::new(AtomicBool::new(false));
        let opaque = Arc::as_ptr(&abort) as *mut c_void;
        assert_eq!(interrupt_cb(opaque), 0);
        abort.store(true, Ordering::Relaxed);
        assert_eq!(interrupt_cb(opaque), 1);
    }
}
