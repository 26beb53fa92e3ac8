//! Per-stream decoder with bounded input/output queues
//!
//! Each decoder owns one codec context and a worker thread that turns
//! packets into frames. The input queue absorbs several seconds of demuxed
//! packets; the output queue is kept tiny to bound decoded-frame memory.
//! A null packet drains the codec, which then emits an empty marker frame
//! whose pts records where the stream ended.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use ffmpeg_next::ffi;

use crate::error::{Error, Result};
use crate::format::Rational;

use super::input::{MediaKind, StreamDetails, StreamInfo};
use super::util::{check, err_str, rescale_q, to_av_q, Frame, Packet};

/// Soft cap on queued packets; a null packet is always accepted
const INPUT_CAPACITY: usize = 256;

/// Hard cap on decoded frames held ahead of the filters
const OUTPUT_CAPACITY: usize = 2;

struct CodecContext(*mut ffi::AVCodecContext);

// Only touched under the codec mutex.
unsafe impl Send for CodecContext {}

impl Drop for CodecContext {
    fn drop(&mut self) {
        unsafe { ffi::avcodec_free_context(&mut self.0) };
    }
}

struct Queues {
    input: VecDeque<Option<Packet>>,
    output: VecDeque<Frame>,
    /// Expected pts of the next decoded frame, in the stream time base
    next_pts: i64,
    /// The codec may still hold frames the full output queue could not take
    receive_pending: bool,
}

struct Shared {
    /// Codec state; disjoint from the queue mutex so `flush` can interrupt
    /// decoding without contending with queue producers
    codec: Mutex<CodecContext>,
    queues: Mutex<Queues>,
    cond: Condvar,
    /// Orchestrator wakeup, signalled whenever a frame lands in the output
    wake: Arc<Condvar>,
    abort: AtomicBool,
}

/// Long-lived decoder for one elementary stream
pub(crate) struct Decoder {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Decoder {
    pub fn open(info: &StreamInfo, wake: Arc<Condvar>) -> Result<Self> {
        let codec = unsafe { ffi::avcodec_find_decoder(info.codecpar.codec_id()) };
        if codec.is_null() {
            return Err(Error::DecoderNotFound {
                stream: info.index,
            });
        }

        let ctx = CodecContext(unsafe { ffi::avcodec_alloc_context3(codec) });
        if ctx.0.is_null() {
            return Err(Error::Alloc("avcodec_alloc_context3"));
        }

        unsafe {
            check(
                "avcodec_parameters_to_context",
                ffi::avcodec_parameters_to_context(ctx.0, info.codecpar.as_ptr()),
            )?;

            (*ctx.0).pkt_timebase = to_av_q(info.time_base);
            ffi::av_opt_set_int(ctx.0 as *mut c_void, c"threads".as_ptr(), 4, 0);

            match &info.details {
                StreamDetails::Video {
                    frame_rate,
                    sample_aspect,
                    ..
                } => {
                    if let Some(fr) = frame_rate {
                        (*ctx.0).framerate = to_av_q(*fr);
                    }
                    if let Some(sar) = sample_aspect {
                        (*ctx.0).sample_aspect_ratio = to_av_q(*sar);
                    }
                }
                StreamDetails::Audio { .. } => {
                    let layout = &mut (*ctx.0).ch_layout;
                    if layout.order == ffi::AVChannelOrder::AV_CHANNEL_ORDER_UNSPEC
                        && layout.nb_channels > 0
                    {
                        ffi::av_channel_layout_default(layout, layout.nb_channels);
                    }
                }
            }

            check("avcodec_open2", ffi::avcodec_open2(ctx.0, codec, ptr::null_mut()))?;
        }

        let shared = Arc::new(Shared {
            codec: Mutex::new(ctx),
            queues: Mutex::new(Queues {
                input: VecDeque::new(),
                output: VecDeque::new(),
                next_pts: ffi::AV_NOPTS_VALUE,
                receive_pending: false,
            }),
            cond: Condvar::new(),
            wake,
            abort: AtomicBool::new(false),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            stream: info.index,
            kind: info.kind,
            time_base: info.time_base,
            frame_rate: match &info.details {
                StreamDetails::Video { frame_rate, .. } => *frame_rate,
                StreamDetails::Audio { .. } => None,
            },
        };
        let thread = thread::Builder::new()
            .name(format!("media-decode-{}", info.index))
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Queue a packet (or the null end-of-stream marker). A packet is handed
    /// back when the queue is at capacity; the null marker is always taken.
    pub fn try_push(&self, entry: Option<Packet>) -> std::result::Result<(), Packet> {
        {
            let mut queues = self.shared.queues.lock().unwrap();
            match entry {
                Some(packet) if queues.input.len() >= INPUT_CAPACITY => return Err(packet),
                entry => queues.input.push_back(entry),
            }
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Hand decoded frames to `sink` in decode order, popping each frame the
    /// sink accepts
    pub fn drain(&self, mut sink: impl FnMut(&Frame) -> bool) {
        {
            let mut queues = self.shared.queues.lock().unwrap();
            while let Some(front) = queues.output.front() {
                if !sink(front) {
                    break;
                }
                queues.output.pop_front();
            }
        }
        self.shared.cond.notify_all();
    }

    /// Reset codec state and discard everything queued
    pub fn flush(&self) {
        let codec = self.shared.codec.lock().unwrap();
        unsafe { ffi::avcodec_flush_buffers(codec.0) };
        drop(codec);

        {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.input.clear();
            queues.output.clear();
            queues.next_pts = ffi::AV_NOPTS_VALUE;
            queues.receive_pending = false;
        }
        self.shared.cond.notify_all();
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.shared.abort.store(true, Ordering::Relaxed);
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    stream: usize,
    kind: MediaKind,
    time_base: Rational,
    frame_rate: Option<Rational>,
}

impl Worker {
    fn run(self) {
        loop {
            {
                let queues = self.shared.queues.lock().unwrap();
                let _guard = self
                    .shared
                    .cond
                    .wait_while(queues, |q| {
                        !self.shared.abort.load(Ordering::Relaxed)
                            && !((!q.input.is_empty() || q.receive_pending)
                                && q.output.len() < OUTPUT_CAPACITY)
                    })
                    .unwrap();
            }

            if self.shared.abort.load(Ordering::Relaxed) {
                return;
            }

            let codec = self.shared.codec.lock().unwrap();

            if !self.submit_packet(&codec) {
                return;
            }
            if !self.receive_frames(&codec) {
                return;
            }
        }
    }

    /// Feed one queued packet into the codec. Returns false on a fatal
    /// decode error.
    fn submit_packet(&self, codec: &CodecContext) -> bool {
        let entry = {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.input.pop_front()
        };

        let Some(mut entry) = entry else {
            return true;
        };

        let pkt_ptr = entry
            .as_mut()
            .map(|p| p.as_mut_ptr() as *const ffi::AVPacket)
            .unwrap_or(ptr::null());

        let ret = unsafe { ffi::avcodec_send_packet(codec.0, pkt_ptr) };

        if ret == ffi::AVERROR(ffi::EAGAIN) {
            // Codec wants frames received first; requeue and retry after.
            let mut queues = self.shared.queues.lock().unwrap();
            queues.input.push_front(entry);
            queues.receive_pending = true;
        } else if ret == ffi::AVERROR_EOF {
            // Already draining; the packet is surplus.
        } else if ret < 0 {
            tracing::error!(
                stream = self.stream,
                error = %err_str(ret),
                "decode failed, stopping decoder"
            );
            return false;
        }

        self.shared.cond.notify_all();
        true
    }

    /// Pull decoded frames until the codec wants input or the output queue
    /// is full. Returns false on a fatal decode error.
    fn receive_frames(&self, codec: &CodecContext) -> bool {
        loop {
            {
                let mut queues = self.shared.queues.lock().unwrap();
                if queues.output.len() >= OUTPUT_CAPACITY {
                    queues.receive_pending = true;
                    return true;
                }
            }

            let mut frame = match Frame::alloc() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(stream = self.stream, error = %e, "frame allocation failed");
                    return false;
                }
            };

            let ret = unsafe { ffi::avcodec_receive_frame(codec.0, frame.as_mut_ptr()) };

            if ret == ffi::AVERROR(ffi::EAGAIN) {
                let mut queues = self.shared.queues.lock().unwrap();
                queues.receive_pending = false;
                drop(queues);
                self.shared.cond.notify_all();
                return true;
            }

            if ret == ffi::AVERROR_EOF {
                unsafe { ffi::avcodec_flush_buffers(codec.0) };
                let mut queues = self.shared.queues.lock().unwrap();
                frame.set_pts(queues.next_pts);
                queues.output.push_back(frame);
                drop(queues);
                self.shared.cond.notify_all();
                self.shared.wake.notify_all();
                continue;
            }

            if ret < 0 {
                tracing::error!(
                    stream = self.stream,
                    error = %err_str(ret),
                    "receive failed, stopping decoder"
                );
                return false;
            }

            let pts = unsafe { (*frame.as_ptr()).best_effort_timestamp };
            let duration = self.frame_duration(&frame);
            frame.set_pts(pts);

            let mut queues = self.shared.queues.lock().unwrap();
            if pts != ffi::AV_NOPTS_VALUE {
                queues.next_pts = pts + duration;
            }
            queues.output.push_back(frame);
            drop(queues);
            self.shared.cond.notify_all();
            self.shared.wake.notify_all();
        }
    }

    /// Frame duration in the stream time base: the container's when it says,
    /// otherwise one frame interval (video) or the sample count (audio)
    fn frame_duration(&self, frame: &Frame) -> i64 {
        let reported = unsafe { (*frame.as_ptr()).duration };
        if reported > 0 {
            return reported;
        }
        let sample_rate = unsafe { (*frame.as_ptr()).sample_rate };
        fallback_duration(
            self.kind,
            self.frame_rate,
            self.time_base,
            frame.samples(),
            sample_rate,
        )
    }
}

/// Duration of a frame whose container reported none
fn fallback_duration(
    kind: MediaKind,
    frame_rate: Option<Rational>,
    time_base: Rational,
    nb_samples: usize,
    sample_rate: i32,
) -> i64 {
    match kind {
        MediaKind::Video => match frame_rate {
            Some(fr) => rescale_q(1, to_av_q(fr.invert()), to_av_q(time_base)),
            None => 0,
        },
        MediaKind::Audio => {
            if sample_rate > 0 {
                rescale_q(
                    nb_samples as i64,
                    ffi::AVRational {
                        num: 1,
                        den: sample_rate,
                    },
                    to_av_q(time_base),
                )
            } else {
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_fallback_is_one_frame_interval() {
        // 25 fps in a 1/12800 time base: one frame spans 512 ticks.
        let d = fallback_duration(
            MediaKind::Video,
            Some(Rational::new(25, 1)),
            Rational::new(1, 12800),
            0,
            0,
        );
        assert_eq!(d, 512);
    }

    #[test]
    fn audio_fallback_counts_samples() {
        let d = fallback_duration(
            MediaKind::Audio,
            None,
            Rational::new(1, 48000),
            1024,
            48000,
        );
        assert_eq!(d, 1024);
    }

    #[test]
    fn unknown_rates_yield_zero_duration() {
        assert_eq!(
            fallback_duration(MediaKind::Video, None, Rational::new(1, 90000), 0, 0),
            0
        );
        assert_eq!(
            fallback_duration(MediaKind::Audio, None, Rational::new(1, 90000), 1024, 0),
            0
        );
    }
}
