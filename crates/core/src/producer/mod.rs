//! The media producer: demux, decode, filter and pace frames
//!
//! A [`MediaProducer`] owns one demuxer thread, one decoder thread per
//! usable stream and one orchestrator thread. The orchestrator drains both
//! filter graphs in lockstep, enforces the playback range and loop points,
//! and fills a bounded output buffer the consumer pops at the channel's
//! cadence with [`MediaProducer::next_frame`].
//!
//! ```text
//! input ──packets──► decoders ──frames──► filters ──► output buffer ──► consumer
//! ```
//!
//! All stages use bounded queues with condition-variable backpressure; a
//! consumer that stops pulling stalls the whole pipeline without unbounded
//! memory growth.

mod decoder;
mod filter;
mod frame;
mod input;
mod util;

pub use frame::{DrawFrame, OutputFrame, Plane, VideoImage};
pub use input::{MediaKind, StreamDetails, StreamInfo};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use ffmpeg_next::ffi;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::{ChannelFormat, Rational};

use decoder::Decoder;
use filter::{Filter, Pull, SourceHandle};
use input::Input;
use util::{rescale_q, to_av_q, TIME_BASE_Q};

/// Backstop interval while a filter starves. Decoder and demuxer output
/// wakes the orchestrator directly; the timer only covers a wakeup that
/// lands between the starvation check and the wait.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Construction options for a media producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerOptions {
    /// Path or URL of the media source
    pub url: String,

    /// Video filter spec; empty means passthrough
    #[serde(default)]
    pub vfilter: String,

    /// Audio filter spec; empty means passthrough
    #[serde(default)]
    pub afilter: String,

    /// In-point in frames of the target format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,

    /// Playback length in frames of the target format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,

    /// Seamlessly restart at the in-point when the range ends
    #[serde(default)]
    pub looping: bool,
}

impl ProducerOptions {
    /// Options for playing `url` start to end, once, unfiltered
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            vfilter: String::new(),
            afilter: String::new(),
            start: None,
            duration: None,
            looping: false,
        }
    }

    /// Set the video filter spec
    pub fn with_vfilter(mut self, spec: impl Into<String>) -> Self {
        self.vfilter = spec.into();
        self
    }

    /// Set the audio filter spec
    pub fn with_afilter(mut self, spec: impl Into<String>) -> Self {
        self.afilter = spec.into();
        self
    }

    /// Set the in-point in target-format frames
    pub fn with_start(mut self, frames: i64) -> Self {
        self.start = Some(frames);
        self
    }

    /// Set the playback length in target-format frames
    pub fn with_duration(mut self, frames: i64) -> Self {
        self.duration = Some(frames);
        self
    }

    /// Enable or disable looping
    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }
}

/// State owned by the orchestrator, shared with the control surface
struct State {
    decoders: BTreeMap<usize, Decoder>,
    video: Filter,
    audio: Filter,
    /// Buffer sources fed from each stream's decoder, keyed by stream index
    /// (rebuilt together with the filters; handles borrow from them)
    sources: BTreeMap<usize, Vec<SourceHandle>>,
    /// Playback in-point in AV_TIME_BASE units
    start: Option<i64>,
    /// Playback length in AV_TIME_BASE units
    duration: Option<i64>,
    looping: bool,
    /// Last produced pts, AV_TIME_BASE units relative to clip start
    position: Option<i64>,
    vfilter: String,
    afilter: String,
}

/// The frame most recently handed to the consumer
struct LastFrame {
    frame: Option<OutputFrame>,
    /// Time just past the handed frame, AV_TIME_BASE units
    time: i64,
    /// Invalidated by seek/range changes; `prev_frame` re-primes
    flush: bool,
}

struct Core {
    format: ChannelFormat,
    format_tb: Rational,
    // Dropped after `state` so decoders join before the demuxer does.
    state: Mutex<State>,
    /// Woken by control changes and by decoder/demuxer output landing, so a
    /// starved orchestrator resumes without waiting out the poll interval
    cond: Arc<Condvar>,
    input: Input,
    buffer: Mutex<VecDeque<OutputFrame>>,
    buffer_cond: Condvar,
    buffer_capacity: usize,
    last: Mutex<LastFrame>,
    abort: AtomicBool,
}

/// Pull-based frame source for one media file or stream
pub struct MediaProducer {
    core: Arc<Core>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MediaProducer {
    /// Open the source, start all pipeline threads and cue the first frame
    pub fn new(format: ChannelFormat, options: ProducerOptions) -> Result<Self> {
        let wake = Arc::new(Condvar::new());
        let input = Input::open(&options.url, Arc::clone(&wake))?;

        let mut decoders = BTreeMap::new();
        for info in input.streams() {
            match Decoder::open(info, Arc::clone(&wake)) {
                Ok(decoder) => {
                    decoders.insert(info.index, decoder);
                }
                Err(e) => {
                    tracing::warn!(stream = info.index, error = %e, "stream excluded");
                }
            }
        }
        if decoders.is_empty() {
            return Err(Error::NoUsableStreams { url: options.url });
        }

        let format_tb = format.frame_time_base();
        let frames_to_global = |frames| rescale_q(frames, to_av_q(format_tb), TIME_BASE_Q);

        let buffer_capacity = format.buffer_capacity();
        let core = Arc::new(Core {
            format,
            format_tb,
            state: Mutex::new(State {
                decoders,
                video: Filter::unusable(),
                audio: Filter::unusable(),
                sources: BTreeMap::new(),
                start: options.start.map(frames_to_global),
                duration: options.duration.map(frames_to_global),
                looping: options.looping,
                position: None,
                vfilter: options.vfilter,
                afilter: options.afilter,
            }),
            cond: wake,
            input,
            buffer: Mutex::new(VecDeque::new()),
            buffer_cond: Condvar::new(),
            buffer_capacity,
            last: Mutex::new(LastFrame {
                frame: None,
                time: 0,
                flush: true,
            }),
            abort: AtomicBool::new(false),
        });

        {
            let mut state = core.state.lock().unwrap();
            let ts = match state.start {
                Some(start) => {
                    let ts = start + core.input.start_time();
                    core.input.seek(ts, true)?;
                    state.position = Some(start);
                    ts
                }
                None => 0,
            };
            core.build_filters(&mut state, ts)?;
        }

        let worker = Arc::clone(&core);
        let thread = thread::Builder::new()
            .name("media-producer".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            core,
            thread: Some(thread),
        })
    }

    /// Pop one output frame at the channel cadence.
    ///
    /// Interlaced formats pair two buffered frames into one field composite.
    /// Underflow while the input is still running returns [`DrawFrame::Late`]
    /// and tags a diagnostic; at a pause (range end) the last frame repeats.
    pub fn next_frame(&self) -> DrawFrame {
        let result;
        {
            let mut buffer = self.core.buffer.lock().unwrap();
            let field_count = self.core.format.field_count as usize;

            if !self.core.input.paused() && buffer.len() < field_count {
                tracing::warn!(buffered = buffer.len(), "output buffer underflow");
                return DrawFrame::Late;
            }

            let mut last = self.core.last.lock().unwrap();
            if field_count == 2 && buffer.len() >= 2 {
                let first = buffer.pop_front().unwrap();
                let second = buffer.pop_front().unwrap();
                last.time = first.pts + first.duration + second.duration;
                last.frame = Some(second.clone());
                result = DrawFrame::Interlaced {
                    first,
                    second,
                    order: self.core.format.field_order,
                };
            } else if let Some(front) = buffer.pop_front() {
                last.time = front.pts + front.duration;
                last.frame = Some(front.clone());
                result = DrawFrame::Progressive(front);
            } else if let Some(frame) = &last.frame {
                result = DrawFrame::Still(frame.clone());
            } else {
                result = DrawFrame::Late;
            }
            last.flush = false;
        }
        self.core.buffer_cond.notify_all();
        result
    }

    /// A still of the most recent frame, without advancing playback
    pub fn prev_frame(&self) -> DrawFrame {
        let buffer = self.core.buffer.lock().unwrap();
        let mut last = self.core.last.lock().unwrap();

        if let Some(front) = buffer.front() {
            if last.flush || last.frame.is_none() {
                last.frame = Some(front.clone());
                last.time = front.pts + front.duration;
                last.flush = false;
            }
        }

        match &last.frame {
            Some(frame) => DrawFrame::Still(frame.clone()),
            None => DrawFrame::Late,
        }
    }

    /// Jump to `frame_index` (target-format frames); clears buffered output
    /// and rebuilds both filter graphs
    pub fn seek(&self, frame_index: i64) {
        let frame_index = frame_index.max(0);

        let mut state = self.core.state.lock().unwrap();
        self.core.buffer.lock().unwrap().clear();
        self.core.buffer_cond.notify_all();
        self.core.last.lock().unwrap().flush = true;

        let position = rescale_q(frame_index, to_av_q(self.core.format_tb), TIME_BASE_Q);
        let ts = position + self.core.input.start_time();

        if let Err(e) = self.core.input.seek(ts, true) {
            tracing::warn!(frame_index, error = %e, "seek failed");
        }
        for decoder in state.decoders.values() {
            decoder.flush();
        }
        self.core.reset_filters(&mut state, ts);
        state.position = Some(position);

        drop(state);
        self.core.cond.notify_all();
    }

    /// Time just past the last consumed frame, in target-format frames
    pub fn time(&self) -> i64 {
        let time = self.core.last.lock().unwrap().time;
        rescale_q(time, TIME_BASE_Q, to_av_q(self.core.format_tb))
    }

    /// The in-point in target-format frames, when set
    pub fn start(&self) -> Option<i64> {
        let state = self.core.state.lock().unwrap();
        state
            .start
            .map(|s| rescale_q(s, TIME_BASE_Q, to_av_q(self.core.format_tb)))
    }

    /// Move the in-point; picked up on the next orchestrator tick
    pub fn set_start(&self, frames: i64) {
        {
            let mut state = self.core.state.lock().unwrap();
            state.start = Some(rescale_q(
                frames.max(0),
                to_av_q(self.core.format_tb),
                TIME_BASE_Q,
            ));
            self.core.last.lock().unwrap().flush = true;
        }
        self.core.cond.notify_all();
    }

    /// Playback length in target-format frames: the explicit value when set,
    /// else what remains of the container past the in-point
    pub fn duration(&self) -> Option<i64> {
        let state = self.core.state.lock().unwrap();
        let start = state.start.unwrap_or(0);
        let duration = state
            .duration
            .or_else(|| self.core.input.duration().map(|d| d - start));
        duration
            .filter(|d| *d >= 0)
            .map(|d| rescale_q(d, TIME_BASE_Q, to_av_q(self.core.format_tb)))
    }

    /// Set the playback length; a paused producer resumes if the range grew
    pub fn set_duration(&self, frames: i64) {
        {
            let mut state = self.core.state.lock().unwrap();
            state.duration = Some(rescale_q(
                frames.max(0),
                to_av_q(self.core.format_tb),
                TIME_BASE_Q,
            ));
            self.core.input.set_paused(false);
            self.core.last.lock().unwrap().flush = true;
        }
        self.core.cond.notify_all();
    }

    /// Whether playback loops at the range end
    pub fn looping(&self) -> bool {
        self.core.state.lock().unwrap().looping
    }

    /// Enable or disable looping; picked up on the next orchestrator tick
    pub fn set_looping(&self, looping: bool) {
        self.core.state.lock().unwrap().looping = looping;
        self.core.cond.notify_all();
    }

    /// Negotiated output width, 0 while no video graph is live
    pub fn width(&self) -> u32 {
        self.core.state.lock().unwrap().video.width()
    }

    /// Negotiated output height, 0 while no video graph is live
    pub fn height(&self) -> u32 {
        self.core.state.lock().unwrap().video.height()
    }

    /// The URL or path this producer plays
    pub fn url(&self) -> &str {
        self.core.input.url()
    }
}

impl fmt::Display for MediaProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.core.last.lock().unwrap().time as f64 / f64::from(ffi::AV_TIME_BASE);
        let duration = {
            let state = self.core.state.lock().unwrap();
            let start = state.start.unwrap_or(0);
            state
                .duration
                .or_else(|| self.core.input.duration().map(|d| d - start))
                .unwrap_or(0) as f64
                / f64::from(ffi::AV_TIME_BASE)
        };
        write!(
            f,
            "media[{}|{:.4}/{:.4}]",
            self.core.input.url(),
            time,
            duration
        )
    }
}

impl Drop for MediaProducer {
    fn drop(&mut self) {
        self.core.abort.store(true, Ordering::Relaxed);
        self.core.cond.notify_all();
        self.core.buffer_cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Core {
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Orchestrator loop: one output frame per iteration
    fn run(&self) {
        let mut cadence = self.format.audio_cadence.clone();
        let field_count = self.format.field_count.max(1);

        loop {
            // One step rotated per tick so 1001-rate cadences distribute
            // their long frames evenly.
            cadence.rotate_right(1);

            {
                let buffer = self.buffer.lock().unwrap();
                let _room = self
                    .buffer_cond
                    .wait_while(buffer, |b| {
                        !self.aborted() && b.len() >= self.buffer_capacity
                    })
                    .unwrap();
            }
            if self.aborted() {
                return;
            }

            let mut state = self.state.lock().unwrap();
            if self.aborted() {
                return;
            }

            // Loop at demuxer eof: rewind without flushing so buffered
            // output plays out seamlessly across the join.
            if state.looping && self.input.eof() {
                let ts = state.start.unwrap_or(0) + self.input.start_time();
                if let Err(e) = self.input.seek(ts, false) {
                    tracing::warn!(error = %e, "loop seek failed");
                }
            }

            if !fill_filter(self, &mut state, MediaKind::Video, None) {
                let (guard, _) = self.cond.wait_timeout(state, POLL_INTERVAL).unwrap();
                drop(guard);
                continue;
            }
            let nb_samples = (cadence[0] / field_count) as i32;
            if !fill_filter(self, &mut state, MediaKind::Audio, Some(nb_samples)) {
                let (guard, _) = self.cond.wait_timeout(state, POLL_INTERVAL).unwrap();
                drop(guard);
                continue;
            }

            let drained = state.video.staged.is_none() && state.audio.staged.is_none();
            let past_end = matches!(
                (state.duration, state.position),
                (Some(duration), Some(position)) if position >= duration
            );

            if drained || past_end {
                if state.looping {
                    let start = state.start.unwrap_or(0);
                    let ts = start + self.input.start_time();
                    if past_end {
                        if let Err(e) = self.input.seek(ts, true) {
                            tracing::warn!(error = %e, "range loop seek failed");
                        }
                        for decoder in state.decoders.values() {
                            decoder.flush();
                        }
                    }
                    self.reset_filters(&mut state, ts);
                    state.position = Some(start);
                    self.realign_field_parity();
                } else {
                    if past_end || self.input.eof() {
                        self.input.set_paused(true);
                    }
                    if drained {
                        // End of segment without loop: rebuild so a later
                        // resume (seek, longer range) starts cleanly.
                        let ts = state.start.unwrap_or(0) + self.input.start_time();
                        self.reset_filters(&mut state, ts);
                    }
                    let (guard, _) = self.cond.wait_timeout(state, POLL_INTERVAL).unwrap();
                    drop(guard);
                }
                continue;
            }

            // A live video graph that drained while audio kept going: the
            // surplus audio is dropped to keep the streams aligned.
            if state.video.has_sink()
                && state.video.staged.is_none()
                && state.audio.staged.is_some()
            {
                state.audio.staged = None;
                continue;
            }

            let start_time = self.input.start_time();
            let video = state.video.staged.take();
            let audio = state.audio.staged.take();

            let mut pts = None;
            let mut duration = 0;

            if let Some(v) = &video {
                let tb = state.video.sink_time_base();
                let fr = state.video.sink_frame_rate();
                pts = Some(rescale_q(v.pts(), tb, TIME_BASE_Q) - start_time);
                duration = rescale_q(1, to_av_q(fr.invert()), TIME_BASE_Q);
            }
            if pts.is_none() {
                if let Some(a) = &audio {
                    let tb = state.audio.sink_time_base();
                    let rate = state.audio.sink_sample_rate().max(1);
                    pts = Some(rescale_q(a.pts(), tb, TIME_BASE_Q) - start_time);
                    duration = rescale_q(
                        a.samples() as i64,
                        ffi::AVRational { num: 1, den: rate },
                        TIME_BASE_Q,
                    );
                }
            }
            let Some(pts) = pts else {
                continue;
            };
            state.position = Some(pts);

            // The in-point moved ahead of the current position: jump there.
            if let Some(start) = state.start {
                if pts < start {
                    let ts = start + start_time;
                    if let Err(e) = self.input.seek(ts, true) {
                        tracing::warn!(error = %e, "in-point seek failed");
                    }
                    for decoder in state.decoders.values() {
                        decoder.flush();
                    }
                    self.reset_filters(&mut state, ts);
                    state.position = Some(start);
                    continue;
                }
            }

            let out = OutputFrame::new(video.map(Arc::new), audio.map(Arc::new), pts, duration);
            self.buffer.lock().unwrap().push_back(out);
        }
    }

    /// Rebuild both graphs at `ts`; on failure the affected channel goes
    /// dark (black/silence) instead of taking the pipeline down
    fn reset_filters(&self, state: &mut State, ts: i64) {
        if let Err(e) = self.build_filters(state, ts) {
            tracing::error!(error = %e, "filter rebuild failed");
            state.video = Filter::unusable();
            state.audio = Filter::unusable();
            state.sources.clear();
        }
    }

    fn build_filters(&self, state: &mut State, ts: i64) -> Result<()> {
        let available: BTreeSet<usize> = state.decoders.keys().copied().collect();

        state.video = Filter::new(
            &state.vfilter,
            self.input.streams(),
            &available,
            ts,
            MediaKind::Video,
            &self.format,
        )?;
        state.audio = Filter::new(
            &state.afilter,
            self.input.streams(),
            &available,
            ts,
            MediaKind::Audio,
            &self.format,
        )?;

        state.sources.clear();
        for (index, source) in state.video.sources() {
            state.sources.entry(*index).or_default().push(*source);
        }
        for (index, source) in state.audio.sources() {
            state.sources.entry(*index).or_default().push(*source);
        }

        // Decoders no graph pulls from would fill up and stall the demuxer.
        for (index, decoder) in &state.decoders {
            if !state.sources.contains_key(index) {
                decoder.flush();
            }
        }

        Ok(())
    }

    /// Interlaced buffers must hold field pairs; after a loop reset an odd
    /// count would swap dominance, so the oldest frame is dropped
    fn realign_field_parity(&self) {
        if self.format.field_count != 2 {
            return;
        }
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() % 2 == 1 {
            buffer.pop_front();
        }
    }
}

/// Ensure `kind`'s filter has a staged frame (or is known drained).
/// Returns false when the filter starved and scheduling made no progress.
fn fill_filter(core: &Core, state: &mut State, kind: MediaKind, nb_samples: Option<i32>) -> bool {
    if filter_ref(state, kind).staged.is_some() {
        return true;
    }

    loop {
        {
            let f = filter_mut(state, kind);
            if !f.usable() || f.eof {
                f.staged = None;
                return true;
            }
            match f.try_pull(nb_samples) {
                Ok(Pull::Frame(frame)) => {
                    f.staged = Some(frame);
                    return true;
                }
                Ok(Pull::Eof) => {
                    f.staged = None;
                    return true;
                }
                Ok(Pull::Again) => {}
                Err(e) => {
                    tracing::warn!(kind = ?kind, error = %e, "filter pull failed");
                    f.eof = true;
                    f.staged = None;
                    return true;
                }
            }
        }

        if !schedule_filters(core, state) {
            return false;
        }
    }
}

fn filter_ref(state: &State, kind: MediaKind) -> &Filter {
    match kind {
        MediaKind::Video => &state.video,
        MediaKind::Audio => &state.audio,
    }
}

fn filter_mut(state: &mut State, kind: MediaKind) -> &mut Filter {
    match kind {
        MediaKind::Video => &mut state.video,
        MediaKind::Audio => &mut state.audio,
    }
}

/// Route demuxed packets to their decoders. The null marker fans out to
/// every decoder so each one drains and reports its end position.
fn schedule_inputs(core: &Core, state: &State) -> bool {
    let mut progressed = false;
    let decoders = &state.decoders;
    let sources = &state.sources;

    core.input.drain(|entry| match entry {
        None => {
            for decoder in decoders.values() {
                let _ = decoder.try_push(None);
            }
            progressed = true;
            true
        }
        Some(packet) => {
            let index = packet.stream_index();
            if !sources.contains_key(&index) {
                // No graph pulls from this stream right now.
                entry.take();
                progressed = true;
                return true;
            }
            let Some(decoder) = decoders.get(&index) else {
                entry.take();
                progressed = true;
                return true;
            };
            let Some(packet) = entry.take() else {
                return true;
            };
            match decoder.try_push(Some(packet)) {
                Ok(()) => {
                    progressed = true;
                    true
                }
                Err(packet) => {
                    // Decoder full: put the packet back and stop draining.
                    *entry = Some(packet);
                    false
                }
            }
        }
    });

    progressed
}

/// Move data toward starving filter sources: packets into decoders, then
/// decoded frames into every source registered for that stream
fn schedule_filters(core: &Core, state: &mut State) -> bool {
    let mut progressed = schedule_inputs(core, state);

    let indices: Vec<usize> = state.sources.keys().copied().collect();
    for index in indices {
        let Some(decoder) = state.decoders.get(&index) else {
            continue;
        };
        let sources = state.sources.get(&index).cloned().unwrap_or_default();

        let mut requests = sources
            .iter()
            .map(SourceHandle::failed_requests)
            .max()
            .unwrap_or(0);
        if requests == 0 {
            continue;
        }

        let mut closed = false;
        decoder.drain(|frame| {
            // Stop at the marker: frames decoded past it belong to the next
            // segment and wait for the rebuilt graph.
            if closed || requests == 0 {
                return false;
            }
            for source in &sources {
                let result = if frame.is_marker() {
                    source.close(frame.pts())
                } else {
                    source.write(frame)
                };
                match result {
                    Ok(()) => progressed = true,
                    Err(e) => tracing::warn!(stream = index, error = %e, "source feed failed"),
                }
            }
            if frame.is_marker() {
                closed = true;
            }
            requests -= 1;
            true
        });

        if closed {
            state.sources.remove(&index);
        }
    }

    progressed || schedule_inputs(core, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_builder_round_trips() {
        let options = ProducerOptions::from_url("clip.mov")
            .with_vfilter("scale=720:576")
            .with_start(25)
            .with_duration(250)
            .with_looping(true);
        assert_eq!(options.url, "clip.mov");
        assert_eq!(options.vfilter, "scale=720:576");
        assert_eq!(options.afilter, "");
        assert_eq!(options.start, Some(25));
        assert_eq!(options.duration, Some(250));
        assert!(options.looping);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ProducerOptions =
            serde_json::from_str(r#"{"url": "clip.mov"}"#).unwrap();
        assert_eq!(options.url, "clip.mov");
        assert!(!options.looping);
        assert!(options.start.is_none());
    }

    #[test]
    fn opening_a_missing_file_fails() {
        let result = MediaProducer::new(
            ChannelFormat::hd1080p25(),
            ProducerOptions::from_url("/nonexistent/clip.mov"),
        );
        assert!(result.is_err());
    }
}
