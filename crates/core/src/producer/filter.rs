//! Filter graph assembly and frame pull
//!
//! One graph is built per media kind from the user's filter spec plus the
//! mandatory conforming tail (deinterlace + frame-rate pin for video,
//! resample pin for audio). Dangling input pads are bound to synthetic
//! buffer sources configured from the stream inventory; the sink is
//! constrained to the formats the downstream compositor accepts.
//!
//! Graphs are rebuilt on every seek, loop and end-of-segment reset.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{c_int, CString};
use std::ptr;

use ffmpeg_next::ffi;

use crate::error::{Error, Result};
use crate::format::{ChannelFormat, Rational};

use super::input::{MediaKind, StreamDetails, StreamInfo};
use super::util::{check, rescale_q, Frame, TIME_BASE_Q};

/// Resampler tolerance before samples are stretched/squeezed, in samples
const ARESAMPLE_ASYNC: u32 = 2000;

/// Sink pixel formats. 4:2:0 is excluded: vertically subsampled chroma
/// cannot be safely split into fields.
const SINK_PIX_FMTS: [ffi::AVPixelFormat; 11] = [
    ffi::AVPixelFormat::AV_PIX_FMT_GRAY8,
    ffi::AVPixelFormat::AV_PIX_FMT_RGB24,
    ffi::AVPixelFormat::AV_PIX_FMT_BGR24,
    ffi::AVPixelFormat::AV_PIX_FMT_BGRA,
    ffi::AVPixelFormat::AV_PIX_FMT_ARGB,
    ffi::AVPixelFormat::AV_PIX_FMT_RGBA,
    ffi::AVPixelFormat::AV_PIX_FMT_ABGR,
    ffi::AVPixelFormat::AV_PIX_FMT_YUV444P,
    ffi::AVPixelFormat::AV_PIX_FMT_YUV422P,
    ffi::AVPixelFormat::AV_PIX_FMT_YUVA444P,
    ffi::AVPixelFormat::AV_PIX_FMT_YUVA422P,
];

const SINK_SAMPLE_FMTS: [ffi::AVSampleFormat; 1] = [ffi::AVSampleFormat::AV_SAMPLE_FMT_S32];

/// Result of one sink pull
pub(crate) enum Pull {
    /// A conformant frame
    Frame(Frame),
    /// The sink needs more input scheduled into the sources
    Again,
    /// The graph is fully drained
    Eof,
}

struct Graph(*mut ffi::AVFilterGraph);

unsafe impl Send for Graph {}

impl Drop for Graph {
    fn drop(&mut self) {
        unsafe { ffi::avfilter_graph_free(&mut self.0) };
    }
}

/// A buffer source bound to one stream; borrows from the owning graph
#[derive(Clone, Copy)]
pub(crate) struct SourceHandle(*mut ffi::AVFilterContext);

unsafe impl Send for SourceHandle {}

impl SourceHandle {
    /// Outstanding pull requests the source could not satisfy
    pub fn failed_requests(&self) -> u32 {
        unsafe { ffi::av_buffersrc_get_nb_failed_requests(self.0) }
    }

    /// Feed one decoded frame (the source takes its own reference)
    pub fn write(&self, frame: &Frame) -> Result<()> {
        check("av_buffersrc_write_frame", unsafe {
            ffi::av_buffersrc_write_frame(self.0, frame.as_ptr())
        })?;
        Ok(())
    }

    /// Close the source permanently; `pts` marks where the stream ended
    pub fn close(&self, pts: i64) -> Result<()> {
        check("av_buffersrc_close", unsafe {
            ffi::av_buffersrc_close(self.0, pts, 0)
        })?;
        Ok(())
    }
}

/// One configured filter graph for a single media kind
pub(crate) struct Filter {
    graph: Option<Graph>,
    sink: *mut ffi::AVFilterContext,
    sources: BTreeMap<usize, SourceHandle>,
    /// The sink reported end-of-stream
    pub eof: bool,
    /// Frame pulled but not yet consumed by the orchestrator
    pub staged: Option<Frame>,
}

unsafe impl Send for Filter {}

impl Filter {
    /// A filter that produces nothing; stands in when construction cannot
    /// bind the spec to the available streams
    pub fn unusable() -> Self {
        Self {
            graph: None,
            sink: ptr::null_mut(),
            sources: BTreeMap::new(),
            eof: false,
            staged: None,
        }
    }

    /// Build and configure a graph.
    ///
    /// `available` restricts source binding to streams whose decoder opened;
    /// `start_time` (AV_TIME_BASE units) seeds the fps/resample tail so
    /// output timestamps start at the playback position.
    pub fn new(
        user_spec: &str,
        streams: &[StreamInfo],
        available: &BTreeSet<usize>,
        start_time: i64,
        kind: MediaKind,
        format: &ChannelFormat,
    ) -> Result<Self> {
        let mut spec = conforming_spec(user_spec, kind, format, start_time);

        let (video_inputs, audio_inputs) = count_spec_inputs(&spec)?;
        spec = prepend_merge(spec, streams, video_inputs, audio_inputs);

        tracing::debug!(kind = ?kind, spec = %spec, "building filter graph");

        unsafe { build_graph(&spec, streams, available, kind, format) }
    }

    pub fn usable(&self) -> bool {
        self.graph.is_some() && !self.sink.is_null() && !self.sources.is_empty()
    }

    /// A graph was built for this kind (even if it has since drained)
    pub fn has_sink(&self) -> bool {
        !self.sink.is_null()
    }

    pub fn sources(&self) -> &BTreeMap<usize, SourceHandle> {
        &self.sources
    }

    /// Pull one frame from the sink. With `nb_samples` the audio sink
    /// delivers exactly that many samples per frame.
    pub fn try_pull(&mut self, nb_samples: Option<i32>) -> Result<Pull> {
        let mut frame = Frame::alloc()?;
        let ret = unsafe {
            match nb_samples {
                Some(n) => ffi::av_buffersink_get_samples(self.sink, frame.as_mut_ptr(), n),
                None => ffi::av_buffersink_get_frame(self.sink, frame.as_mut_ptr()),
            }
        };

        if ret == ffi::AVERROR(ffi::EAGAIN) {
            return Ok(Pull::Again);
        }
        if ret == ffi::AVERROR_EOF {
            self.eof = true;
            return Ok(Pull::Eof);
        }
        check("av_buffersink_get_frame", ret)?;
        Ok(Pull::Frame(frame))
    }

    /// Output width negotiated by the sink, 0 when unusable
    pub fn width(&self) -> u32 {
        if self.sink.is_null() {
            return 0;
        }
        unsafe { ffi::av_buffersink_get_w(self.sink).max(0) as u32 }
    }

    /// Output height negotiated by the sink, 0 when unusable
    pub fn height(&self) -> u32 {
        if self.sink.is_null() {
            return 0;
        }
        unsafe { ffi::av_buffersink_get_h(self.sink).max(0) as u32 }
    }

    pub fn sink_time_base(&self) -> ffi::AVRational {
        unsafe { ffi::av_buffersink_get_time_base(self.sink) }
    }

    pub fn sink_frame_rate(&self) -> Rational {
        let fr = unsafe { ffi::av_buffersink_get_frame_rate(self.sink) };
        Rational::new(fr.num, fr.den)
    }

    pub fn sink_sample_rate(&self) -> i32 {
        unsafe { ffi::av_buffersink_get_sample_rate(self.sink) }
    }
}

/// User spec plus the mandatory conforming tail for the media kind
fn conforming_spec(
    user_spec: &str,
    kind: MediaKind,
    format: &ChannelFormat,
    start_time: i64,
) -> String {
    match kind {
        MediaKind::Video => {
            let base = if user_spec.is_empty() { "null" } else { user_spec };
            format!(
                "{base},bwdif=mode=send_field:parity=auto:deint=all,fps=fps={}/{}:start_time={:.6}",
                format.frame_rate.num * format.field_count as i32,
                format.frame_rate.den,
                start_time as f64 / f64::from(ffi::AV_TIME_BASE),
            )
        }
        MediaKind::Audio => {
            let base = if user_spec.is_empty() { "anull" } else { user_spec };
            let first_pts = rescale_q(
                start_time,
                TIME_BASE_Q,
                ffi::AVRational {
                    num: 1,
                    den: format.audio_sample_rate as i32,
                },
            );
            format!(
                "{base},aresample=sample_rate={}:async={ARESAMPLE_ASYNC}:first_pts={first_pts}",
                format.audio_sample_rate,
            )
        }
    }
}

/// Single-input specs over multi-stream containers get an implicit merge:
/// `amerge` mixes every audio stream, `alphamerge` keys two video streams.
fn prepend_merge(
    spec: String,
    streams: &[StreamInfo],
    video_inputs: usize,
    audio_inputs: usize,
) -> String {
    let count = |wanted: MediaKind| streams.iter().filter(|s| s.kind == wanted).count();

    if audio_inputs == 1 {
        let n = count(MediaKind::Audio);
        if n > 1 {
            return format!("amerge=inputs={n},{spec}");
        }
    } else if video_inputs == 1 && count(MediaKind::Video) > 1 {
        return format!("alphamerge,{spec}");
    }
    spec
}

struct InOutList(*mut ffi::AVFilterInOut);

impl Drop for InOutList {
    fn drop(&mut self) {
        unsafe { ffi::avfilter_inout_free(&mut self.0) };
    }
}

/// Parse the spec into a throwaway graph and count its unbound input pads
fn count_spec_inputs(spec: &str) -> Result<(usize, usize)> {
    let c_spec = spec_cstring(spec)?;

    unsafe {
        let graph = Graph(ffi::avfilter_graph_alloc());
        if graph.0.is_null() {
            return Err(Error::Alloc("avfilter_graph_alloc"));
        }

        let mut inputs = InOutList(ptr::null_mut());
        let mut outputs = InOutList(ptr::null_mut());
        check(
            "avfilter_graph_parse2",
            ffi::avfilter_graph_parse2(graph.0, c_spec.as_ptr(), &mut inputs.0, &mut outputs.0),
        )
        .map_err(|e| Error::FilterGraph(format!("cannot parse '{spec}': {e}")))?;

        let mut video = 0;
        let mut audio = 0;
        let mut cur = inputs.0;
        while !cur.is_null() {
            match pad_kind(cur) {
                Some(MediaKind::Video) => video += 1,
                Some(MediaKind::Audio) => audio += 1,
                None => {}
            }
            cur = (*cur).next;
        }

        Ok((video, audio))
    }
}

unsafe fn pad_kind(inout: *mut ffi::AVFilterInOut) -> Option<MediaKind> {
    let pads = (*(*inout).filter_ctx).input_pads;
    match ffi::avfilter_pad_get_type(pads, (*inout).pad_idx) {
        ffi::AVMediaType::AVMEDIA_TYPE_VIDEO => Some(MediaKind::Video),
        ffi::AVMediaType::AVMEDIA_TYPE_AUDIO => Some(MediaKind::Audio),
        _ => None,
    }
}

unsafe fn build_graph(
    spec: &str,
    streams: &[StreamInfo],
    available: &BTreeSet<usize>,
    kind: MediaKind,
    format: &ChannelFormat,
) -> Result<Filter> {
    let c_spec = spec_cstring(spec)?;

    let graph = Graph(ffi::avfilter_graph_alloc());
    if graph.0.is_null() {
        return Err(Error::Alloc("avfilter_graph_alloc"));
    }

    let mut inputs = InOutList(ptr::null_mut());
    let mut outputs = InOutList(ptr::null_mut());
    check(
        "avfilter_graph_parse2",
        ffi::avfilter_graph_parse2(graph.0, c_spec.as_ptr(), &mut inputs.0, &mut outputs.0),
    )
    .map_err(|e| Error::FilterGraph(format!("cannot parse '{spec}': {e}")))?;

    // Bind every dangling input pad to the first free stream of its kind.
    let mut sources: BTreeMap<usize, SourceHandle> = BTreeMap::new();
    let mut cur = inputs.0;
    while !cur.is_null() {
        let pad = pad_kind(cur).ok_or_else(|| {
            Error::FilterGraph("only video and audio filter inputs are supported".to_string())
        })?;

        let stream = streams.iter().find(|s| {
            s.kind == pad && available.contains(&s.index) && !sources.contains_key(&s.index)
        });
        let Some(stream) = stream else {
            tracing::warn!(
                kind = ?kind,
                spec,
                "filter spec needs more {:?} inputs than the input provides",
                pad
            );
            return Ok(Filter::unusable());
        };

        let source = create_source(graph.0, stream)?;
        check(
            "avfilter_link",
            ffi::avfilter_link(source, 0, (*cur).filter_ctx, (*cur).pad_idx as u32),
        )?;
        sources.insert(stream.index, SourceHandle(source));

        cur = (*cur).next;
    }

    let sink = create_sink(graph.0, kind, format)?;

    // Exactly one output pad of the requested kind.
    let out = outputs.0;
    if out.is_null() || !(*out).next.is_null() {
        return Err(Error::FilterGraph(format!(
            "filter spec '{spec}' must have exactly one output"
        )));
    }
    let out_pads = (*(*out).filter_ctx).output_pads;
    let out_type = ffi::avfilter_pad_get_type(out_pads, (*out).pad_idx);
    let matches = matches!(
        (kind, out_type),
        (MediaKind::Video, ffi::AVMediaType::AVMEDIA_TYPE_VIDEO)
            | (MediaKind::Audio, ffi::AVMediaType::AVMEDIA_TYPE_AUDIO)
    );
    if !matches {
        return Err(Error::FilterGraph(format!(
            "filter spec '{spec}' output media type mismatch"
        )));
    }
    check(
        "avfilter_link",
        ffi::avfilter_link((*out).filter_ctx, (*out).pad_idx as u32, sink, 0),
    )?;

    check(
        "avfilter_graph_config",
        ffi::avfilter_graph_config(graph.0, ptr::null_mut()),
    )?;

    Ok(Filter {
        graph: Some(graph),
        sink,
        sources,
        eof: false,
        staged: None,
    })
}

/// Create a buffer/abuffer source configured from the stream descriptor
unsafe fn create_source(
    graph: *mut ffi::AVFilterGraph,
    stream: &StreamInfo,
) -> Result<*mut ffi::AVFilterContext> {
    let (filter_name, args) = match &stream.details {
        StreamDetails::Video {
            width,
            height,
            pixel_format,
            frame_rate,
            sample_aspect,
        } => {
            let mut args = format!(
                "video_size={width}x{height}:pix_fmt={pixel_format}:time_base={}/{}",
                stream.time_base.num, stream.time_base.den,
            );
            if let Some(sar) = sample_aspect {
                args.push_str(&format!(":sar={}/{}", sar.num, sar.den));
            }
            if let Some(fr) = frame_rate {
                args.push_str(&format!(":frame_rate={}/{}", fr.num, fr.den));
            }
            (c"buffer", args)
        }
        StreamDetails::Audio {
            sample_rate,
            sample_format,
            channel_layout,
        } => {
            let mut args = format!(
                "time_base={}/{}:sample_rate={sample_rate}:sample_fmt={sample_format}",
                stream.time_base.num, stream.time_base.den,
            );
            if !channel_layout.is_empty() {
                args.push_str(&format!(":channel_layout={channel_layout}"));
            }
            (c"abuffer", args)
        }
    };

    let c_name = CString::new(format!("in_{}", stream.index))
        .map_err(|_| Error::FilterGraph("source name".to_string()))?;
    let c_args =
        CString::new(args).map_err(|_| Error::FilterGraph("source args".to_string()))?;

    let mut source = ptr::null_mut();
    check(
        "avfilter_graph_create_filter",
        ffi::avfilter_graph_create_filter(
            &mut source,
            ffi::avfilter_get_by_name(filter_name.as_ptr()),
            c_name.as_ptr(),
            c_args.as_ptr(),
            ptr::null_mut(),
            graph,
        ),
    )?;
    Ok(source)
}

/// Create the sink constrained to the formats the compositor accepts
unsafe fn create_sink(
    graph: *mut ffi::AVFilterGraph,
    kind: MediaKind,
    format: &ChannelFormat,
) -> Result<*mut ffi::AVFilterContext> {
    let filter_name = match kind {
        MediaKind::Video => c"buffersink",
        MediaKind::Audio => c"abuffersink",
    };

    let mut sink = ptr::null_mut();
    check(
        "avfilter_graph_create_filter",
        ffi::avfilter_graph_create_filter(
            &mut sink,
            ffi::avfilter_get_by_name(filter_name.as_ptr()),
            c"out".as_ptr(),
            ptr::null(),
            ptr::null_mut(),
            graph,
        ),
    )?;

    match kind {
        MediaKind::Video => {
            check(
                "av_opt_set_bin",
                ffi::av_opt_set_bin(
                    sink as *mut _,
                    c"pix_fmts".as_ptr(),
                    SINK_PIX_FMTS.as_ptr() as *const u8,
                    std::mem::size_of_val(&SINK_PIX_FMTS) as c_int,
                    ffi::AV_OPT_SEARCH_CHILDREN as c_int,
                ),
            )?;
        }
        MediaKind::Audio => {
            check(
                "av_opt_set_bin",
                ffi::av_opt_set_bin(
                    sink as *mut _,
                    c"sample_fmts".as_ptr(),
                    SINK_SAMPLE_FMTS.as_ptr() as *const u8,
                    std::mem::size_of_val(&SINK_SAMPLE_FMTS) as c_int,
                    ffi::AV_OPT_SEARCH_CHILDREN as c_int,
                ),
            )?;
            let rates: [c_int; 1] = [format.audio_sample_rate as c_int];
            check(
                "av_opt_set_bin",
                ffi::av_opt_set_bin(
                    sink as *mut _,
                    c"sample_rates".as_ptr(),
                    rates.as_ptr() as *const u8,
                    std::mem::size_of_val(&rates) as c_int,
                    ffi::AV_OPT_SEARCH_CHILDREN as c_int,
                ),
            )?;
        }
    }

    Ok(sink)
}

fn spec_cstring(spec: &str) -> Result<CString> {
    CString::new(spec).map_err(|_| Error::FilterGraph("spec contains interior nul".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pal() -> ChannelFormat {
        ChannelFormat::pal()
    }

    #[test]
    fn empty_video_spec_becomes_null_with_conforming_tail() {
        let spec = conforming_spec("", MediaKind::Video, &pal(), 0);
        assert!(spec.starts_with("null,bwdif=mode=send_field:parity=auto:deint=all,"));
        // PAL is 25 full frames, two fields each.
        assert!(spec.contains("fps=fps=50/1"), "{spec}");
        assert!(spec.contains("start_time=0.000000"), "{spec}");
    }

    #[test]
    fn empty_audio_spec_becomes_anull_with_resample_tail() {
        let spec = conforming_spec("", MediaKind::Audio, &pal(), 0);
        assert_eq!(
            spec,
            "anull,aresample=sample_rate=48000:async=2000:first_pts=0"
        );
    }

    #[test]
    fn audio_first_pts_is_in_the_target_sample_rate() {
        // Half a second into the clip: 24000 samples at 48 kHz.
        let spec = conforming_spec("", MediaKind::Audio, &pal(), 500_000);
        assert!(spec.ends_with("first_pts=24000"), "{spec}");
    }

    #[test]
    fn video_start_time_is_seconds() {
        let spec = conforming_spec("scale=720:576", MediaKind::Video, &pal(), 1_500_000);
        assert!(spec.starts_with("scale=720:576,bwdif="), "{spec}");
        assert!(spec.contains("start_time=1.500000"), "{spec}");
    }

    #[test]
    fn progressive_format_pins_fps_without_field_doubling() {
        let spec = conforming_spec("", MediaKind::Video, &ChannelFormat::hd1080p2997(), 0);
        assert!(spec.contains("fps=fps=30000/1001"), "{spec}");
    }
}
