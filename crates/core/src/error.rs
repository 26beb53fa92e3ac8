//! Error types for the playout media producer

use thiserror::Error;

/// Result type alias for producer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while opening and running a media source
#[derive(Debug, Error)]
pub enum Error {
    /// An FFmpeg call returned a negative error code
    #[error("{call} failed: {message} ({code})")]
    Ffmpeg {
        /// Name of the failing libav* call
        call: &'static str,
        /// The raw AVERROR code
        code: i32,
        /// Text from `av_strerror`
        message: String,
    },

    /// An FFmpeg allocation returned null
    #[error("allocation failed in {0}")]
    Alloc(&'static str),

    /// The container could not be opened
    #[error("failed to open media source {url}: {message}")]
    Open {
        /// URL or path handed to the demuxer
        url: String,
        /// Underlying failure text
        message: String,
    },

    /// The container exposes no stream any decoder could be opened for
    #[error("no usable video or audio stream in {url}")]
    NoUsableStreams {
        /// URL or path handed to the demuxer
        url: String,
    },

    /// No decoder is registered for a stream's codec
    #[error("no decoder found for stream {stream}")]
    DecoderNotFound {
        /// Index of the stream that could not be decoded
        stream: usize,
    },

    /// A filter graph could not be assembled from the given spec
    #[error("filter graph error: {0}")]
    FilterGraph(String),

    /// A producer command was malformed
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_error_displays_call_and_code() {
        let err = Error::Ffmpeg {
            call: "avformat_open_input",
            code: -2,
            message: "No such file or directory".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("avformat_open_input"));
        assert!(text.contains("-2"));
    }

    #[test]
    fn open_error_mentions_url() {
        let err = Error::Open {
            url: "rtmp://example/live".to_string(),
            message: "timed out".to_string(),
        };
        assert!(err.to_string().contains("rtmp://example/live"));
    }
}
