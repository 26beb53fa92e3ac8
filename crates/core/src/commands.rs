//! String command surface for the producer
//!
//! The control layer drives a running producer with named actions and
//! string operands (`LOOP 1`, `SEEK in 25`, ...). Frame operands are
//! zero-based in the target frame rate and clamped into the playable range.

use crate::error::{Error, Result};
use crate::producer::MediaProducer;

/// A parsed producer command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `LOOP [0|1]`: set or report looping
    Loop(Option<bool>),
    /// `IN <frame>` / `START <frame>`: set or report the in-point
    In(Option<i64>),
    /// `OUT <frame>`: set the out-point; reports `in + length`
    Out(Option<i64>),
    /// `LENGTH <count>`: set or report the playback length
    Length(Option<i64>),
    /// `SEEK <target> [offset]`
    Seek(SeekTarget, i64),
}

/// Where a `SEEK` lands before its offset is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    /// An absolute frame index
    Frame(i64),
    /// The current playback position
    Relative,
    /// The in-point
    In,
    /// The out-point
    Out,
    /// The end of the clip
    End,
}

impl Command {
    /// Parse a command from its space-split parameters
    pub fn parse(params: &[&str]) -> Result<Self> {
        let cmd = params
            .first()
            .ok_or_else(|| Error::InvalidCommand("empty command".to_string()))?;
        let value = params.get(1).copied();

        match cmd.to_ascii_uppercase().as_str() {
            "LOOP" => Ok(Command::Loop(value.map(parse_bool).transpose()?)),
            "IN" | "START" => Ok(Command::In(value.map(parse_frames).transpose()?)),
            "OUT" => Ok(Command::Out(value.map(parse_frames).transpose()?)),
            "LENGTH" => Ok(Command::Length(value.map(parse_frames).transpose()?)),
            "SEEK" => {
                let value = value
                    .ok_or_else(|| Error::InvalidCommand("SEEK needs a target".to_string()))?;
                let target = match value.to_ascii_uppercase().as_str() {
                    "REL" => SeekTarget::Relative,
                    "IN" => SeekTarget::In,
                    "OUT" => SeekTarget::Out,
                    "END" => SeekTarget::End,
                    _ => SeekTarget::Frame(parse_frames(value)?),
                };
                let offset = params.get(2).copied().map(parse_frames).transpose()?;
                Ok(Command::Seek(target, offset.unwrap_or(0)))
            }
            other => Err(Error::InvalidCommand(other.to_string())),
        }
    }
}

/// Apply a command to a producer; returns the textual reply for the control
/// layer
pub fn execute(producer: &MediaProducer, command: &Command) -> String {
    match command {
        Command::Loop(value) => {
            if let Some(looping) = value {
                producer.set_looping(*looping);
            }
            (producer.looping() as i32).to_string()
        }
        Command::In(value) => {
            if let Some(frames) = value {
                producer.set_start(*frames);
            }
            producer.start().unwrap_or(0).to_string()
        }
        Command::Out(value) => {
            let start = producer.start().unwrap_or(0);
            if let Some(out) = value {
                producer.set_duration((out - start).max(0));
            }
            start
                .saturating_add(producer.duration().unwrap_or(i64::MAX))
                .to_string()
        }
        Command::Length(value) => {
            if let Some(frames) = value {
                producer.set_duration(*frames);
            }
            producer.duration().unwrap_or(i64::MAX).to_string()
        }
        Command::Seek(target, offset) => {
            let base = match target {
                SeekTarget::Frame(frames) => *frames,
                SeekTarget::Relative => producer.time(),
                SeekTarget::In => producer.start().unwrap_or(0),
                SeekTarget::Out => producer
                    .start()
                    .unwrap_or(0)
                    .saturating_add(producer.duration().unwrap_or(i64::MAX)),
                SeekTarget::End => producer.duration().unwrap_or(i64::MAX),
            };
            let frames = clamp_seek(base.saturating_add(*offset), producer.duration());
            producer.seek(frames);
            frames.to_string()
        }
    }
}

/// Number of frames the producer reports to the playlist layer: unbounded
/// while looping, else the current position
pub fn nb_frames(producer: &MediaProducer) -> i64 {
    if producer.looping() {
        i64::from(u32::MAX)
    } else {
        producer.time()
    }
}

/// Clamp a seek destination into `[0, nb_frames)`; seeking past the end
/// lands on the last frame
fn clamp_seek(frames: i64, duration: Option<i64>) -> i64 {
    let frames = frames.max(0);
    match duration {
        Some(duration) if duration > 0 => frames.min(duration - 1),
        _ => frames,
    }
}

/// Rewrite legacy deinterlace aliases into their filter equivalents
pub fn expand_filter_aliases(spec: &str) -> String {
    let spec = replace_ci(spec, "deinterlace_bob", "yadif=1:-1");
    let spec = replace_ci(&spec, "deinterlace_lq", "separatefields");
    replace_ci(&spec, "deinterlace", "yadif=0:-1")
}

fn replace_ci(haystack: &str, needle: &str, replacement: &str) -> String {
    let lower = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let mut result = String::with_capacity(haystack.len());
    let mut pos = 0;
    while let Some(found) = lower[pos..].find(&needle) {
        let at = pos + found;
        result.push_str(&haystack[pos..at]);
        result.push_str(replacement);
        pos = at + needle.len();
    }
    result.push_str(&haystack[pos..]);
    result
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "TRUE" => Ok(true),
        "0" | "false" | "FALSE" => Ok(false),
        other => Err(Error::InvalidCommand(format!("not a boolean: {other}"))),
    }
}

fn parse_frames(value: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|_| Error::InvalidCommand(format!("not a frame count: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loop_with_and_without_operand() {
        assert_eq!(Command::parse(&["LOOP"]).unwrap(), Command::Loop(None));
        assert_eq!(
            Command::parse(&["loop", "1"]).unwrap(),
            Command::Loop(Some(true))
        );
        assert_eq!(
            Command::parse(&["LOOP", "0"]).unwrap(),
            Command::Loop(Some(false))
        );
    }

    #[test]
    fn parses_in_and_start_as_aliases() {
        assert_eq!(
            Command::parse(&["IN", "25"]).unwrap(),
            Command::In(Some(25))
        );
        assert_eq!(
            Command::parse(&["START", "25"]).unwrap(),
            Command::In(Some(25))
        );
    }

    #[test]
    fn parses_seek_targets_and_offset() {
        assert_eq!(
            Command::parse(&["SEEK", "100"]).unwrap(),
            Command::Seek(SeekTarget::Frame(100), 0)
        );
        assert_eq!(
            Command::parse(&["SEEK", "rel", "-5"]).unwrap(),
            Command::Seek(SeekTarget::Relative, -5)
        );
        assert_eq!(
            Command::parse(&["seek", "in"]).unwrap(),
            Command::Seek(SeekTarget::In, 0)
        );
        assert_eq!(
            Command::parse(&["SEEK", "end", "-1"]).unwrap(),
            Command::Seek(SeekTarget::End, -1)
        );
    }

    #[test]
    fn rejects_unknown_commands_and_bad_operands() {
        assert!(Command::parse(&[]).is_err());
        assert!(Command::parse(&["REWIND"]).is_err());
        assert!(Command::parse(&["SEEK"]).is_err());
        assert!(Command::parse(&["LOOP", "maybe"]).is_err());
        assert!(Command::parse(&["IN", "abc"]).is_err());
    }

    #[test]
    fn seek_is_clamped_into_the_playable_range() {
        assert_eq!(clamp_seek(-10, Some(250)), 0);
        assert_eq!(clamp_seek(100, Some(250)), 100);
        assert_eq!(clamp_seek(250, Some(250)), 249);
        assert_eq!(clamp_seek(1000, Some(250)), 249);
        // Unknown duration: only the lower bound applies.
        assert_eq!(clamp_seek(1000, None), 1000);
    }

    #[test]
    fn deinterlace_aliases_expand_case_insensitively() {
        assert_eq!(
            expand_filter_aliases("DEINTERLACE_BOB,scale=720:576"),
            "yadif=1:-1,scale=720:576"
        );
        assert_eq!(expand_filter_aliases("deinterlace_lq"), "separatefields");
        assert_eq!(expand_filter_aliases("Deinterlace"), "yadif=0:-1");
        assert_eq!(expand_filter_aliases("scale=1920:1080"), "scale=1920:1080");
    }
}
