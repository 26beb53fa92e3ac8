//! Contract tests that need no media files: cadence arithmetic, format
//! presets, command parsing and option handling.

use playout_core::commands::{Command, SeekTarget};
use playout_core::{audio_cadence, ChannelFormat, MediaProducer, ProducerOptions, Rational};

/// The orchestrator rotates the cadence one step per tick and consumes
/// `cadence[0]` samples. Any window of one full cycle must sum to exactly
/// one second of audio, wherever the window starts.
#[test]
fn cadence_windows_sum_to_one_second_from_any_phase() {
    let mut cadence = audio_cadence(48000, Rational::new(30000, 1001));
    let cycle = cadence.len();
    assert_eq!(cycle, 5);

    let mut consumed = Vec::new();
    for _ in 0..cycle * 4 {
        cadence.rotate_right(1);
        consumed.push(cadence[0]);
    }

    for window in consumed.windows(cycle) {
        assert_eq!(window.iter().sum::<u32>(), 8008, "window {window:?}");
    }
}

/// Per-tick audio requests for interlaced formats are halved. Odd cadence
/// entries floor at the split; the pinned resampler absorbs the bounded
/// remainder, so the shortfall per cycle stays under one sample per tick.
#[test]
fn interlaced_cadence_splits_fields_with_bounded_remainder() {
    let format = ChannelFormat::ntsc();
    assert_eq!(format.field_count, 2);

    let mut cadence = format.audio_cadence.clone();
    let cycle = cadence.len() as u32;

    let mut total = 0u32;
    for _ in 0..cycle {
        cadence.rotate_right(1);
        // Two field ticks per full frame, each requesting half.
        total += (cadence[0] / format.field_count) * format.field_count;
    }
    assert!(total <= 8008);
    assert!(8008 - total < cycle * format.field_count, "shortfall {}", 8008 - total);

    // Even cadences split exactly.
    let pal = ChannelFormat::pal();
    assert_eq!(pal.audio_cadence[0] / pal.field_count * pal.field_count, 1920);
}

#[test]
fn integer_rate_formats_have_flat_cadence() {
    for format in [
        ChannelFormat::pal(),
        ChannelFormat::hd720p50(),
        ChannelFormat::hd1080i50(),
        ChannelFormat::hd1080p25(),
        ChannelFormat::uhd2160p50(),
    ] {
        assert_eq!(
            format.audio_cadence.len(),
            1,
            "{} should not need a cadence cycle",
            format.name
        );
        let spf = format.audio_cadence[0];
        assert_eq!(
            spf * format.frame_rate.num as u32,
            format.audio_sample_rate * format.frame_rate.den as u32,
            "{}",
            format.name
        );
    }
}

#[test]
fn buffer_capacity_is_roughly_one_second_of_output() {
    // 25 full frames × 2 fields.
    assert_eq!(ChannelFormat::pal().buffer_capacity(), 50);
    // 29.97 rounds to 30.
    assert_eq!(ChannelFormat::hd1080p2997().buffer_capacity(), 30);
    assert_eq!(ChannelFormat::uhd2160p50().buffer_capacity(), 50);
}

#[test]
fn producer_options_serialize_round_trip() {
    let options = ProducerOptions::from_url("rtmp://example/live")
        .with_vfilter("scale=1920:1080")
        .with_afilter("volume=0.5")
        .with_start(10)
        .with_duration(500)
        .with_looping(true);

    let json = serde_json::to_string(&options).unwrap();
    let back: ProducerOptions = serde_json::from_str(&json).unwrap();

    assert_eq!(back.url, options.url);
    assert_eq!(back.vfilter, options.vfilter);
    assert_eq!(back.afilter, options.afilter);
    assert_eq!(back.start, options.start);
    assert_eq!(back.duration, options.duration);
    assert_eq!(back.looping, options.looping);
}

#[test]
fn command_surface_covers_the_transport_verbs() {
    assert_eq!(
        Command::parse(&["LOOP", "1"]).unwrap(),
        Command::Loop(Some(true))
    );
    assert_eq!(
        Command::parse(&["IN", "50"]).unwrap(),
        Command::In(Some(50))
    );
    assert_eq!(
        Command::parse(&["OUT", "250"]).unwrap(),
        Command::Out(Some(250))
    );
    assert_eq!(
        Command::parse(&["LENGTH", "200"]).unwrap(),
        Command::Length(Some(200))
    );
    assert_eq!(
        Command::parse(&["SEEK", "out", "-25"]).unwrap(),
        Command::Seek(SeekTarget::Out, -25)
    );
}

#[test]
fn opening_a_nonexistent_source_fails_fast() {
    let result = MediaProducer::new(
        ChannelFormat::hd1080p25(),
        ProducerOptions::from_url("/no/such/clip.mxf"),
    );
    match result {
        Err(playout_core::Error::Open { url, .. }) => assert_eq!(url, "/no/such/clip.mxf"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("open should fail"),
    }
}
