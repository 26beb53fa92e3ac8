//! Target channel format descriptors
//!
//! A [`ChannelFormat`] pins the output side of the producer: raster size,
//! field mode, frame rate, audio sample rate and the audio cadence that
//! realizes a non-integer samples-per-frame rate exactly over one cycle.

use serde::{Deserialize, Serialize};

/// A rational number, used for frame rates and time bases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    /// Numerator
    pub num: i32,
    /// Denominator
    pub den: i32,
}

impl Rational {
    /// Create a new rational
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// The multiplicative inverse (numerator and denominator swapped)
    pub const fn invert(self) -> Self {
        Self {
            num: self.den,
            den: self.num,
        }
    }

    /// Approximate as a floating point value
    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl std::fmt::Display for Rational {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Which field of an interlaced frame is displayed first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOrder {
    /// Progressive output, no fields
    Progressive,
    /// Upper field first
    TopFieldFirst,
    /// Lower field first
    BottomFieldFirst,
}

/// Target output format of a playout channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFormat {
    /// Human readable format name (e.g. "1080i50")
    pub name: String,

    /// Output width in pixels
    pub width: u32,

    /// Output height in pixels
    pub height: u32,

    /// 1 for progressive output, 2 for interlaced
    pub field_count: u32,

    /// Field dominance for interlaced output
    pub field_order: FieldOrder,

    /// Full-frame rate (fields excluded), e.g. 25/1 or 30000/1001
    pub frame_rate: Rational,

    /// Audio sample rate in Hz
    pub audio_sample_rate: u32,

    /// Cyclic per-frame sample counts summing to one second of audio
    pub audio_cadence: Vec<u32>,
}

impl ChannelFormat {
    /// Build a format with the cadence derived from rate and sample rate
    pub fn new(
        name: impl Into<String>,
        width: u32,
        height: u32,
        field_count: u32,
        field_order: FieldOrder,
        frame_rate: Rational,
        audio_sample_rate: u32,
    ) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            field_count,
            field_order,
            frame_rate,
            audio_sample_rate,
            audio_cadence: audio_cadence(audio_sample_rate, frame_rate),
        }
    }

    /// PAL 576i50
    pub fn pal() -> Self {
        Self::new(
            "PAL",
            720,
            576,
            2,
            FieldOrder::TopFieldFirst,
            Rational::new(25, 1),
            48000,
        )
    }

    /// NTSC 480i59.94
    pub fn ntsc() -> Self {
        Self::new(
            "NTSC",
            720,
            486,
            2,
            FieldOrder::BottomFieldFirst,
            Rational::new(30000, 1001),
            48000,
        )
    }

    /// 720p50
    pub fn hd720p50() -> Self {
        Self::new(
            "720p50",
            1280,
            720,
            1,
            FieldOrder::Progressive,
            Rational::new(50, 1),
            48000,
        )
    }

    /// 1080i50
    pub fn hd1080i50() -> Self {
        Self::new(
            "1080i50",
            1920,
            1080,
            2,
            FieldOrder::TopFieldFirst,
            Rational::new(25, 1),
            48000,
        )
    }

    /// 1080p25
    pub fn hd1080p25() -> Self {
        Self::new(
            "1080p25",
            1920,
            1080,
            1,
            FieldOrder::Progressive,
            Rational::new(25, 1),
            48000,
        )
    }

    /// 1080p29.97
    pub fn hd1080p2997() -> Self {
        Self::new(
            "1080p2997",
            1920,
            1080,
            1,
            FieldOrder::Progressive,
            Rational::new(30000, 1001),
            48000,
        )
    }

    /// 2160p50
    pub fn uhd2160p50() -> Self {
        Self::new(
            "2160p50",
            3840,
            2160,
            1,
            FieldOrder::Progressive,
            Rational::new(50, 1),
            48000,
        )
    }

    /// The time base of one output frame: the inverse of the frame rate
    pub fn frame_time_base(&self) -> Rational {
        self.frame_rate.invert()
    }

    /// Frames (fields included) buffered ahead, roughly one second of output
    pub fn buffer_capacity(&self) -> usize {
        let fps = (self.frame_rate.num as f64 / self.frame_rate.den as f64).round() as usize;
        fps.max(1) * self.field_count as usize
    }
}

/// Compute the cyclic audio cadence for a sample rate and frame rate.
///
/// Entry `k` is `floor((k+1)*spf) - floor(k*spf)` where `spf` is the exact
/// samples-per-frame fraction, so the counts sum to the sample rate over one
/// full cycle. Integer rates collapse to a single entry.
pub fn audio_cadence(sample_rate: u32, frame_rate: Rational) -> Vec<u32> {
    // samples per frame = sample_rate * den / num
    let p = sample_rate as u64 * frame_rate.den as u64;
    let q = frame_rate.num as u64;
    let g = gcd(p, q);
    let (p, q) = (p / g, q / g);

    (0..q)
        .map(|k| ((k + 1) * p / q - k * p / q) as u32)
        .collect()
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_rate_has_single_entry_cadence() {
        assert_eq!(audio_cadence(48000, Rational::new(25, 1)), vec![1920]);
        assert_eq!(audio_cadence(48000, Rational::new(50, 1)), vec![960]);
    }

    #[test]
    fn ntsc_cadence_cycles_over_five_frames() {
        let cadence = audio_cadence(48000, Rational::new(30000, 1001));
        assert_eq!(cadence.len(), 5);
        assert_eq!(cadence.iter().sum::<u32>(), 8008);
        assert!(cadence.iter().all(|&n| n == 1601 || n == 1602));
    }

    #[test]
    fn cadence_sums_to_one_second_over_full_cycle() {
        for (rate, fps) in [
            (48000, Rational::new(24000, 1001)),
            (48000, Rational::new(60000, 1001)),
            (44100, Rational::new(25, 1)),
        ] {
            let cadence = audio_cadence(rate, fps);
            // Summed over the cycle the cadence is exact: sum/len == rate*den/num.
            let total: u64 = cadence.iter().map(|&n| n as u64).sum();
            assert_eq!(
                total * fps.num as u64,
                rate as u64 * fps.den as u64 * cadence.len() as u64,
                "cadence {cadence:?} for {fps}"
            );
        }
    }

    #[test]
    fn pal_preset_is_interlaced_at_25() {
        let fmt = ChannelFormat::pal();
        assert_eq!(fmt.field_count, 2);
        assert_eq!(fmt.frame_rate, Rational::new(25, 1));
        assert_eq!(fmt.audio_cadence, vec![1920]);
        assert_eq!(fmt.buffer_capacity(), 50);
    }

    #[test]
    fn frame_time_base_inverts_rate() {
        let fmt = ChannelFormat::hd1080p2997();
        assert_eq!(fmt.frame_time_base(), Rational::new(1001, 30000));
    }
}
