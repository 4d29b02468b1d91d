//! Per-consumer frame transforms: stereo routing, then pan

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::audio::frame::{decode_samples, encode_samples};

/// Below this magnitude a pan value is treated as centered
const PAN_EPSILON: f32 = 1e-3;

/// Which input channel(s) feed the consumer's two outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StereoMode {
    #[default]
    Both,
    /// Left input on both outputs
    Left,
    /// Right input on both outputs
    Right,
}

impl StereoMode {
    /// Lenient parse: unknown values fall back to `Both`
    pub fn normalize(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "left" => Self::Left,
            "right" => Self::Right,
            _ => Self::Both,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Both => "both",
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Both => 0,
            Self::Left => 1,
            Self::Right => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Left,
            2 => Self::Right,
            _ => Self::Both,
        }
    }
}

impl FromStr for StereoMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::normalize(s))
    }
}

impl fmt::Display for StereoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clamp a pan value into [-1, 1]; NaN centers
pub fn normalize_pan(pan: f32) -> f32 {
    if pan.is_nan() {
        0.0
    } else {
        pan.clamp(-1.0, 1.0)
    }
}

/// Constant-power gains for a pan value: `(left, right)`
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let angle = (normalize_pan(pan) + 1.0) * PI / 4.0;
    (angle.cos(), angle.sin())
}

/// Route channels according to `mode`
pub fn apply_stereo_mode(chunk: Bytes, mode: StereoMode) -> Bytes {
    if mode == StereoMode::Both || chunk.is_empty() {
        return chunk;
    }
    let mut samples = decode_samples(&chunk);
    for pair in samples.chunks_exact_mut(2) {
        match mode {
            StereoMode::Left => pair[1] = pair[0],
            StereoMode::Right => pair[0] = pair[1],
            StereoMode::Both => {}
        }
    }
    encode_samples(&samples)
}

/// Scale each channel by its pan gain, clamped to the i16 range.
/// A centered pan returns the input untouched.
pub fn apply_pan(chunk: Bytes, pan: f32) -> Bytes {
    if normalize_pan(pan).abs() < PAN_EPSILON || chunk.is_empty() {
        return chunk;
    }
    let (left_gain, right_gain) = pan_gains(pan);
    let mut samples = decode_samples(&chunk);
    for pair in samples.chunks_exact_mut(2) {
        pair[0] = scale(pair[0], left_gain);
        pair[1] = scale(pair[1], right_gain);
    }
    encode_samples(&samples)
}

fn scale(sample: i16, gain: f32) -> i16 {
    let value = (sample as f32 * gain) as i32;
    value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn stereo(pairs: &[(i16, i16)]) -> Bytes {
        let samples: Vec<i16> = pairs.iter().flat_map(|(l, r)| [*l, *r]).collect();
        encode_samples(&samples)
    }

    #[rstest]
    #[case(StereoMode::Both, &[(100, -200), (3, 4)])]
    #[case(StereoMode::Left, &[(100, 100), (3, 3)])]
    #[case(StereoMode::Right, &[(-200, -200), (4, 4)])]
    fn test_stereo_routing(#[case] mode: StereoMode, #[case] expected: &[(i16, i16)]) {
        let input = stereo(&[(100, -200), (3, 4)]);
        assert_eq!(apply_stereo_mode(input, mode), stereo(expected));
    }

    #[rstest]
    #[case("left", StereoMode::Left)]
    #[case(" RIGHT ", StereoMode::Right)]
    #[case("both", StereoMode::Both)]
    #[case("mono", StereoMode::Both)]
    #[case("", StereoMode::Both)]
    fn test_stereo_mode_normalize(#[case] input: &str, #[case] expected: StereoMode) {
        assert_eq!(StereoMode::normalize(input), expected);
        assert_eq!(input.parse::<StereoMode>().unwrap(), expected);
    }

    #[test]
    fn test_hard_pan() {
        let input = stereo(&[(1000, 1000)]);
        let left = decode_samples(&apply_pan(input.clone(), -1.0));
        assert_eq!(left, vec![1000, 0]);

        let right = decode_samples(&apply_pan(input, 1.0));
        assert_eq!(right[0], 0);
        assert!((999..=1000).contains(&right[1]));
    }

    #[test]
    fn test_pan_is_clamped() {
        assert_eq!(normalize_pan(3.0), 1.0);
        assert_eq!(normalize_pan(-7.5), -1.0);
        assert_eq!(normalize_pan(f32::NAN), 0.0);
    }

    proptest! {
        #[test]
        fn pan_zero_is_identity(samples in proptest::collection::vec(any::<i16>(), 0..512)) {
            let input = encode_samples(&samples);
            prop_assert_eq!(apply_pan(input.clone(), 0.0), input);
        }

        #[test]
        fn stereo_modes_are_idempotent(samples in proptest::collection::vec(any::<i16>(), 0..512)) {
            let input = encode_samples(&samples);
            prop_assert_eq!(apply_stereo_mode(input.clone(), StereoMode::Both), input.clone());
            for mode in [StereoMode::Left, StereoMode::Right] {
                let once = apply_stereo_mode(input.clone(), mode);
                let twice = apply_stereo_mode(once.clone(), mode);
                prop_assert_eq!(once, twice);
            }
        }

        #[test]
        fn pan_never_amplifies(sample in any::<i16>(), pan in -1.0f32..1.0) {
            let out = decode_samples(&apply_pan(stereo(&[(sample, sample)]), pan));
            prop_assert!((out[0] as i32).abs() <= (sample as i32).abs());
            prop_assert!((out[1] as i32).abs() <= (sample as i32).abs());
        }
    }
}
