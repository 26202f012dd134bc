//! Audio format negotiated on the output port.

use crate::error::{NodeError, Result};

/// Sample formats the port accepts in `port_set_param(Format, …)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
    S24,
    S24_32,
    S32,
    F32,
}

impl SampleFormat {
    /// Bytes occupied by a single sample of this format.
    pub fn bytes_per_sample(self) -> u32 {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::S24 => 3,
            SampleFormat::S24_32 | SampleFormat::S32 | SampleFormat::F32 => 4,
        }
    }

    /// Parse the `audio/raw` media-subtype sample format names used by the
    /// negotiation surface.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "S16" => Ok(SampleFormat::S16),
            "S24" => Ok(SampleFormat::S24),
            "S24_32" => Ok(SampleFormat::S24_32),
            "S32" => Ok(SampleFormat::S32),
            "F32" => Ok(SampleFormat::F32),
            other => Err(NodeError::InvalidArg(format!(
                "unsupported sample format: {other}"
            ))),
        }
    }
}

/// `{format, channels, rate, frame_size}` negotiated on the output port.
///
/// `frame_size = channels * bytes_per_sample(format)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
    pub frame_size: u32,
}

impl AudioFormat {
    /// Build a format, validating channel count and rate are non-zero and
    /// computing `frame_size`.
    pub fn new(format: SampleFormat, channels: u32, rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(NodeError::InvalidArg("channel count must be > 0".into()));
        }
        if rate == 0 {
            return Err(NodeError::InvalidArg("sample rate must be > 0".into()));
        }
        let frame_size = channels * format.bytes_per_sample();
        Ok(AudioFormat {
            format,
            channels,
            rate,
            frame_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_s16_stereo() {
        let fmt = AudioFormat::new(SampleFormat::S16, 2, 48000).unwrap();
        assert_eq!(fmt.frame_size, 4);
    }

    #[test]
    fn frame_size_f32_stereo() {
        let fmt = AudioFormat::new(SampleFormat::F32, 2, 44100).unwrap();
        assert_eq!(fmt.frame_size, 8);
    }

    #[test]
    fn zero_channels_rejected() {
        assert!(AudioFormat::new(SampleFormat::S16, 0, 48000).is_err());
    }

    #[test]
    fn zero_rate_rejected() {
        assert!(AudioFormat::new(SampleFormat::S16, 2, 0).is_err());
    }

    #[test]
    fn parse_rejects_unknown_format() {
        assert!(SampleFormat::parse("DSD").is_err());
    }
}
