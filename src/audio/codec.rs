//! Per-call transcoding between the carrier and model audio formats.
//!
//! The carrier side speaks μ-law at 8 kHz; the model consumes linear PCM
//! s16le at 16 kHz and produces it at 24 kHz. Both directions are pure
//! transformations: the only state is the interpolation/decimation carry
//! needed to make chunk boundaries seamless, plus a bounded residue buffer
//! for packets shorter than one output sample.

use bytes::Bytes;
use thiserror::Error;

use super::g711;

/// Errors produced by the codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A PCM byte stream whose length is not a multiple of the sample size.
    /// The orchestrator treats this as fatal for the call.
    #[error("corrupt PCM payload: {len} bytes is not a whole number of s16le samples")]
    CorruptPcmLength {
        /// Offending payload length in bytes.
        len: usize,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Number of low-pass taps applied before 24 kHz → 8 kHz decimation.
const LOWPASS_TAPS: usize = 31;

/// Low-pass cutoff as a fraction of the 24 kHz input rate. 3.4 kHz is the
/// upper edge of telephony bandwidth; keeping the −3 dB point there leaves
/// the 4 kHz Nyquist of the 8 kHz output well attenuated.
const LOWPASS_CUTOFF: f64 = 3400.0 / 24000.0;

/// Stateful transcoder for one call.
///
/// One instance serves both directions of a single call. Instances are not
/// shared across calls; `reset` returns one to its initial state.
pub struct CallCodec {
    /// Last 16 kHz-bound input sample, carried across chunks so the 1→2
    /// interpolation stays continuous.
    up_prev: i16,
    up_primed: bool,
    /// FIR delay line for the downsampling low-pass.
    down_history: Vec<f32>,
    /// Decimation phase within the 3→1 pattern, carried across chunks.
    down_phase: u8,
    /// Odd trailing byte of a 24 kHz payload, held until the next chunk.
    residue: Option<u8>,
    taps: [f32; LOWPASS_TAPS],
}

impl CallCodec {
    pub fn new() -> Self {
        Self {
            up_prev: 0,
            up_primed: false,
            down_history: vec![0.0; LOWPASS_TAPS - 1],
            down_phase: 0,
            residue: None,
            taps: hamming_sinc_taps(),
        }
    }

    /// Decode carrier μ-law at 8 kHz into PCM s16le at 16 kHz.
    ///
    /// Each μ-law byte yields two output samples: the midpoint between the
    /// previous and current sample, then the sample itself. Empty input
    /// yields empty output.
    pub fn decode_ulaw_to_pcm16k(&mut self, ulaw: &[u8]) -> Bytes {
        if ulaw.is_empty() {
            return Bytes::new();
        }

        let mut out = Vec::with_capacity(ulaw.len() * 4);
        for &byte in ulaw {
            let sample = g711::ulaw_expand(byte);
            if !self.up_primed {
                self.up_prev = sample;
                self.up_primed = true;
            }
            let mid = ((self.up_prev as i32 + sample as i32) / 2) as i16;
            out.extend_from_slice(&mid.to_le_bytes());
            out.extend_from_slice(&sample.to_le_bytes());
            self.up_prev = sample;
        }
        Bytes::from(out)
    }

    /// Encode model PCM s16le at 24 kHz into carrier μ-law at 8 kHz.
    ///
    /// The stream is low-pass filtered, decimated 3→1, and companded. A
    /// trailing odd byte is buffered and consumed by the next call; a
    /// payload can therefore produce output shorter than `len / 6` bytes
    /// without losing samples.
    pub fn encode_pcm24k_to_ulaw(&mut self, pcm: &[u8]) -> CodecResult<Bytes> {
        if pcm.is_empty() && self.residue.is_none() {
            return Ok(Bytes::new());
        }

        // Reassemble sample bytes across the chunk seam.
        let mut bytes: Vec<u8> = Vec::with_capacity(pcm.len() + 1);
        if let Some(carry) = self.residue.take() {
            bytes.push(carry);
        }
        bytes.extend_from_slice(pcm);

        if bytes.len() % 2 != 0 {
            // Hold the dangling byte; everything before it is whole samples.
            self.residue = bytes.pop();
        }

        let mut out = Vec::with_capacity(bytes.len() / 6 + 1);
        for pair in bytes.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            let filtered = self.lowpass_push(sample);
            if self.down_phase == 0 {
                out.push(g711::ulaw_compress(filtered));
            }
            self.down_phase = (self.down_phase + 1) % 3;
        }
        Ok(Bytes::from(out))
    }

    /// Validate that a PCM payload is a whole number of s16le samples.
    ///
    /// Used on decoder *output* boundaries where a partial sample cannot be
    /// explained by chunking and therefore indicates corruption.
    pub fn check_pcm_alignment(payload: &[u8]) -> CodecResult<()> {
        if payload.len() % 2 != 0 {
            return Err(CodecError::CorruptPcmLength { len: payload.len() });
        }
        Ok(())
    }

    /// Clear all carried state, including the residue buffer.
    pub fn reset(&mut self) {
        self.up_prev = 0;
        self.up_primed = false;
        self.down_history.iter_mut().for_each(|s| *s = 0.0);
        self.down_phase = 0;
        self.residue = None;
    }

    /// Push one sample through the FIR and return the filtered value.
    ///
    /// The delay line is pre-filled with zeros, so the window always spans
    /// the full tap count.
    fn lowpass_push(&mut self, sample: i16) -> i16 {
        self.down_history.push(sample as f32);

        let start = self.down_history.len() - LOWPASS_TAPS;
        let mut acc = 0.0f32;
        for (i, &s) in self.down_history[start..].iter().enumerate() {
            acc += s * self.taps[i];
        }

        // Keep the delay line bounded.
        if self.down_history.len() > LOWPASS_TAPS - 1 + 256 {
            self.down_history.drain(..256);
        }

        acc.clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }
}

impl Default for CallCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Hamming-windowed sinc taps for the decimation low-pass, normalized to
/// unity DC gain.
fn hamming_sinc_taps() -> [f32; LOWPASS_TAPS] {
    let mut taps = [0.0f32; LOWPASS_TAPS];
    let mid = (LOWPASS_TAPS - 1) as f64 / 2.0;
    let mut sum = 0.0f64;
    for (n, tap) in taps.iter_mut().enumerate() {
        let x = n as f64 - mid;
        let sinc = if x == 0.0 {
            2.0 * LOWPASS_CUTOFF
        } else {
            (2.0 * std::f64::consts::PI * LOWPASS_CUTOFF * x).sin() / (std::f64::consts::PI * x)
        };
        let window = 0.54
            - 0.46 * (2.0 * std::f64::consts::PI * n as f64 / (LOWPASS_TAPS - 1) as f64).cos();
        let value = sinc * window;
        *tap = value as f32;
        sum += value;
    }
    for tap in taps.iter_mut() {
        *tap = (*tap as f64 / sum) as f32;
    }
    taps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let mut codec = CallCodec::new();
        assert!(codec.decode_ulaw_to_pcm16k(&[]).is_empty());
        assert!(codec.encode_pcm24k_to_ulaw(&[]).unwrap().is_empty());
    }

    #[test]
    fn decode_doubles_sample_count() {
        let mut codec = CallCodec::new();
        let ulaw = vec![0xFFu8; 160]; // 20 ms of silence at 8 kHz
        let pcm = codec.decode_ulaw_to_pcm16k(&ulaw);
        assert_eq!(pcm.len(), 160 * 2 * 2); // 320 samples, 2 bytes each
    }

    #[test]
    fn decode_interpolates_midpoints() {
        let mut codec = CallCodec::new();
        // Two alternating μ-law codes with known linear values.
        let a = g711::ulaw_compress(0);
        let b = g711::ulaw_compress(8000);
        let pcm = codec.decode_ulaw_to_pcm16k(&[a, b]);
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples.len(), 4);
        let lo = g711::ulaw_expand(a);
        let hi = g711::ulaw_expand(b);
        // First pair duplicates the first sample; second pair interpolates.
        assert_eq!(samples[0], lo);
        assert_eq!(samples[1], lo);
        let mid = ((lo as i32 + hi as i32) / 2) as i16;
        assert!((samples[2] as i32 - mid as i32).abs() <= 1);
        assert_eq!(samples[3], hi);
    }

    #[test]
    fn encode_decimates_three_to_one() {
        let mut codec = CallCodec::new();
        let samples = vec![0i16; 480]; // 20 ms at 24 kHz
        let ulaw = codec.encode_pcm24k_to_ulaw(&pcm_bytes(&samples)).unwrap();
        assert_eq!(ulaw.len(), 160); // 20 ms at 8 kHz
    }

    #[test]
    fn encode_buffers_odd_trailing_byte() {
        let mut codec = CallCodec::new();
        let samples = vec![100i16; 7];
        let mut bytes = pcm_bytes(&samples);
        let dangling = bytes.pop().unwrap();

        // 13 bytes: 6 whole samples plus a dangling byte held as residue.
        let first = codec.encode_pcm24k_to_ulaw(&bytes).unwrap();
        assert_eq!(first.len(), 2);

        // Completing the sample plus two more yields the next output sample.
        let mut rest = vec![dangling];
        rest.extend_from_slice(&pcm_bytes(&[100i16; 2]));
        let second = codec.encode_pcm24k_to_ulaw(&rest).unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn reset_clears_residue() {
        let mut codec = CallCodec::new();
        codec.encode_pcm24k_to_ulaw(&[0x12]).unwrap();
        codec.reset();
        // After reset, a clean even payload decimates exactly.
        let ulaw = codec.encode_pcm24k_to_ulaw(&pcm_bytes(&[0i16; 6])).unwrap();
        assert_eq!(ulaw.len(), 2);
    }

    #[test]
    fn alignment_check_rejects_odd_lengths() {
        assert!(CallCodec::check_pcm_alignment(&[0, 1, 2]).is_err());
        assert!(CallCodec::check_pcm_alignment(&[0, 1]).is_ok());
    }

    #[test]
    fn tone_survives_downsampling() {
        // A 1 kHz tone is inside the passband and should keep most of its
        // energy through filter + decimation.
        let mut codec = CallCodec::new();
        let samples: Vec<i16> = (0..2400)
            .map(|i| {
                let t = i as f64 / 24000.0;
                ((2.0 * std::f64::consts::PI * 1000.0 * t).sin() * 12000.0) as i16
            })
            .collect();
        let ulaw = codec.encode_pcm24k_to_ulaw(&pcm_bytes(&samples)).unwrap();
        let decoded = g711::expand_slice(&ulaw);
        // Skip the filter warm-up region before measuring.
        let tail = &decoded[160..];
        let rms = (tail.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>()
            / tail.len() as f64)
            .sqrt();
        assert!(rms > 4000.0, "passband tone attenuated to rms {rms}");
    }
}
