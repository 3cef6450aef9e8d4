//! µ-law (G.711) ↔ linear PCM16 conversion and simple linear-interpolation
//! sample-rate conversion between the carrier's fixed 8 kHz and the
//! model-provider's negotiated rate.
//!
//! The source integration delegates µ-law conversion to Python's `audioop`
//! module (`ulaw2lin`/`lin2ulaw`); there is no Rust equivalent in the corpus,
//! so this implements the standard ITU-T G.711 µ-law tables directly.

const ULAW_BIAS: i16 = 0x84;
const ULAW_CLIP: i16 = 32635;

/// Decode a single µ-law byte to a linear PCM16 sample.
pub fn ulaw_decode_sample(ulaw: u8) -> i16 {
    let u = !ulaw;
    let sign = u & 0x80;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;
    let mut sample = (i16::from(mantissa) << 3) + ULAW_BIAS;
    sample <<= exponent;
    sample -= ULAW_BIAS;
    if sign != 0 {
        -sample
    } else {
        sample
    }
}

/// Encode a single linear PCM16 sample to µ-law.
pub fn ulaw_encode_sample(pcm: i16) -> u8 {
    let sign: u8 = if pcm < 0 { 0x80 } else { 0x00 };
    let mut magnitude = if pcm < 0 {
        (-(pcm as i32)) as i16
    } else {
        pcm
    };
    if magnitude > ULAW_CLIP {
        magnitude = ULAW_CLIP;
    }
    magnitude += ULAW_BIAS;

    let exponent = ulaw_exponent(magnitude);
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    let byte = sign | (exponent << 4) | mantissa;
    !byte
}

/// G.711 segment number for a BIAS-adjusted magnitude: the smallest `seg` in
/// `0..=7` such that `magnitude <= (256 << seg) - 1`, i.e. `bit_length(magnitude)
/// - 8` clamped to that range. Equivalent to the canonical search against
/// `seg_end = {0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF, 0x3FFF, 0x7FFF}`,
/// computed instead of stored.
fn ulaw_exponent(magnitude: i16) -> u8 {
    let bit_length = 16 - (magnitude as u16).leading_zeros() as i32;
    (bit_length - 8).clamp(0, 7) as u8
}

/// Decode a buffer of µ-law bytes to linear PCM16 little-endian bytes.
pub fn decode_pcmu_to_pcm16(ulaw_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ulaw_bytes.len() * 2);
    for &b in ulaw_bytes {
        let sample = ulaw_decode_sample(b);
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Encode linear PCM16 little-endian bytes to µ-law.
pub fn encode_pcm16_to_pcmu(pcm16_bytes: &[u8]) -> Vec<u8> {
    pcm16_bytes
        .chunks_exact(2)
        .map(|chunk| {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            ulaw_encode_sample(sample)
        })
        .collect()
}

/// Linear-interpolation resample of PCM16 samples from `from_rate` to `to_rate`.
/// Not audiophile-grade, but matches the bridge's need: carrier uplink at
/// 8kHz occasionally must reach a 16kHz-only provider, and vice versa for
/// 24kHz downlink.
pub fn resample_pcm16(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = ((samples.len() as f64) * ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos.floor() as usize;
        let frac = src_pos - idx as f64;
        let s0 = samples.get(idx).copied().unwrap_or(0) as f64;
        let s1 = samples.get(idx + 1).copied().unwrap_or(s0 as i16) as f64;
        out.push((s0 + (s1 - s0) * frac).round() as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_round_trip_within_quantization_error() {
        let samples: Vec<i16> = vec![0, 100, -100, 1000, -1000, 16000, -16000, 32000, -32000];
        for &s in &samples {
            let encoded = ulaw_encode_sample(s);
            let decoded = ulaw_decode_sample(encoded);
            // G.711 is a lossy logarithmic codec; error grows with magnitude.
            let allowed_error = (s.unsigned_abs() as i32 / 16).max(33);
            assert!(
                (decoded as i32 - s as i32).abs() <= allowed_error,
                "sample {s} decoded to {decoded}, error exceeds {allowed_error}"
            );
        }
    }

    #[test]
    fn buffer_round_trip_preserves_length() {
        let pcm: Vec<u8> = (0..320i16)
            .flat_map(|v| (v * 10).to_le_bytes())
            .collect();
        let ulaw = encode_pcm16_to_pcmu(&pcm);
        assert_eq!(ulaw.len(), pcm.len() / 2);
        let back = decode_pcmu_to_pcm16(&ulaw);
        assert_eq!(back.len(), pcm.len());
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let samples = vec![1, 2, 3, 4];
        assert_eq!(resample_pcm16(&samples, 8000, 8000), samples);
    }

    #[test]
    fn resample_upsamples_to_expected_length() {
        let samples = vec![0i16; 800]; // 100ms @ 8kHz
        let up = resample_pcm16(&samples, 8000, 16000);
        assert_eq!(up.len(), 1600);
    }
}
