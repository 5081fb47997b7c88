use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Sample rate used on every leg of the pipeline. The upstream speech model
/// produces and consumes 24kHz mono PCM16, so capture, transport and playback
/// all run at this rate.
pub const SAMPLE_RATE: u32 = 24_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;

/// Transport encoding chunk size in bytes. A multiple of 2 so no sample's two
/// bytes are split across a chunk boundary, and a multiple of 3 so each chunk
/// encodes to base64 without internal padding. Concatenating per-chunk output
/// therefore equals encoding the whole buffer at once.
const ENCODE_CHUNK_SIZE: usize = 0x7FFE;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid transport text: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid audio container: {0}")]
    Container(String),
}

/// Convert f32 samples in [-1, 1] to PCM 16-bit little-endian bytes.
///
/// The scale is asymmetric: negative values scale toward -32768 and
/// non-negative values toward 32767, so +1.0 cannot overflow.
pub fn floats_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut pcm_data = Vec::with_capacity(samples.len() * 2);

    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let value = if s < 0.0 {
            (s * 0x8000 as f32) as i16
        } else {
            (s * 0x7FFF as f32) as i16
        };
        pcm_data.extend_from_slice(&value.to_le_bytes());
    }

    pcm_data
}

/// Convert PCM 16-bit little-endian bytes back to f32 samples, using the
/// exact inverse of the [`floats_to_pcm16`] scale so a round trip stays
/// within one quantization step.
pub fn pcm16_to_samples(pcm_data: &[u8]) -> Vec<f32> {
    pcm_data
        .chunks_exact(2)
        .map(|chunk| {
            let value = i16::from_le_bytes([chunk[0], chunk[1]]);
            if value < 0 {
                value as f32 / 0x8000 as f32
            } else {
                value as f32 / 0x7FFF as f32
            }
        })
        .collect()
}

/// Encode a PCM16 byte buffer into its transport-safe text form.
///
/// The buffer is processed in bounded chunks rather than as one allocation so
/// arbitrarily large buffers never produce a single oversized intermediate.
pub fn pcm16_to_transport_text(pcm_data: &[u8]) -> String {
    let mut encoded = String::with_capacity(pcm_data.len().div_ceil(3) * 4 + 4);

    for chunk in pcm_data.chunks(ENCODE_CHUNK_SIZE) {
        encoded.push_str(&STANDARD.encode(chunk));
    }

    encoded
}

/// Decode the transport text form back into raw PCM16 bytes.
pub fn transport_text_to_pcm16(text: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(STANDARD.decode(text)?)
}

/// Prefix raw PCM16 bytes with a 44-byte RIFF/WAVE header so the buffer is a
/// self-describing container: linear PCM, mono, 24kHz, 16 bits per sample,
/// with byte rate and block alignment derived from those parameters.
pub fn pcm16_to_wav(pcm_data: &[u8]) -> Vec<u8> {
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let byte_rate = SAMPLE_RATE * block_align as u32;
    let data_len = pcm_data.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm_data.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format tag
    wav.extend_from_slice(&CHANNELS.to_le_bytes());
    wav.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm_data);

    wav
}
