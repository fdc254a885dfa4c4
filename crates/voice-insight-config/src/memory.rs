// Memory estimates for worker models

use std::collections::HashMap;

use crate::ModelType;

pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

pub const DEFAULT_STT_GB: f64 = 2.0;
pub const DEFAULT_TTS_GB: f64 = 1.0;

lazy_static::lazy_static! {
    /// Empirically measured footprints of known models, in GB.
    static ref KNOWN_MODEL_GB: HashMap<&'static str, f64> = HashMap::from([
        ("mlx-community/whisper-large-v3-turbo", 1.5),
        ("mlx-community/whisper-large-v3-mlx", 3.0),
        ("mlx-community/whisper-large-v3-turbo-asr-fp16", 1.5),
        ("mlx-community/distil-whisper-large-v3", 1.2),
        ("mlx-community/Kokoro-82M-bf16", 0.5),
        ("Marvis-AI/marvis-tts-250m-v0.1", 1.0),
    ]);
}

pub fn gb_to_bytes(gb: f64) -> u64 {
    (gb * BYTES_PER_GB as f64).round() as u64
}

/// Estimate how much memory a model needs when no explicit figure is configured.
///
/// Known paths win; otherwise keywords in the path pick a size class.
pub fn estimate_memory_gb(model_path: &str, model_type: ModelType) -> f64 {
    if let Some(gb) = KNOWN_MODEL_GB.get(model_path) {
        return *gb;
    }

    let lower = model_path.to_lowercase();
    match model_type {
        ModelType::Stt => {
            if lower.contains("turbo") {
                1.5
            } else if lower.contains("large") {
                3.0
            } else if lower.contains("medium") {
                1.5
            } else if lower.contains("small") {
                0.5
            } else {
                DEFAULT_STT_GB
            }
        }
        ModelType::Tts => {
            if lower.contains("250m") {
                1.0
            } else if lower.contains("82m") {
                0.5
            } else {
                DEFAULT_TTS_GB
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_wins() {
        assert_eq!(
            estimate_memory_gb("mlx-community/whisper-large-v3-mlx", ModelType::Stt),
            3.0
        );
        assert_eq!(
            estimate_memory_gb("mlx-community/Kokoro-82M-bf16", ModelType::Tts),
            0.5
        );
    }

    #[test]
    fn test_stt_keyword_classes() {
        // "turbo" is checked before "large"
        assert_eq!(estimate_memory_gb("someone/whisper-large-turbo", ModelType::Stt), 1.5);
        assert_eq!(estimate_memory_gb("someone/whisper-large", ModelType::Stt), 3.0);
        assert_eq!(estimate_memory_gb("someone/whisper-small", ModelType::Stt), 0.5);
        assert_eq!(estimate_memory_gb("someone/unknown", ModelType::Stt), DEFAULT_STT_GB);
    }

    #[test]
    fn test_tts_keyword_classes() {
        assert_eq!(estimate_memory_gb("x/other-82M", ModelType::Tts), 0.5);
        assert_eq!(estimate_memory_gb("x/unknown", ModelType::Tts), DEFAULT_TTS_GB);
    }

    #[test]
    fn test_gb_to_bytes() {
        assert_eq!(gb_to_bytes(1.0), BYTES_PER_GB);
        assert_eq!(gb_to_bytes(1.5), BYTES_PER_GB + BYTES_PER_GB / 2);
        assert_eq!(gb_to_bytes(0.0), 0);
    }
}
