// Request/response bodies of the gateway and manager surfaces

use hyper::Uri;
use serde::{Deserialize, Serialize};

use crate::web::request_parsing::get_query_param;

pub const DEFAULT_STT_MODEL: &str = "stt-fast";
pub const DEFAULT_TTS_MODEL: &str = "tts-fast";
pub const DEFAULT_VOICE: &str = "af_heart";

/// Voices advertised by `GET /v1/voices`.
pub const VOICE_CATALOG: &[&str] = &[
    "af_heart",
    "af_bella",
    "af_sarah",
    "am_adam",
    "am_michael",
    "bf_emma",
    "bm_george",
];

fn default_stt_model() -> String {
    DEFAULT_STT_MODEL.to_string()
}

fn default_tts_model() -> String {
    DEFAULT_TTS_MODEL.to_string()
}

fn default_voice() -> String {
    DEFAULT_VOICE.to_string()
}

fn default_format() -> String {
    "wav".to_string()
}

fn default_task() -> String {
    "transcribe".to_string()
}

fn default_speed() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

/// `POST /v1/transcribe`
#[derive(Debug, Deserialize)]
pub struct TranscribeRequest {
    pub audio_base64: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_task")]
    pub task: String,
}

impl TranscribeRequest {
    /// Form body for the worker's `/transcribe`.
    pub fn to_form(&self) -> String {
        [
            ("audio_base64", self.audio_base64.as_str()),
            ("language", self.language.as_deref().unwrap_or_default()),
            ("task", self.task.as_str()),
        ]
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
    }
}

/// `POST /v1/audio/speech`, from a JSON body or the query string.
#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default)]
    pub input: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_format")]
    pub response_format: String,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default = "default_true")]
    pub stream: bool,
}

impl SpeechRequest {
    pub fn from_query(uri: &Uri) -> Self {
        let param = |key: &str| get_query_param(uri, key);
        Self {
            model: param("model").unwrap_or_else(default_tts_model),
            input: param("input").unwrap_or_default(),
            voice: param("voice").unwrap_or_else(default_voice),
            response_format: param("response_format").unwrap_or_else(default_format),
            speed: param("speed")
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_speed),
            stream: param("stream")
                .map(|s| !matches!(s.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(true),
        }
    }

    pub fn to_worker(&self) -> WorkerSynthesizeRequest {
        WorkerSynthesizeRequest {
            text: self.input.clone(),
            voice: Some(self.voice.clone()),
            speed: self.speed,
            format: self.response_format.clone(),
            stream: self.stream,
        }
    }
}

/// `POST /v1/synthesize`
#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default = "default_format")]
    pub format: String,
}

impl SynthesizeRequest {
    pub fn to_worker(&self) -> WorkerSynthesizeRequest {
        WorkerSynthesizeRequest {
            text: self.text.clone(),
            voice: self.voice.clone(),
            speed: self.speed,
            format: self.format.clone(),
            stream: false,
        }
    }
}

/// Body of the worker's `POST /synthesize`.
#[derive(Debug, Serialize)]
pub struct WorkerSynthesizeRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub speed: f32,
    pub format: String,
    pub stream: bool,
}

/// The part of the worker's non-streaming synthesis reply we decode.
#[derive(Debug, Deserialize)]
pub struct WorkerAudio {
    pub audio_base64: String,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    #[serde(rename = "type")]
    pub model_type: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct VoiceList {
    pub voices: &'static [&'static str],
}

/// Manager `POST /spawn/{alias}` reply.
#[derive(Debug, Serialize)]
pub struct SpawnResponse {
    pub alias: String,
    pub port: u16,
    pub memory_bytes: u64,
    pub model_type: String,
}

/// Reply to eviction and stop requests.
#[derive(Debug, Serialize)]
pub struct EvictResponse {
    pub success: bool,
    pub alias: String,
    pub outcome: &'static str,
    pub freed_bytes: u64,
}
