// Request parsing utilities for HTTP handlers

use hyper::body::Bytes;
use hyper::{Body, Response, StatusCode, Uri};
use serde::de::DeserializeOwned;

use crate::web::response_helpers::json_error;
use crate::{sys_debug, sys_warn};

/// Read the whole request body.
pub async fn read_body(body: Body) -> Result<Bytes, Response<Body>> {
    hyper::body::to_bytes(body)
        .await
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "Failed to read request body"))
}

/// Parse JSON request body into a typed structure.
///
/// Returns the deserialized value on success, or an error Response on failure.
///
/// # Example
/// ```ignore
/// let request: SynthesizeRequest = match parse_json_body(req.into_body()).await {
///     Ok(req) => req,
///     Err(error_response) => return Ok(error_response),
/// };
/// ```
pub async fn parse_json_body<T: DeserializeOwned>(body: Body) -> Result<T, Response<Body>> {
    let body_bytes = read_body(body).await?;
    parse_json_bytes(&body_bytes)
}

pub fn parse_json_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Response<Body>> {
    // Audio payloads can be huge; only log small bodies
    if bytes.len() <= 1024 {
        if let Ok(body_str) = std::str::from_utf8(bytes) {
            if !body_str.is_empty() {
                sys_debug!("[REQUEST] Body: {}", body_str);
            }
        }
    }

    serde_json::from_slice::<T>(bytes).map_err(|e| {
        sys_warn!("[REQUEST] JSON parsing error: {}", e);
        json_error(StatusCode::BAD_REQUEST, &format!("Invalid JSON: {e}"))
    })
}

/// Extract a query parameter from URI.
///
/// Returns `Some(value)` if the parameter exists, `None` otherwise.
/// The value is URL-decoded automatically.
pub fn get_query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;

    for param in query.split('&') {
        if let Some((param_key, param_value)) = param.split_once('=') {
            if param_key == key {
                // Form encoding uses '+' for spaces
                let value = param_value.replace('+', " ");
                return urlencoding::decode(&value).ok().map(|s| s.to_string());
            }
        }
    }

    None
}

/// Boundary parameter of a `multipart/form-data` content type.
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    let (mime, params) = content_type.split_once(';')?;
    if !mime.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params.split(';').find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|b| !b.is_empty())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Value of a simple (non-file) form field in a multipart body.
pub fn multipart_field(body: &[u8], boundary: &str, name: &str) -> Option<String> {
    let delimiter = format!("--{boundary}");
    let wanted = format!("name=\"{name}\"");
    let mut rest = body;

    while let Some(start) = find(rest, delimiter.as_bytes()) {
        rest = &rest[start + delimiter.len()..];
        if rest.starts_with(b"--") {
            break;
        }
        let header_end = find(rest, b"\r\n\r\n")?;
        let headers = String::from_utf8_lossy(&rest[..header_end]);
        let content = &rest[header_end + 4..];
        let content_end = find(content, delimiter.as_bytes()).unwrap_or(content.len());

        let is_wanted = headers.lines().any(|line| {
            let line = line.to_ascii_lowercase();
            line.starts_with("content-disposition:")
                && line.contains(&wanted.to_ascii_lowercase())
                && !line.contains("filename=")
        });
        if is_wanted {
            let value = &content[..content_end];
            let value = value.strip_suffix(b"\r\n").unwrap_or(value);
            return Some(String::from_utf8_lossy(value).trim().to_string());
        }
        rest = &content[content_end..];
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_query_param_basic() {
        let uri: Uri = "/v1/audio/speech?input=hi".parse().unwrap();
        assert_eq!(get_query_param(&uri, "input"), Some("hi".to_string()));
    }

    #[test]
    fn test_get_query_param_url_encoded() {
        let uri: Uri = "/v1/audio/speech?input=hello%20world&voice=af_heart".parse().unwrap();
        assert_eq!(get_query_param(&uri, "input"), Some("hello world".to_string()));
        assert_eq!(get_query_param(&uri, "voice"), Some("af_heart".to_string()));
    }

    #[test]
    fn test_get_query_param_plus_is_space() {
        let uri: Uri = "/v1/audio/speech?input=good+morning".parse().unwrap();
        assert_eq!(get_query_param(&uri, "input"), Some("good morning".to_string()));
    }

    #[test]
    fn test_get_query_param_missing() {
        let uri: Uri = "/v1/audio/speech?foo=bar".parse().unwrap();
        assert_eq!(get_query_param(&uri, "missing"), None);
        let bare: Uri = "/v1/audio/speech".parse().unwrap();
        assert_eq!(get_query_param(&bare, "foo"), None);
    }

    #[test]
    fn test_multipart_boundary() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=----abc123"),
            Some("----abc123".to_string())
        );
        assert_eq!(
            multipart_boundary(r#"multipart/form-data; charset=utf-8; boundary="xyz""#),
            Some("xyz".to_string())
        );
        assert_eq!(multipart_boundary("application/json"), None);
    }

    #[test]
    fn test_multipart_field_skips_file_parts() {
        let body = concat!(
            "--XX\r\n",
            "Content-Disposition: form-data; name=\"file\"; filename=\"a.wav\"\r\n",
            "Content-Type: audio/wav\r\n\r\n",
            "RIFF....model....\r\n",
            "--XX\r\n",
            "Content-Disposition: form-data; name=\"model\"\r\n\r\n",
            "stt-accurate\r\n",
            "--XX\r\n",
            "Content-Disposition: form-data; name=\"language\"\r\n\r\n",
            "en\r\n",
            "--XX--\r\n",
        );
        assert_eq!(multipart_field(body.as_bytes(), "XX", "model"), Some("stt-accurate".to_string()));
        assert_eq!(multipart_field(body.as_bytes(), "XX", "language"), Some("en".to_string()));
        assert_eq!(multipart_field(body.as_bytes(), "XX", "prompt"), None);
        assert_eq!(multipart_field(body.as_bytes(), "XX", "file"), None);
    }

    #[test]
    fn test_parse_json_bytes_rejects_garbage() {
        let result: Result<serde_json::Value, _> = parse_json_bytes(b"{not json");
        assert_eq!(result.unwrap_err().status(), StatusCode::BAD_REQUEST);
    }
}
