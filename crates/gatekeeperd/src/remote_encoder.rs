//! Face encoder backed by an HTTP detection + embedding service.
//!
//! Each frame is posted as a grayscale PNG; the service answers with
//! `{"faces": [{"box": {...}, "embedding": [...]}]}`. Runs on the engine
//! thread, so it uses the blocking client.

use gatekeeper_core::encoder::check_frame_len;
use gatekeeper_core::{BoundingBox, EncoderError, Embedding, FaceEncoder, Probe};
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;

#[derive(Deserialize)]
struct EncodeResponse {
    faces: Vec<EncodedFace>,
}

#[derive(Deserialize)]
struct EncodedFace {
    #[serde(rename = "box")]
    bounding_box: BoundingBox,
    embedding: Vec<f32>,
}

pub struct RemoteEncoder {
    client: reqwest::blocking::Client,
    url: String,
}

impl RemoteEncoder {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, EncoderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EncoderError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl FaceEncoder for RemoteEncoder {
    fn encode(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<Probe>, EncoderError> {
        let png = encode_png(frame, width, height)?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(png)
            .send()
            .map_err(|e| {
                if e.is_connect() {
                    EncoderError::Unavailable(format!("{}: {e}", self.url))
                } else {
                    EncoderError::Failed(format!("request: {e}"))
                }
            })?
            .error_for_status()
            .map_err(|e| EncoderError::Failed(format!("service: {e}")))?;

        let bytes = response
            .bytes()
            .map_err(|e| EncoderError::Failed(format!("response body: {e}")))?;
        parse_response(&bytes)
    }
}

fn encode_png(frame: &[u8], width: u32, height: u32) -> Result<Vec<u8>, EncoderError> {
    check_frame_len(frame, width, height)?;
    let pixels = width as usize * height as usize;
    let img = image::GrayImage::from_raw(width, height, frame[..pixels].to_vec()).ok_or(
        EncoderError::InvalidFrame {
            expected: pixels,
            actual: frame.len(),
        },
    )?;

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| EncoderError::Failed(format!("png encode: {e}")))?;
    Ok(png)
}

/// Parse the service response into probes, best detection first.
fn parse_response(body: &[u8]) -> Result<Vec<Probe>, EncoderError> {
    let parsed: EncodeResponse = serde_json::from_slice(body)
        .map_err(|e| EncoderError::Failed(format!("malformed response: {e}")))?;

    let mut probes: Vec<Probe> = parsed
        .faces
        .into_iter()
        .map(|f| Probe {
            bounding_box: f.bounding_box,
            embedding: Embedding::new(f.embedding),
        })
        .collect();
    probes.sort_by(|a, b| {
        b.bounding_box
            .confidence
            .partial_cmp(&a.bounding_box.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(probes)
}
