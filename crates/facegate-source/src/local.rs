//! Local embedding backend — face detection and descriptor extraction
//! via ONNX Runtime, on a dedicated worker thread.
//!
//! The ORT sessions are loaded once, fail-fast, and owned by the worker;
//! async callers talk to it over an mpsc request channel with oneshot
//! replies, so many concurrent gate attempts share one pipeline without
//! shared mutable state.

use async_trait::async_trait;
use facegate_core::{Descriptor, MatchPolicy, Verdict};
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

use crate::{Artifact, Capture, DescriptorSource, SourceError};

const DETECT_INPUT_SIZE: u32 = 160;
const DETECT_MEAN: f32 = 127.5;
const DETECT_STD: f32 = 128.0;
const DETECT_SCORE_THRESHOLD: f32 = 0.5;
/// Detector rows are [score, x1, y1, x2, y2] in normalized coordinates.
const DETECT_ROW_LEN: usize = 5;

const EMBED_INPUT_SIZE: u32 = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;
const DESCRIPTOR_DIM: usize = 128;
const METHOD: &str = "facenet-128";

pub struct LocalConfig {
    pub detect_model: String,
    pub embed_model: String,
    pub policy: MatchPolicy,
    /// Minimum detection confidence for an enrollment capture.
    pub min_enroll_confidence: f32,
}

/// Descriptor plus the detection confidence it was extracted with.
struct Extraction {
    descriptor: Descriptor,
    confidence: f32,
}

struct ExtractRequest {
    jpeg: Vec<u8>,
    reply: oneshot::Sender<Result<Extraction, SourceError>>,
}

/// Clone-safe handle to the pipeline worker thread.
#[derive(Clone)]
pub struct LocalSource {
    tx: mpsc::Sender<ExtractRequest>,
    policy: MatchPolicy,
    min_enroll_confidence: f32,
}

impl LocalSource {
    /// Load both models and spawn the worker thread. Fails fast if either
    /// model file is unavailable.
    pub fn spawn(cfg: LocalConfig) -> Result<Self, SourceError> {
        let mut detector = load_session(&cfg.detect_model)?;
        tracing::info!(path = %cfg.detect_model, "face detector loaded");
        let mut embedder = load_session(&cfg.embed_model)?;
        tracing::info!(path = %cfg.embed_model, "face embedder loaded");

        let (tx, mut rx) = mpsc::channel::<ExtractRequest>(8);

        std::thread::Builder::new()
            .name("facegate-pipeline".into())
            .spawn(move || {
                tracing::info!("pipeline thread started");
                while let Some(req) = rx.blocking_recv() {
                    let result = run_extract(&mut detector, &mut embedder, &req.jpeg);
                    let _ = req.reply.send(result);
                }
                tracing::info!("pipeline thread exiting");
            })
            .map_err(|e| SourceError::Unavailable(format!("spawn pipeline thread: {e}")))?;

        Ok(Self {
            tx,
            policy: cfg.policy,
            min_enroll_confidence: cfg.min_enroll_confidence,
        })
    }

    async fn extract(&self, capture: &Capture) -> Result<Extraction, SourceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ExtractRequest {
                jpeg: capture.as_bytes().to_vec(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| SourceError::Unavailable("pipeline thread exited".into()))?;
        reply_rx
            .await
            .map_err(|_| SourceError::Unavailable("pipeline thread exited".into()))?
    }
}

#[async_trait]
impl DescriptorSource for LocalSource {
    fn method(&self) -> &str {
        METHOD
    }

    async fn enroll(&self, capture: &Capture) -> Result<Artifact, SourceError> {
        let extraction = self.extract(capture).await?;
        if extraction.confidence < self.min_enroll_confidence {
            return Err(SourceError::Rejected(format!(
                "face detected with low confidence ({:.2}); improve lighting and face the camera",
                extraction.confidence
            )));
        }
        tracing::info!(confidence = extraction.confidence, "enrollment capture accepted");
        Ok(Artifact::Descriptor(extraction.descriptor))
    }

    async fn verify(&self, live: &Capture, enrolled: &Artifact) -> Result<Verdict, SourceError> {
        let stored = match enrolled {
            Artifact::Descriptor(d) => d,
            Artifact::Reference { .. } => {
                return Err(SourceError::Incompatible(
                    "stored artifact is a reference image; this backend compares descriptors".into(),
                ))
            }
        };

        let extraction = match self.extract(live).await {
            Ok(extraction) => extraction,
            Err(SourceError::NoFaceDetected) => return Ok(Verdict::no_face()),
            Err(e) => return Err(e),
        };

        let distance = extraction
            .descriptor
            .distance(stored)
            .map_err(|e| SourceError::Incompatible(e.to_string()))?;
        let tier = self.policy.classify(distance);
        tracing::debug!(distance, tier = %tier, "descriptor comparison");

        Ok(Verdict {
            matched: tier.is_match(),
            face_detected: true,
            tier,
            distance: Some(distance),
        })
    }
}

fn load_session(model_path: &str) -> Result<Session, SourceError> {
    if !Path::new(model_path).exists() {
        return Err(SourceError::ModelNotFound(model_path.to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = model_path,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded model"
    );

    Ok(session)
}

/// Decode, detect the single best face, crop it, and extract the
/// L2-normalized descriptor.
fn run_extract(
    detector: &mut Session,
    embedder: &mut Session,
    jpeg: &[u8],
) -> Result<Extraction, SourceError> {
    let gray = image::load_from_memory(jpeg)
        .map_err(|e| SourceError::ImageDecode(e.to_string()))?
        .to_luma8();

    let face = detect_best_face(detector, &gray)?.ok_or(SourceError::NoFaceDetected)?;
    tracing::debug!(score = face.score, "best face selected");

    let crop = crop_face(&gray, &face);
    let descriptor = embed(embedder, &crop)?;

    Ok(Extraction {
        descriptor,
        confidence: face.score,
    })
}

/// A detected face in normalized [0, 1] coordinates.
#[derive(Debug, Clone, Copy)]
struct FaceBox {
    score: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

fn detect_best_face(detector: &mut Session, gray: &GrayImage) -> Result<Option<FaceBox>, SourceError> {
    let resized = image::imageops::resize(
        gray,
        DETECT_INPUT_SIZE,
        DETECT_INPUT_SIZE,
        FilterType::Triangle,
    );
    let input = gray_to_tensor(&resized, DETECT_MEAN, DETECT_STD);

    let outputs = detector.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
    let (_, rows) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| SourceError::Inference(format!("detector output: {e}")))?;

    Ok(decode_best_face(rows, DETECT_SCORE_THRESHOLD))
}

/// Pick the highest-scoring row at or above the threshold.
fn decode_best_face(rows: &[f32], threshold: f32) -> Option<FaceBox> {
    let mut best: Option<FaceBox> = None;
    for row in rows.chunks_exact(DETECT_ROW_LEN) {
        let candidate = FaceBox {
            score: row[0],
            x1: row[1],
            y1: row[2],
            x2: row[3],
            y2: row[4],
        };
        if candidate.score < threshold {
            continue;
        }
        if best.map_or(true, |b| candidate.score > b.score) {
            best = Some(candidate);
        }
    }
    best
}

/// Crop the detected box out of the source image and scale it to the
/// embedder's input size. Coordinates are clamped; a degenerate box
/// falls back to the full frame.
fn crop_face(gray: &GrayImage, face: &FaceBox) -> GrayImage {
    let (w, h) = (gray.width() as f32, gray.height() as f32);
    let x1 = (face.x1.clamp(0.0, 1.0) * w).floor() as u32;
    let y1 = (face.y1.clamp(0.0, 1.0) * h).floor() as u32;
    let x2 = (face.x2.clamp(0.0, 1.0) * w).ceil() as u32;
    let y2 = (face.y2.clamp(0.0, 1.0) * h).ceil() as u32;

    let crop = if x2 > x1 && y2 > y1 {
        image::imageops::crop_imm(gray, x1, y1, x2 - x1, y2 - y1).to_image()
    } else {
        gray.clone()
    };

    image::imageops::resize(&crop, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE, FilterType::Triangle)
}

fn embed(embedder: &mut Session, crop: &GrayImage) -> Result<Descriptor, SourceError> {
    let input = gray_to_tensor(crop, EMBED_MEAN, EMBED_STD);

    let outputs = embedder.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
    let (_, raw) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| SourceError::Inference(format!("descriptor extraction: {e}")))?;

    if raw.len() != DESCRIPTOR_DIM {
        return Err(SourceError::Inference(format!(
            "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
            raw.len()
        )));
    }

    Ok(Descriptor::new(l2_normalize(raw.to_vec()), METHOD))
}

/// Grayscale image to a NCHW float tensor, replicating the single channel
/// into all three.
fn gray_to_tensor(img: &GrayImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));

    for (x, y, pixel) in img.enumerate_pixels() {
        let normalized = (pixel.0[0] as f32 - mean) / std;
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = normalized;
        tensor[[0, 1, y, x]] = normalized;
        tensor[[0, 2, y, x]] = normalized;
    }

    tensor
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
