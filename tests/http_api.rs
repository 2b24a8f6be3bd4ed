use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use radiology_serve::config::{ModelSpec, NormalRule, ServiceConfig, StorageDirs};
use radiology_serve::{router, AppState, Classifier, InputTensor, ModelEntry, ModelRegistry};
use serde_json::Value;
use std::io::Cursor;
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "radiology-test-boundary";

/// 输入越亮，第二个类别的概率越高
struct BrightnessClassifier;

impl Classifier for BrightnessClassifier {
    fn classify(&self, input: InputTensor) -> anyhow::Result<Vec<f32>> {
        let q = ((input.mean().unwrap_or(0.0) + 1.0) / 2.0).clamp(0.0, 1.0);
        Ok(vec![1.0 - q, q])
    }
}

struct TestApp {
    _dir: tempfile::TempDir,
    storage: StorageDirs,
    app: axum::Router,
}

fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageDirs {
        video_dir: dir.path().join("video_input"),
        frame_dir: dir.path().join("frame_output"),
        image_dir: dir.path().join("image_uploads"),
    };
    storage.ensure().unwrap();

    let mut brain = ModelSpec::new("brain_stroke", "Brain Stroke");
    brain.normal_rule = NormalRule::Labels(vec!["Healthy".to_string()]);

    let registry = ModelRegistry::from_entries([
        ModelEntry::new(
            ModelSpec::new("lung_pneu", "Lung Pneumonia"),
            vec!["0 Normal".to_string(), "1 Pneumonia".to_string()],
            Arc::new(BrightnessClassifier),
        ),
        ModelEntry::new(
            brain,
            vec!["Healthy".to_string(), "Stroke".to_string()],
            Arc::new(BrightnessClassifier),
        ),
    ]);

    let config = ServiceConfig {
        storage: storage.clone(),
        ..ServiceConfig::default()
    };

    TestApp {
        _dir: dir,
        storage,
        app: router(AppState::new(registry, config)),
    }
}

fn png_bytes(value: u8) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([value, value, value])))
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
        .unwrap();
    buf
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n", name, value).as_bytes(),
                );
            }
            Part::File(name, file_name, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, file_name
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn post_multipart(app: &axum::Router, uri: &str, parts: &[Part<'_>]) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap();
    send(app, request).await
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn health_reports_loaded_models() {
    let t = test_app();
    let (status, body) = get_json(&t.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["models"], 2);
}

#[tokio::test]
async fn models_lists_exactly_loaded_entries() {
    let t = test_app();
    let (status, body) = get_json(&t.app, "/models").await;
    assert_eq!(status, StatusCode::OK);

    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["lung_pneu", "brain_stroke"]);
    assert_eq!(body[1]["labels"][0], "Healthy");
}

#[tokio::test]
async fn upload_image_returns_prediction_and_serves_file() {
    let t = test_app();
    let png = png_bytes(0);
    let (status, body) = post_multipart(
        &t.app,
        "/upload_image",
        &[Part::Text("model_id", "lung_pneu"), Part::File("file", "../chest.png", &png)],
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["model_id"], "lung_pneu");
    assert_eq!(body["filename"], "chest.png");
    assert_eq!(body["predicted_class"], "0 Normal");
    assert_eq!(body["is_normal"], true);

    let probs = body["predictions"].as_object().unwrap();
    let keys: Vec<&String> = probs.keys().collect();
    assert_eq!(keys, ["0 Normal", "1 Pneumonia"]);
    let total: f64 = probs.values().map(|v| v.as_f64().unwrap()).sum();
    assert!((total - 100.0).abs() < 1e-2);

    let url = body["image_url"].as_str().unwrap();
    assert!(url.starts_with("/image_uploads/") && url.ends_with("/chest.png"));

    let saved = t.storage.image_dir.join(url.trim_start_matches("/image_uploads/"));
    assert!(saved.is_file());

    let request = Request::builder().uri(url).body(Body::empty()).unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn upload_image_url_is_percent_encoded() {
    let t = test_app();
    let png = png_bytes(0);
    let (status, body) = post_multipart(
        &t.app,
        "/upload_image",
        &[Part::File("file", "chest x-ray #1.png", &png)],
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["filename"], "chest x-ray #1.png");
    let url = body["image_url"].as_str().unwrap();
    assert!(url.ends_with("/chest%20x-ray%20%231.png"), "{}", url);

    let request = Request::builder().uri(url).body(Body::empty()).unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn upload_image_without_extension_is_decoded() {
    let t = test_app();
    let png = png_bytes(255);
    let (status, body) = post_multipart(&t.app, "/upload_image", &[Part::File("file", "blob", &png)]).await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["filename"], "blob");
    assert_eq!(body["predicted_class"], "1 Pneumonia");
}

#[tokio::test]
async fn upload_image_uses_query_model_and_label_rule() {
    let t = test_app();
    let png = png_bytes(255);
    let (status, body) = post_multipart(
        &t.app,
        "/upload_image?model_id=brain_stroke",
        &[Part::File("file", "head.png", &png)],
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["model_id"], "brain_stroke");
    assert_eq!(body["predicted_class"], "Stroke");
    assert_eq!(body["is_normal"], false);
}

#[tokio::test]
async fn upload_image_unknown_model_is_not_found() {
    let t = test_app();
    let png = png_bytes(10);
    let (status, body) = post_multipart(
        &t.app,
        "/upload_image",
        &[Part::Text("model_id", "liver"), Part::File("file", "scan.png", &png)],
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "model_not_found");
}

#[tokio::test]
async fn upload_image_undecodable_file_is_unprocessable() {
    let t = test_app();
    let (status, body) = post_multipart(
        &t.app,
        "/upload_image",
        &[Part::File("file", "scan.png", b"definitely not a png")],
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "decode");
}

#[tokio::test]
async fn upload_image_without_file_is_bad_request() {
    let t = test_app();
    let (status, body) = post_multipart(&t.app, "/upload_image", &[Part::Text("model_id", "lung_pneu")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "bad_request");
}

#[tokio::test]
async fn upload_video_unknown_model_rejected_before_saving() {
    let t = test_app();
    let (status, body) = post_multipart(
        &t.app,
        "/upload_video",
        &[Part::Text("model_id", "liver"), Part::File("file", "clip.mp4", b"bytes")],
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "model_not_found");
    assert_eq!(std::fs::read_dir(&t.storage.video_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn upload_video_unreadable_file_gives_empty_results() {
    let t = test_app();
    let (status, body) = post_multipart(
        &t.app,
        "/upload_video",
        &[
            Part::Text("model_id", "lung_pneu"),
            Part::Text("stride", "10"),
            Part::File("file", "clip.mp4", b"not a video at all"),
        ],
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["results"].as_array().unwrap().len(), 0);
    assert_eq!(body["summary"]["total_frames"], 0);
}

#[tokio::test]
async fn upload_video_invalid_stride_is_bad_request() {
    let t = test_app();
    let (status, body) = post_multipart(
        &t.app,
        "/upload_video",
        &[Part::Text("stride", "0"), Part::File("file", "clip.mp4", b"bytes")],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "bad_request");
}
