use image::io::Reader as ImageReader;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use image::{imageops::FilterType, DynamicImage, ImageError, RgbImage};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

use crate::classifier::InputTensor;
use crate::config::{Normalization, TensorLayout};
use crate::registry::{ModelEntry, ModelRegistry};

/// 单张图片推理失败的原因
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("图片文件不存在: {}", .0.display())]
    ImageNotFound(PathBuf),

    #[error("模型不存在或未加载: {0}")]
    ModelNotFound(String),

    #[error("图片解码失败: {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("推理失败: {0}")]
    Inference(String),
}

impl PredictError {
    /// 对外稳定的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ImageNotFound(_) => "image_not_found",
            Self::ModelNotFound(_) => "model_not_found",
            Self::Decode { .. } => "decode",
            Self::Inference(_) => "inference",
        }
    }
}

/// 单个标签的概率（百分比）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: String,
    pub probability: f32,
}

/// 一次推理的结果
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub model_id: String,
    pub model_name: String,
    pub filename: String,
    pub predicted_class: String,
    /// 最高类别的概率，0-100
    pub confidence: f32,
    pub is_normal: bool,
    /// 按标签顺序序列化为 `{label: probability}`
    #[serde(serialize_with = "serialize_scores")]
    pub predictions: Vec<LabelScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl PredictionResult {
    pub fn probability_of(&self, label: &str) -> Option<f32> {
        self.predictions
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.probability)
    }
}

fn serialize_scores<S: Serializer>(scores: &[LabelScore], serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(scores.len()))?;
    for score in scores {
        map.serialize_entry(&score.label, &score.probability)?;
    }
    map.end()
}

/// 返回给客户端的错误对象
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub error: String,
    pub kind: String,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            filename: None,
            error: error.into(),
            kind: kind.into(),
        }
    }

    pub fn from_predict_error(err: &PredictError, filename: Option<String>) -> Self {
        Self {
            filename,
            error: err.to_string(),
            kind: err.kind().to_string(),
        }
    }
}

/// 单帧/单图的结果：成功的预测，或结构化的错误
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PredictionOutcome {
    Prediction(PredictionResult),
    Failed(ErrorBody),
}

impl PredictionOutcome {
    pub fn from_result(result: Result<PredictionResult, PredictError>, image_path: &Path) -> Self {
        match result {
            Ok(prediction) => Self::Prediction(prediction),
            Err(e) => Self::Failed(ErrorBody::from_predict_error(&e, Some(file_name_of(image_path)))),
        }
    }

    pub fn prediction(&self) -> Option<&PredictionResult> {
        match self {
            Self::Prediction(p) => Some(p),
            Self::Failed(_) => None,
        }
    }
}

/// 对一张图片运行指定模型
///
/// 所有失败都以 [`PredictError`] 返回，不会 panic；同一张图片重复调用结果一致。
pub fn predict_on_image(
    registry: &ModelRegistry,
    image_path: &Path,
    model_id: &str,
) -> Result<PredictionResult, PredictError> {
    let result = run_prediction(registry, image_path, model_id);
    if let Err(e) = &result {
        error!("❌ [推理] {} (模型 {}): {}", image_path.display(), model_id, e);
    }
    result
}

fn run_prediction(
    registry: &ModelRegistry,
    image_path: &Path,
    model_id: &str,
) -> Result<PredictionResult, PredictError> {
    if !image_path.exists() {
        return Err(PredictError::ImageNotFound(image_path.to_path_buf()));
    }

    let entry = registry
        .get(model_id)
        .ok_or_else(|| PredictError::ModelNotFound(model_id.to_string()))?;

    let image = decode_image(image_path).map_err(|source| PredictError::Decode {
        path: image_path.to_path_buf(),
        source,
    })?;

    let mut result = predict_with_entry(entry, &image)?;
    result.filename = file_name_of(image_path);

    debug!(
        "[推理] {} -> {} ({:.2}%)",
        result.filename, result.predicted_class, result.confidence
    );

    Ok(result)
}

/// 按文件内容识别格式，扩展名缺失或不符时也能解码
fn decode_image(path: &Path) -> Result<DynamicImage, ImageError> {
    ImageReader::open(path)?.with_guessed_format()?.decode()
}

/// 对已解码的图片运行模型，`filename` 留空由调用方填写
pub fn predict_with_entry(entry: &ModelEntry, image: &DynamicImage) -> Result<PredictionResult, PredictError> {
    let spec = entry.spec();
    let fitted = fit_square(image, spec.input_size);
    let input = image_to_tensor(&fitted, spec.layout, spec.normalization);

    let probs = entry
        .classifier()
        .classify(input)
        .map_err(|e| PredictError::Inference(format!("{:#}", e)))?;

    let labels = entry.labels();
    if probs.len() != labels.len() {
        return Err(PredictError::Inference(format!(
            "模型输出长度 ({}) 与标签数量 ({}) 不一致",
            probs.len(),
            labels.len()
        )));
    }

    let best = argmax(&probs)
        .ok_or_else(|| PredictError::Inference("模型输出为空或包含 NaN".to_string()))?;
    let predicted_class = labels[best].clone();

    Ok(PredictionResult {
        model_id: entry.id().to_string(),
        model_name: entry.name().to_string(),
        filename: String::new(),
        is_normal: entry.is_normal(&predicted_class),
        predicted_class,
        confidence: probs[best] * 100.0,
        predictions: labels
            .iter()
            .zip(&probs)
            .map(|(label, p)| LabelScore {
                label: label.clone(),
                probability: p * 100.0,
            })
            .collect(),
        image_url: None,
    })
}

/// 等比缩放到能覆盖 `size × size`，再居中裁剪（Lanczos3）
pub fn fit_square(image: &DynamicImage, size: u32) -> RgbImage {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    rgb.resize_to_fill(size, size, FilterType::Lanczos3).to_rgb8()
}

/// RGB 图片转为带 batch 维的 f32 张量
pub fn image_to_tensor(image: &RgbImage, layout: TensorLayout, normalization: Normalization) -> InputTensor {
    let (w, h) = (image.width() as usize, image.height() as usize);
    match layout {
        TensorLayout::Nhwc => InputTensor::from_shape_fn((1, h, w, 3), |(_, y, x, c)| {
            normalization.apply(image.get_pixel(x as u32, y as u32)[c])
        }),
        TensorLayout::Nchw => InputTensor::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
            normalization.apply(image.get_pixel(x as u32, y as u32)[c])
        }),
    }
}

/// 最大值的下标，相同时取第一个；空或含 NaN 时返回 None
fn argmax(values: &[f32]) -> Option<usize> {
    if values.iter().any(|v| v.is_nan()) {
        return None;
    }
    let mut best: Option<usize> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some(b) if v <= values[b] => {}
            _ => best = Some(i),
        }
    }
    best
}

/// 路径段中保留原样的字符：字母数字与 `-._~`
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// 静态文件 URL：`<prefix>/<编码后的文件名>`
pub fn static_url(prefix: &str, file_name: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        utf8_percent_encode(file_name, PATH_SEGMENT)
    )
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::config::{ModelSpec, NormalRule};
    use image::Rgb;
    use std::sync::Arc;

    /// 按输入均值给出两类概率：越亮越偏向第二类
    struct BrightnessClassifier;

    impl Classifier for BrightnessClassifier {
        fn classify(&self, input: InputTensor) -> anyhow::Result<Vec<f32>> {
            let mean = input.mean().unwrap_or(0.0);
            let q = ((mean + 1.0) / 2.0).clamp(0.0, 1.0);
            Ok(vec![1.0 - q, q])
        }
    }

    struct WrongLengthClassifier;

    impl Classifier for WrongLengthClassifier {
        fn classify(&self, _input: InputTensor) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.2, 0.3, 0.5])
        }
    }

    fn registry() -> ModelRegistry {
        let mut spine = ModelSpec::new("spine_fracture", "Spine Fracture");
        spine.normal_rule = NormalRule::Labels(vec!["Healthy".to_string()]);

        ModelRegistry::from_entries([
            ModelEntry::new(
                ModelSpec::new("lung_pneu", "Lung Pneumonia"),
                vec!["0 Normal".to_string(), "1 Pneumonia".to_string()],
                Arc::new(BrightnessClassifier),
            ),
            ModelEntry::new(
                spine,
                vec!["Healthy".to_string(), "Fracture".to_string()],
                Arc::new(BrightnessClassifier),
            ),
            ModelEntry::new(
                ModelSpec::new("kidney_stone", "Kidney Stone"),
                vec!["0 Normal".to_string(), "1 Stone".to_string()],
                Arc::new(WrongLengthClassifier),
            ),
        ])
    }

    fn write_image(dir: &Path, name: &str, value: u8) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(64, 48, Rgb([value, value, value]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_predict_bright_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "bright.png", 255);

        let result = predict_on_image(&registry(), &path, "lung_pneu").unwrap();
        assert_eq!(result.model_id, "lung_pneu");
        assert_eq!(result.model_name, "Lung Pneumonia");
        assert_eq!(result.filename, "bright.png");
        assert_eq!(result.predicted_class, "1 Pneumonia");
        assert!(!result.is_normal);
        assert!(result.confidence > 99.0);
        assert_eq!(result.predictions.len(), 2);
        assert!(result.probability_of("0 Normal").unwrap() < 1.0);
    }

    #[test]
    fn test_predict_dark_image_is_normal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "dark.png", 0);

        let result = predict_on_image(&registry(), &path, "lung_pneu").unwrap();
        assert_eq!(result.predicted_class, "0 Normal");
        assert!(result.is_normal);
    }

    #[test]
    fn test_normal_rule_is_per_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "dark.png", 10);

        let result = predict_on_image(&registry(), &path, "spine_fracture").unwrap();
        assert_eq!(result.predicted_class, "Healthy");
        assert!(result.is_normal);
    }

    #[test]
    fn test_predictions_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "mid.png", 180);
        let registry = registry();

        let first = predict_on_image(&registry, &path, "lung_pneu").unwrap();
        for _ in 0..3 {
            let again = predict_on_image(&registry, &path, "lung_pneu").unwrap();
            assert_eq!(again.predicted_class, first.predicted_class);
            assert_eq!(again.confidence, first.confidence);
            assert_eq!(again.predictions, first.predictions);
        }
    }

    #[test]
    fn test_unknown_model_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "scan.png", 100);

        let err = predict_on_image(&registry(), &path, "liver").unwrap_err();
        assert!(matches!(err, PredictError::ModelNotFound(ref id) if id == "liver"));
        assert_eq!(err.kind(), "model_not_found");
    }

    #[test]
    fn test_missing_image_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = predict_on_image(&registry(), &dir.path().join("nope.png"), "lung_pneu").unwrap_err();
        assert!(matches!(err, PredictError::ImageNotFound(_)));
    }

    #[test]
    fn test_corrupt_image_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.png");
        std::fs::write(&path, b"definitely not a png").unwrap();

        let err = predict_on_image(&registry(), &path, "lung_pneu").unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_format_guessed_from_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageOutputFormat::Png)
            .unwrap();

        for name in ["scan", "scan.jpg", "blob"] {
            let path = dir.path().join(name);
            std::fs::write(&path, &png).unwrap();

            let result = predict_on_image(&registry(), &path, "lung_pneu").unwrap();
            assert_eq!(result.filename, name);
            assert_eq!(result.predicted_class, "0 Normal");
        }
    }

    #[test]
    fn test_output_length_mismatch_is_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "scan.png", 100);

        let err = predict_on_image(&registry(), &path, "kidney_stone").unwrap_err();
        assert_eq!(err.kind(), "inference");
    }

    #[test]
    fn test_predictions_serialize_in_label_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "scan.png", 255);
        let result = predict_on_image(&registry(), &path, "spine_fracture").unwrap();

        let json = serde_json::to_string(&result).unwrap();
        let healthy = json.find("\"Healthy\"").unwrap();
        let fracture = json.find("\"Fracture\":").unwrap();
        assert!(healthy < fracture);
        assert!(!json.contains("image_url"));
    }

    #[test]
    fn test_fit_square_and_tensor_shape() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 100, Rgb([255, 0, 0])));
        let fitted = fit_square(&image, 224);
        assert_eq!(fitted.dimensions(), (224, 224));

        let nhwc = image_to_tensor(&fitted, TensorLayout::Nhwc, Normalization::MinusOneToOne);
        assert_eq!(nhwc.shape(), &[1, 224, 224, 3]);
        assert!((nhwc[[0, 112, 112, 0]] - 1.0).abs() < 1e-2);
        assert!((nhwc[[0, 112, 112, 1]] + 1.0).abs() < 1e-2);

        let nchw = image_to_tensor(&fitted, TensorLayout::Nchw, Normalization::ZeroToOne);
        assert_eq!(nchw.shape(), &[1, 3, 224, 224]);
        assert!((nchw[[0, 0, 10, 10]] - 1.0).abs() < 1e-2);
        assert!(nchw[[0, 2, 10, 10]].abs() < 1e-2);
    }

    #[test]
    fn test_static_url_encodes_file_name() {
        assert_eq!(static_url("/frames/abc", "frame_00000.png"), "/frames/abc/frame_00000.png");
        assert_eq!(
            static_url("/image_uploads/abc/", "chest x-ray #2?.png"),
            "/image_uploads/abc/chest%20x-ray%20%232%3F.png"
        );
        assert_eq!(static_url("/image_uploads/abc", "100%.jpg"), "/image_uploads/abc/100%25.jpg");
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some(1));
        assert_eq!(argmax(&[0.5, 0.5]), Some(0));
        assert_eq!(argmax(&[]), None);
        assert_eq!(argmax(&[0.1, f32::NAN]), None);
    }
}
