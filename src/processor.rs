use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use crate::frame_extractor::{split_video_to_frames, ExtractOptions};
use crate::predictor::{file_name_of, predict_on_image, static_url, PredictionOutcome};
use crate::registry::ModelRegistry;

/// 视频逐帧推理的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VideoSummary {
    pub total_frames: usize,
    pub normal_frames: usize,
    pub abnormal_frames: usize,
    pub failed_frames: usize,
}

impl VideoSummary {
    pub fn from_outcomes(outcomes: &[PredictionOutcome]) -> Self {
        let mut summary = Self {
            total_frames: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                PredictionOutcome::Prediction(p) if p.is_normal => summary.normal_frames += 1,
                PredictionOutcome::Prediction(_) => summary.abnormal_frames += 1,
                PredictionOutcome::Failed(_) => summary.failed_frames += 1,
            }
        }
        summary
    }
}

/// `POST /upload_video` 的响应体
#[derive(Debug, Clone, Serialize)]
pub struct VideoAnalysis {
    pub results: Vec<PredictionOutcome>,
    pub summary: VideoSummary,
}

/// 对一组图片逐张推理
///
/// `url_prefix` 不为空时，为每个成功结果填上 `<url_prefix>/<文件名>`。
pub fn analyze_images(
    registry: &ModelRegistry,
    image_paths: &[PathBuf],
    model_id: &str,
    url_prefix: Option<&str>,
) -> Vec<PredictionOutcome> {
    image_paths
        .iter()
        .map(|path| {
            let result = predict_on_image(registry, path, model_id).map(|mut prediction| {
                prediction.image_url = url_prefix.map(|prefix| static_url(prefix, &prediction.filename));
                prediction
            });
            PredictionOutcome::from_result(result, path)
        })
        .collect()
}

/// 视频抽帧后逐帧推理
pub fn analyze_video(
    registry: &ModelRegistry,
    video_path: &Path,
    frame_dir: &Path,
    model_id: &str,
    options: ExtractOptions,
    url_prefix: Option<&str>,
) -> Result<VideoAnalysis> {
    let total_start = Instant::now();
    info!("🎬 [视频分析] 开始处理: {} (模型 {})", video_path.display(), model_id);

    let extract_start = Instant::now();
    let frames = split_video_to_frames(video_path, frame_dir, options)
        .with_context(|| format!("视频抽帧失败: {}", video_path.display()))?;
    let extract_secs = extract_start.elapsed().as_secs_f64();

    let predict_start = Instant::now();
    let results = analyze_images(registry, &frames, model_id, url_prefix);
    let predict_secs = predict_start.elapsed().as_secs_f64();

    let summary = VideoSummary::from_outcomes(&results);
    info!(
        "✅ [视频分析] 完成: {} 帧 (正常 {}, 异常 {}, 失败 {}) | 抽帧 {:.2}秒, 推理 {:.2}秒, 总计 {:.2}秒",
        summary.total_frames,
        summary.normal_frames,
        summary.abnormal_frames,
        summary.failed_frames,
        extract_secs,
        predict_secs,
        total_start.elapsed().as_secs_f64()
    );

    Ok(VideoAnalysis { results, summary })
}

/// 目录下所有 png/jpg/jpeg 图片，按文件名排序
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("无法读取目录: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_image_file(path))
        .collect();
    images.sort_by_key(|path| file_name_of(path));
    Ok(images)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
        .unwrap_or(false)
}
