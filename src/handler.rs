use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{HeaderValue, StatusCode},
    response::Json as ResponseJson,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::frame_extractor::ExtractOptions;
use crate::predictor::{predict_on_image, static_url, ErrorBody, PredictError, PredictionResult};
use crate::processor::{analyze_video, VideoAnalysis};
use crate::registry::{ModelDescriptor, ModelRegistry};

/// 路由共享状态：启动时构建，之后只读
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub config: Arc<ServiceConfig>,
}

impl AppState {
    pub fn new(registry: ModelRegistry, config: ServiceConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
        }
    }
}

pub type ApiError = (StatusCode, ResponseJson<ErrorBody>);

fn api_error(status: StatusCode, kind: &str, message: impl Into<String>) -> ApiError {
    (status, ResponseJson(ErrorBody::new(kind, message)))
}

fn internal_error(message: impl Into<String>) -> ApiError {
    let message = message.into();
    error!("❌ [HTTP] {}", message);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

fn predict_error_response(err: &PredictError, filename: Option<String>) -> ApiError {
    let status = match err {
        PredictError::ImageNotFound(_) | PredictError::ModelNotFound(_) => StatusCode::NOT_FOUND,
        PredictError::Decode { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PredictError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, ResponseJson(ErrorBody::from_predict_error(err, filename)))
}

/// 构建完整路由：API、静态文件目录与 CORS
pub fn router(state: AppState) -> Router {
    let config = state.config.clone();

    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/models", get(list_models))
        .route("/upload_image", post(upload_image))
        .route("/upload_video", post(upload_video))
        .nest_service("/frames", ServeDir::new(&config.storage.frame_dir))
        .nest_service("/image_uploads", ServeDir::new(&config.storage.image_dir))
        .layer(DefaultBodyLimit::max(config.body_limit_bytes()))
        .layer(cors_layer(&config.cors_origins))
        .with_state(state)
}

/// 没有配置来源时完全放开；否则只允许列出的来源，并允许携带凭证
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("⚠️  [HTTP] 忽略无效的 CORS 来源: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub models: usize,
}

/// 健康检查 Handler
pub async fn health_check(State(state): State<AppState>) -> ResponseJson<HealthResponse> {
    ResponseJson(HealthResponse {
        status: "ok",
        models: state.registry.len(),
    })
}

/// 列出启动时成功加载的模型
pub async fn list_models(State(state): State<AppState>) -> ResponseJson<Vec<ModelDescriptor>> {
    ResponseJson(state.registry.descriptors())
}

/// 上传请求的查询参数，multipart 中的同名字段优先
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub model_id: Option<String>,
}

/// 解析后的 multipart 表单
#[derive(Debug, Default)]
struct UploadForm {
    file_name: Option<String>,
    data: Option<Bytes>,
    model_id: Option<String>,
    stride: Option<String>,
    colorize: Option<String>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let bad_request = |e: axum::extract::multipart::MultipartError| {
        api_error(StatusCode::BAD_REQUEST, "bad_request", format!("解析表单失败: {}", e))
    };

    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                form.file_name = field.file_name().and_then(sanitize_file_name);
                form.data = Some(field.bytes().await.map_err(bad_request)?);
            }
            "model_id" => form.model_id = Some(field.text().await.map_err(bad_request)?.trim().to_string()),
            "stride" => form.stride = Some(field.text().await.map_err(bad_request)?),
            "colorize" => form.colorize = Some(field.text().await.map_err(bad_request)?),
            _ => {}
        }
    }
    Ok(form)
}

/// 只保留文件名最后一段，防止路径穿越
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

/// 表单 > 查询参数 > 默认模型
fn resolve_model_id(form: &UploadForm, query: &UploadQuery, config: &ServiceConfig) -> String {
    form.model_id
        .clone()
        .filter(|id| !id.is_empty())
        .or_else(|| query.model_id.clone().filter(|id| !id.is_empty()))
        .unwrap_or_else(|| config.default_model.clone())
}

/// 把上传内容写入 `<base>/<request_id>/<file_name>`
async fn save_upload(base: &Path, request_id: &str, file_name: &str, data: &[u8]) -> Result<PathBuf, ApiError> {
    let dir = base.join(request_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| internal_error(format!("创建上传目录失败: {}: {}", dir.display(), e)))?;

    let path = dir.join(file_name);
    tokio::fs::write(&path, data)
        .await
        .map_err(|e| internal_error(format!("保存上传文件失败: {}: {}", path.display(), e)))?;

    Ok(path)
}

fn take_file(form: &mut UploadForm, fallback_name: &str) -> Result<(String, Bytes), ApiError> {
    let data = form
        .data
        .take()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "bad_request", "没有上传文件"))?;
    let file_name = form.file_name.take().unwrap_or_else(|| fallback_name.to_string());
    Ok((file_name, data))
}

/// 上传单张图片并推理
pub async fn upload_image(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    multipart: Multipart,
) -> Result<ResponseJson<PredictionResult>, ApiError> {
    let mut form = read_upload_form(multipart).await?;
    let model_id = resolve_model_id(&form, &query, &state.config);
    let (file_name, data) = take_file(&mut form, "image.png")?;

    let request_id = uuid::Uuid::new_v4().to_string();
    let image_path = save_upload(&state.config.storage.image_dir, &request_id, &file_name, &data).await?;
    info!("📥 [HTTP] 收到图片 {} ({} 字节)，模型 {}", file_name, data.len(), model_id);

    let registry = state.registry.clone();
    let path = image_path.clone();
    let id = model_id.clone();
    let result = tokio::task::spawn_blocking(move || predict_on_image(&registry, &path, &id))
        .await
        .map_err(|e| internal_error(format!("推理任务异常退出: {}", e)))?;

    match result {
        Ok(mut prediction) => {
            prediction.image_url = Some(static_url(&format!("/image_uploads/{}", request_id), &prediction.filename));
            Ok(ResponseJson(prediction))
        }
        Err(e) => Err(predict_error_response(&e, Some(file_name))),
    }
}

/// 上传视频，抽帧后逐帧推理
pub async fn upload_video(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    multipart: Multipart,
) -> Result<ResponseJson<VideoAnalysis>, ApiError> {
    let mut form = read_upload_form(multipart).await?;
    let model_id = resolve_model_id(&form, &query, &state.config);

    if !state.registry.contains(&model_id) {
        return Err(predict_error_response(&PredictError::ModelNotFound(model_id), None));
    }

    let options = extract_options(&form, &state.config)?;
    let (file_name, data) = take_file(&mut form, "video.mp4")?;

    let request_id = uuid::Uuid::new_v4().to_string();
    let video_path = save_upload(&state.config.storage.video_dir, &request_id, &file_name, &data).await?;
    let frame_dir = state.config.storage.frame_dir.join(&request_id);
    info!(
        "📥 [HTTP] 收到视频 {} ({} 字节)，模型 {}，步长 {}，伪彩色 {}",
        file_name,
        data.len(),
        model_id,
        options.stride,
        options.colorize
    );

    let registry = state.registry.clone();
    let url_prefix = format!("/frames/{}", request_id);
    let analysis = tokio::task::spawn_blocking(move || {
        analyze_video(&registry, &video_path, &frame_dir, &model_id, options, Some(&url_prefix))
    })
    .await
    .map_err(|e| internal_error(format!("视频处理任务异常退出: {}", e)))?
    .map_err(|e| internal_error(format!("处理视频失败: {:#}", e)))?;

    Ok(ResponseJson(analysis))
}

/// 表单中的 stride / colorize 覆盖配置默认值
fn extract_options(form: &UploadForm, config: &ServiceConfig) -> Result<ExtractOptions, ApiError> {
    let stride = match form.stride.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .and_then(std::num::NonZeroUsize::new)
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "bad_request", format!("stride 必须为正整数: {}", raw)))?,
        None => config.frame_stride,
    };

    let colorize = match form.colorize.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
        Some(v) if v == "true" || v == "1" || v == "yes" || v == "on" => true,
        Some(v) if v == "false" || v == "0" || v == "no" || v == "off" || v.is_empty() => false,
        Some(v) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "bad_request",
                format!("colorize 必须为布尔值: {}", v),
            ))
        }
        None => config.colorize,
    };

    Ok(ExtractOptions { stride, colorize })
}
