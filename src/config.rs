use anyhow::{Context, Result};
use configparser::ini::Ini;
use serde::Serialize;
use std::env;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "radiology-serve.ini";

const MODEL_SECTION_PREFIX: &str = "model.";

const DEFAULT_FRAME_STRIDE: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(stride) => stride,
    None => unreachable!(),
};

/// 模型输入张量的维度排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`，Keras / Teachable Machine 导出的默认格式
    Nhwc,
    /// `[1, 3, H, W]`
    Nchw,
}

impl TensorLayout {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nhwc" => Some(Self::Nhwc),
            "nchw" => Some(Self::Nchw),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nhwc => "nhwc",
            Self::Nchw => "nchw",
        }
    }
}

/// 像素归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// `p / 127.5 - 1`，映射到 [-1, 1]
    MinusOneToOne,
    /// `p / 255`，映射到 [0, 1]
    ZeroToOne,
}

impl Normalization {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minus_one_to_one" | "-1..1" => Some(Self::MinusOneToOne),
            "zero_to_one" | "0..1" => Some(Self::ZeroToOne),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MinusOneToOne => "minus_one_to_one",
            Self::ZeroToOne => "zero_to_one",
        }
    }

    #[inline]
    pub fn apply(self, channel: u8) -> f32 {
        match self {
            Self::MinusOneToOne => channel as f32 / 127.5 - 1.0,
            Self::ZeroToOne => channel as f32 / 255.0,
        }
    }
}

/// 判断预测标签是否代表“正常/阴性”的规则
///
/// Teachable Machine 导出的 labels.txt 形如 `0 Normal`、`1 Pneumonia`，
/// 因此默认规则是前缀 `"0"`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalRule {
    /// 标签以该前缀开头即为正常
    Prefix(String),
    /// 标签完全等于列表中的某一项即为正常
    Labels(Vec<String>),
}

impl Default for NormalRule {
    fn default() -> Self {
        Self::Prefix("0".to_string())
    }
}

impl NormalRule {
    pub fn is_normal(&self, label: &str) -> bool {
        match self {
            Self::Prefix(prefix) => label.starts_with(prefix.as_str()),
            Self::Labels(labels) => labels.iter().any(|l| l == label),
        }
    }
}

/// 单个模型的配置
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    /// 模型 ID，同时是 `models/<id>/` 目录名
    pub id: String,
    /// 显示名称
    pub name: String,
    /// 权重文件名（相对模型目录）
    pub weights: String,
    /// 标签文件名（相对模型目录）
    pub labels: String,
    /// 正方形输入边长
    pub input_size: u32,
    pub layout: TensorLayout,
    pub normalization: Normalization,
    pub normal_rule: NormalRule,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            weights: "keras_model.onnx".to_string(),
            labels: "labels.txt".to_string(),
            input_size: 224,
            layout: TensorLayout::Nhwc,
            normalization: Normalization::MinusOneToOne,
            normal_rule: NormalRule::default(),
        }
    }

    pub fn model_dir(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(&self.id)
    }

    pub fn weights_path(&self, models_dir: &Path) -> PathBuf {
        self.model_dir(models_dir).join(&self.weights)
    }

    pub fn labels_path(&self, models_dir: &Path) -> PathBuf {
        self.model_dir(models_dir).join(&self.labels)
    }
}

/// 内置的四个模型
pub fn default_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("lung_pneu", "Lung Pneumonia"),
        ModelSpec::new("brain_stroke", "Brain Stroke"),
        ModelSpec::new("kidney_stone", "Kidney Stone"),
        ModelSpec::new("spine_fracture", "Spine Fracture"),
    ]
}

/// 上传文件与抽帧结果的工作目录
#[derive(Debug, Clone, PartialEq)]
pub struct StorageDirs {
    /// 上传的视频
    pub video_dir: PathBuf,
    /// 抽取的视频帧（通过 /frames 对外提供）
    pub frame_dir: PathBuf,
    /// 上传的图片（通过 /image_uploads 对外提供）
    pub image_dir: PathBuf,
}

impl Default for StorageDirs {
    fn default() -> Self {
        Self {
            video_dir: PathBuf::from("video_input"),
            frame_dir: PathBuf::from("frame_output"),
            image_dir: PathBuf::from("image_uploads"),
        }
    }
}

impl StorageDirs {
    /// 创建全部工作目录
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.video_dir, &self.frame_dir, &self.image_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("创建工作目录失败: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// 服务完整配置
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: String,
    pub models_dir: PathBuf,
    pub storage: StorageDirs,
    /// 视频抽帧步长（每隔多少帧取一帧）
    pub frame_stride: NonZeroUsize,
    /// 抽帧时是否做伪彩色映射
    pub colorize: bool,
    pub body_limit_mb: usize,
    /// 允许的 CORS 来源，为空时完全放开
    pub cors_origins: Vec<String>,
    /// 请求未指定模型时使用的模型
    pub default_model: String,
    pub log_level: String,
    pub models: Vec<ModelSpec>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            models_dir: PathBuf::from("models"),
            storage: StorageDirs::default(),
            frame_stride: DEFAULT_FRAME_STRIDE,
            colorize: false,
            body_limit_mb: 200,
            cors_origins: Vec::new(),
            default_model: "lung_pneu".to_string(),
            log_level: "info".to_string(),
            models: default_models(),
        }
    }
}

impl ServiceConfig {
    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_mb.saturating_mul(1024 * 1024)
    }
}

/// 单个配置来源（命令行、环境变量或配置文件）读到的值
#[derive(Debug, Clone, Default)]
pub struct ConfigLayer {
    pub bind: Option<String>,
    pub models_dir: Option<PathBuf>,
    pub video_dir: Option<PathBuf>,
    pub frame_dir: Option<PathBuf>,
    pub image_dir: Option<PathBuf>,
    pub frame_stride: Option<usize>,
    pub colorize: Option<bool>,
    pub body_limit_mb: Option<usize>,
    pub cors_origins: Option<Vec<String>>,
    pub default_model: Option<String>,
    pub log_level: Option<String>,
    pub models: Option<Vec<ModelSpec>>,
}

impl ConfigLayer {
    /// 以 `self` 为高优先级，与低优先级的 `lower` 合并
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            bind: self.bind.or(lower.bind),
            models_dir: self.models_dir.or(lower.models_dir),
            video_dir: self.video_dir.or(lower.video_dir),
            frame_dir: self.frame_dir.or(lower.frame_dir),
            image_dir: self.image_dir.or(lower.image_dir),
            frame_stride: self.frame_stride.or(lower.frame_stride),
            colorize: self.colorize.or(lower.colorize),
            body_limit_mb: self.body_limit_mb.or(lower.body_limit_mb),
            cors_origins: self.cors_origins.or(lower.cors_origins),
            default_model: self.default_model.or(lower.default_model),
            log_level: self.log_level.or(lower.log_level),
            models: self.models.or(lower.models),
        }
    }

    /// 补全默认值，得到最终配置
    pub fn resolve(self) -> Result<ServiceConfig> {
        let defaults = ServiceConfig::default();

        let frame_stride = match self.frame_stride {
            Some(stride) => NonZeroUsize::new(stride)
                .ok_or_else(|| anyhow::anyhow!("抽帧步长必须为正整数"))?,
            None => defaults.frame_stride,
        };

        let models = self.models.unwrap_or(defaults.models);
        if models.is_empty() {
            anyhow::bail!("没有配置任何模型");
        }

        Ok(ServiceConfig {
            bind: self.bind.unwrap_or(defaults.bind),
            models_dir: self.models_dir.unwrap_or(defaults.models_dir),
            storage: StorageDirs {
                video_dir: self.video_dir.unwrap_or(defaults.storage.video_dir),
                frame_dir: self.frame_dir.unwrap_or(defaults.storage.frame_dir),
                image_dir: self.image_dir.unwrap_or(defaults.storage.image_dir),
            },
            frame_stride,
            colorize: self.colorize.unwrap_or(defaults.colorize),
            body_limit_mb: self.body_limit_mb.unwrap_or(defaults.body_limit_mb),
            cors_origins: self.cors_origins.unwrap_or(defaults.cors_origins),
            default_model: self.default_model.unwrap_or(defaults.default_model),
            log_level: self.log_level.unwrap_or(defaults.log_level),
            models,
        })
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    ///
    /// 显式指定的配置文件读取失败会返回错误；默认位置的配置文件不存在时忽略。
    pub fn load_config(config_file: Option<&Path>, cli: ConfigLayer) -> Result<ServiceConfig> {
        let file_layer = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations()?.unwrap_or_default(),
        };

        cli.or(Self::load_from_env()).or(file_layer).resolve()
    }

    /// 从环境变量加载配置
    pub fn load_from_env() -> ConfigLayer {
        ConfigLayer {
            bind: env::var("RADIOLOGY_BIND").ok(),
            models_dir: env::var_os("RADIOLOGY_MODELS_DIR").map(PathBuf::from),
            video_dir: env::var_os("RADIOLOGY_VIDEO_DIR").map(PathBuf::from),
            frame_dir: env::var_os("RADIOLOGY_FRAME_DIR").map(PathBuf::from),
            image_dir: env::var_os("RADIOLOGY_IMAGE_DIR").map(PathBuf::from),
            frame_stride: env::var("RADIOLOGY_FRAME_STRIDE")
                .ok()
                .and_then(|v| v.parse().ok()),
            colorize: env::var("RADIOLOGY_COLORIZE")
                .ok()
                .and_then(|v| parse_bool(&v)),
            body_limit_mb: env::var("RADIOLOGY_BODY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse().ok()),
            cors_origins: env::var("RADIOLOGY_CORS_ORIGINS")
                .ok()
                .map(|v| split_list(&v)),
            default_model: env::var("RADIOLOGY_DEFAULT_MODEL").ok(),
            log_level: env::var("LOG_LEVEL").ok(),
            models: None,
        }
    }

    /// 从INI配置文件加载配置
    pub fn load_from_file(config_path: &Path) -> Result<ConfigLayer> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut ini = Ini::new_cs();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        Self::from_ini(&ini)
            .with_context(|| format!("解析配置文件失败: {}", config_path.display()))
    }

    /// 从已解析的 INI 内容提取配置
    pub fn from_ini(ini: &Ini) -> Result<ConfigLayer> {
        let get = |section: &str, key: &str| ini.get(section, key).filter(|v| !v.trim().is_empty());

        let models = Self::models_from_ini(ini)?;

        Ok(ConfigLayer {
            bind: get("server", "bind"),
            models_dir: get("storage", "models_dir").map(PathBuf::from),
            video_dir: get("storage", "video_dir").map(PathBuf::from),
            frame_dir: get("storage", "frame_dir").map(PathBuf::from),
            image_dir: get("storage", "image_dir").map(PathBuf::from),
            frame_stride: get("video", "stride").and_then(|v| v.trim().parse().ok()),
            colorize: get("video", "colorize").and_then(|v| parse_bool(&v)),
            body_limit_mb: get("server", "body_limit_mb").and_then(|v| v.trim().parse().ok()),
            cors_origins: get("server", "cors_origins").map(|v| split_list(&v)),
            default_model: get("server", "default_model"),
            log_level: get("logging", "level"),
            models: if models.is_empty() { None } else { Some(models) },
        })
    }

    /// 读取所有 `[model.<id>]` 节，按文件中出现的顺序返回
    fn models_from_ini(ini: &Ini) -> Result<Vec<ModelSpec>> {
        let mut models = Vec::new();

        for section in ini.sections() {
            let Some(id) = section.strip_prefix(MODEL_SECTION_PREFIX) else {
                continue;
            };
            let id = id.trim();
            if id.is_empty() {
                anyhow::bail!("模型节缺少 ID: [{}]", section);
            }

            let get = |key: &str| ini.get(&section, key).filter(|v| !v.trim().is_empty());
            let mut spec = ModelSpec::new(id, get("name").unwrap_or_else(|| id.to_string()));

            if let Some(weights) = get("weights") {
                spec.weights = weights;
            }
            if let Some(labels) = get("labels") {
                spec.labels = labels;
            }
            if let Some(size) = get("input_size") {
                spec.input_size = size
                    .trim()
                    .parse()
                    .ok()
                    .filter(|s: &u32| *s > 0)
                    .ok_or_else(|| anyhow::anyhow!("[{}] input_size 无效: {}", section, size))?;
            }
            if let Some(layout) = get("layout") {
                spec.layout = TensorLayout::parse(&layout)
                    .ok_or_else(|| anyhow::anyhow!("[{}] layout 无效: {}", section, layout))?;
            }
            if let Some(norm) = get("normalization") {
                spec.normalization = Normalization::parse(&norm)
                    .ok_or_else(|| anyhow::anyhow!("[{}] normalization 无效: {}", section, norm))?;
            }
            // normal_labels 比 normal_prefix 更具体，两者同时存在时以前者为准
            if let Some(labels) = get("normal_labels") {
                spec.normal_rule = NormalRule::Labels(split_list(&labels));
            } else if let Some(prefix) = get("normal_prefix") {
                spec.normal_rule = NormalRule::Prefix(prefix.trim().to_string());
            }

            models.push(spec);
        }

        Ok(models)
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<Option<ConfigLayer>> {
        let mut candidates = vec![
            // 1. 当前目录
            PathBuf::from(DEFAULT_CONFIG_FILE),
            // 2. 当前目录的隐藏文件
            PathBuf::from(format!(".{}", DEFAULT_CONFIG_FILE)),
        ];
        // 3. 用户主目录
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(format!(".{}", DEFAULT_CONFIG_FILE)));
        }
        // 4. /etc
        candidates.push(PathBuf::from("/etc").join(DEFAULT_CONFIG_FILE));

        match candidates.iter().find(|p| p.exists()) {
            Some(path) => Self::load_from_file(path).map(Some),
            None => Ok(None),
        }
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = ServiceConfig::default();
        let mut ini = Ini::new_cs();
        let path_str = |p: &Path| Some(p.to_string_lossy().to_string());

        ini.set("server", "bind", Some(defaults.bind.clone()));
        ini.set("server", "body_limit_mb", Some(defaults.body_limit_mb.to_string()));
        ini.set("server", "cors_origins", Some(String::new()));
        ini.set("server", "default_model", Some(defaults.default_model.clone()));
        ini.set("storage", "models_dir", path_str(&defaults.models_dir));
        ini.set("storage", "video_dir", path_str(&defaults.storage.video_dir));
        ini.set("storage", "frame_dir", path_str(&defaults.storage.frame_dir));
        ini.set("storage", "image_dir", path_str(&defaults.storage.image_dir));
        ini.set("video", "stride", Some(defaults.frame_stride.to_string()));
        ini.set("video", "colorize", Some(defaults.colorize.to_string()));
        ini.set("logging", "level", Some(defaults.log_level.clone()));

        for model in &defaults.models {
            let section = format!("{}{}", MODEL_SECTION_PREFIX, model.id);
            ini.set(&section, "name", Some(model.name.clone()));
            ini.set(&section, "weights", Some(model.weights.clone()));
            ini.set(&section, "labels", Some(model.labels.clone()));
            ini.set(&section, "input_size", Some(model.input_size.to_string()));
            ini.set(&section, "layout", Some(model.layout.as_str().to_string()));
            ini.set(&section, "normalization", Some(model.normalization.as_str().to_string()));
            if let NormalRule::Prefix(prefix) = &model.normal_rule {
                ini.set(&section, "normal_prefix", Some(prefix.clone()));
            }
        }

        ini.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
