use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::classifier::{Classifier, ModelBackend};
use crate::config::ModelSpec;

/// 单个模型加载失败的原因
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("模型文件不存在: {}", .0.display())]
    MissingWeights(PathBuf),

    #[error("标签文件不存在: {}", .0.display())]
    MissingLabels(PathBuf),

    #[error("读取标签文件失败: {}: {source}", .path.display())]
    ReadLabels {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("标签文件为空: {}", .0.display())]
    NoLabels(PathBuf),

    #[error("加载模型失败: {}: {message}", .path.display())]
    Backend { path: PathBuf, message: String },

    #[error("标签数量 ({labels}) 与模型输出长度 ({outputs}) 不一致")]
    LabelCountMismatch { labels: usize, outputs: usize },

    #[error("模型 ID 重复: {0}")]
    DuplicateId(String),
}

/// 已加载的模型：配置、标签和推理句柄，启动后不可变
pub struct ModelEntry {
    spec: ModelSpec,
    labels: Vec<String>,
    classifier: Arc<dyn Classifier>,
}

impl ModelEntry {
    pub fn new(spec: ModelSpec, labels: Vec<String>, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            spec,
            labels,
            classifier,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// 标签顺序即模型输出下标顺序
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    pub fn is_normal(&self, label: &str) -> bool {
        self.spec.normal_rule.is_normal(label)
    }

    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            labels: self.labels.clone(),
        }
    }
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("id", &self.spec.id)
            .field("name", &self.spec.name)
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

/// `GET /models` 返回的模型描述
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub labels: Vec<String>,
}

/// 单个模型的加载结果
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded { labels: usize },
    Failed(LoadError),
}

#[derive(Debug)]
pub struct LoadReport {
    pub id: String,
    pub outcome: LoadOutcome,
}

impl LoadReport {
    pub fn is_loaded(&self) -> bool {
        matches!(self.outcome, LoadOutcome::Loaded { .. })
    }
}

/// 只读的模型注册表，启动时构建一次，之后以引用传给各个请求
#[derive(Debug, Default)]
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
    index: HashMap<String, usize>,
}

impl ModelRegistry {
    /// 按配置逐个加载模型；单个模型失败只记录，不影响其他模型
    pub fn load(
        specs: &[ModelSpec],
        models_dir: &Path,
        backend: &dyn ModelBackend,
    ) -> (Self, Vec<LoadReport>) {
        let mut registry = Self::default();
        let mut reports = Vec::with_capacity(specs.len());

        for spec in specs {
            let result = if registry.index.contains_key(&spec.id) {
                Err(LoadError::DuplicateId(spec.id.clone()))
            } else {
                Self::load_entry(spec, models_dir, backend)
            };

            let outcome = match result {
                Ok(entry) => {
                    info!(
                        "✅ [模型] {} ({}) 加载完成，{} 个类别: {:?}",
                        entry.id(),
                        entry.name(),
                        entry.labels().len(),
                        entry.labels()
                    );
                    let labels = entry.labels().len();
                    registry.insert(entry);
                    LoadOutcome::Loaded { labels }
                }
                Err(e) => {
                    warn!("⚠️  [模型] {} 加载失败，已跳过: {}", spec.id, e);
                    LoadOutcome::Failed(e)
                }
            };

            reports.push(LoadReport {
                id: spec.id.clone(),
                outcome,
            });
        }

        (registry, reports)
    }

    /// 直接由已构建的条目组成注册表，重复 ID 保留第一个
    pub fn from_entries(entries: impl IntoIterator<Item = ModelEntry>) -> Self {
        let mut registry = Self::default();
        for entry in entries {
            if !registry.index.contains_key(entry.id()) {
                registry.insert(entry);
            }
        }
        registry
    }

    fn insert(&mut self, entry: ModelEntry) {
        self.index.insert(entry.id().to_string(), self.entries.len());
        self.entries.push(entry);
    }

    fn load_entry(
        spec: &ModelSpec,
        models_dir: &Path,
        backend: &dyn ModelBackend,
    ) -> Result<ModelEntry, LoadError> {
        let weights_path = spec.weights_path(models_dir);
        let labels_path = spec.labels_path(models_dir);

        if !weights_path.is_file() {
            return Err(LoadError::MissingWeights(weights_path));
        }
        if !labels_path.is_file() {
            return Err(LoadError::MissingLabels(labels_path));
        }

        let labels = read_labels(&labels_path)?;

        let classifier = backend
            .load(spec, &weights_path)
            .map_err(|e| LoadError::Backend {
                path: weights_path.clone(),
                message: format!("{:#}", e),
            })?;

        if let Some(outputs) = classifier.output_len() {
            if outputs != labels.len() {
                return Err(LoadError::LabelCountMismatch {
                    labels: labels.len(),
                    outputs,
                });
            }
        }

        Ok(ModelEntry::new(spec.clone(), labels, classifier))
    }

    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// 已加载的模型 ID，按配置顺序
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id())
    }

    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.entries.iter().map(ModelEntry::descriptor).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 读取标签文件：每行一个标签，去掉首尾空白，跳过空行
pub fn read_labels(path: &Path) -> Result<Vec<String>, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::ReadLabels {
        path: path.to_path_buf(),
        source,
    })?;

    let labels: Vec<String> = content
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    if labels.is_empty() {
        return Err(LoadError::NoLabels(path.to_path_buf()));
    }

    Ok(labels)
}
