use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tract_onnx::prelude::*;
use tract_onnx::tract_hir::internal::DimLike;

use crate::config::{ModelSpec, TensorLayout};

/// 分类器的输入张量（batch 维固定为 1）
pub type InputTensor = tract_ndarray::Array4<f32>;

/// 一次前向推理：输入预处理好的张量，输出每个类别的概率
pub trait Classifier: Send + Sync {
    fn classify(&self, input: InputTensor) -> Result<Vec<f32>>;

    /// 模型静态可知的输出长度，用于加载时与标签数校验
    fn output_len(&self) -> Option<usize> {
        None
    }
}

/// 把权重文件加载为分类器
pub trait ModelBackend: Send + Sync {
    fn load(&self, spec: &ModelSpec, weights_path: &Path) -> Result<Arc<dyn Classifier>>;
}

/// 基于 tract 的 ONNX 后端
#[derive(Debug, Default, Clone, Copy)]
pub struct TractBackend;

impl ModelBackend for TractBackend {
    fn load(&self, spec: &ModelSpec, weights_path: &Path) -> Result<Arc<dyn Classifier>> {
        let size = spec.input_size as usize;
        let input_shape = match spec.layout {
            TensorLayout::Nhwc => [1, size, size, 3],
            TensorLayout::Nchw => [1, 3, size, size],
        };

        let model = tract_onnx::onnx()
            .model_for_path(weights_path)
            .with_context(|| format!("无法解析 ONNX 模型: {}", weights_path.display()))?
            .with_input_fact(0, f32::fact(input_shape).into())?
            .into_optimized()
            .context("模型优化失败")?;

        let output_len = model
            .output_fact(0)?
            .shape
            .last()
            .and_then(|dim| dim.to_usize().ok());

        let plan = model.into_runnable().context("无法生成执行计划")?;

        Ok(Arc::new(TractClassifier {
            plan,
            input_shape,
            output_len,
        }))
    }
}

pub struct TractClassifier {
    plan: SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>,
    input_shape: [usize; 4],
    output_len: Option<usize>,
}

impl Classifier for TractClassifier {
    fn classify(&self, input: InputTensor) -> Result<Vec<f32>> {
        if input.shape() != self.input_shape {
            anyhow::bail!(
                "输入张量形状不匹配: 期望 {:?}, 实际 {:?}",
                self.input_shape,
                input.shape()
            );
        }

        let outputs = self.plan.run(tvec!(input.into_tensor().into_tvalue()))?;
        let output = outputs.first().context("模型没有输出")?;
        let probs = output.to_array_view::<f32>()?;

        Ok(probs.iter().copied().collect())
    }

    fn output_len(&self) -> Option<usize> {
        self.output_len
    }
}
