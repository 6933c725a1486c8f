/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : 层计算过程中的错误类型。
 *                 配置错误、形状不一致、不可微输入的梯度请求都在发现时立即返回，
 *                 数值边界情况（零方差、零计数、零有效标签）不属于错误，由各层自行兜底。
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayerError {
    /// 参数非法或相互冲突（如为批归一化统计量配置了非零学习率）
    #[error("配置错误：{0}")]
    Configuration(String),

    /// 输入形状与已配置的通道数/标签数不一致
    #[error("形状不一致：期望{expected:?}，实际为{got:?}（{message}）")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
        message: String,
    },

    /// 对结构上不可微的输入（如损失层的标签）请求了梯度
    #[error("{layer_type}层无法向第{bottom_index}个输入反向传播梯度")]
    UnsupportedGradient {
        layer_type: &'static str,
        bottom_index: usize,
    },

    #[error("标签值{label}超出类别范围[0, {num_classes})")]
    InvalidLabel { label: i32, num_classes: usize },

    #[error("未知的层类型：{0}")]
    UnknownLayerType(String),

    #[error("矩阵视图构建失败：{0}")]
    MatrixView(#[from] ndarray::ShapeError),

    #[error("层参数解析失败：{0}")]
    Parse(#[from] serde_json::Error),
}

impl LayerError {
    pub(crate) fn shape_mismatch(expected: &[usize], got: &[usize], message: &str) -> Self {
        LayerError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
            message: message.to_string(),
        }
    }
}
