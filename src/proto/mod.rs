/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : 层参数（LayerParameter）及各层的专属参数。
 *                 字段缺省值与经典层参数定义一致，可由JSON反序列化得到。
 */

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::errors::LayerError;


/// 运行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    #[default]
    Train,
    Test,
}

/// 单个可学习参数的优化设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamSpec {
    pub name: String,
    /// 学习率倍数
    pub lr_mult: f32,
    /// 权重衰减倍数
    pub decay_mult: f32,
}

impl Default for ParamSpec {
    fn default() -> Self {
        ParamSpec {
            name: String::new(),
            lr_mult: 1.,
            decay_mult: 1.,
        }
    }
}

impl ParamSpec {
    /// 学习率固定为0的参数设置（即不参与梯度下降）
    pub fn frozen() -> Self {
        ParamSpec {
            lr_mult: 0.,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchNormParameter {
    /// 为`None`时：测试阶段使用全局统计量，训练阶段使用当前batch的统计量
    pub use_global_stats: Option<bool>,
    /// 滑动平均的衰减系数
    pub moving_average_fraction: f32,
    /// 加在方差上的小量，防止除以0
    pub eps: f32,
}

impl Default for BatchNormParameter {
    fn default() -> Self {
        BatchNormParameter {
            use_global_stats: None,
            moving_average_fraction: 0.999,
            eps: 1e-5,
        }
    }
}

/// 参数初始化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillerType {
    #[default]
    Constant,
    Uniform,
    Gaussian,
    Xavier,
    Msra,
}

/// xavier/msra初始化时方差的归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VarianceNorm {
    #[default]
    FanIn,
    FanOut,
    Average,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillerParameter {
    #[serde(rename = "type")]
    pub filler_type: FillerType,
    /// constant
    pub value: f32,
    /// uniform
    pub min: f32,
    pub max: f32,
    /// gaussian
    pub mean: f32,
    pub std: f32,
    /// xavier / msra
    pub variance_norm: VarianceNorm,
}

impl Default for FillerParameter {
    fn default() -> Self {
        FillerParameter {
            filler_type: FillerType::Constant,
            value: 0.,
            min: 0.,
            max: 1.,
            mean: 0.,
            std: 1.,
            variance_norm: VarianceNorm::FanIn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolutionParameter {
    /// 输出通道数
    pub num_output: usize,
    pub bias_term: bool,
    /// 以下三项的长度为1（所有空间轴共用）或等于空间轴数
    pub pad: Vec<usize>,
    pub kernel_size: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
    /// 仅适用于2个空间轴，与上面的列表写法互斥
    pub pad_h: Option<usize>,
    pub pad_w: Option<usize>,
    pub kernel_h: Option<usize>,
    pub kernel_w: Option<usize>,
    pub stride_h: Option<usize>,
    pub stride_w: Option<usize>,
    pub group: usize,
    pub weight_filler: FillerParameter,
    pub bias_filler: FillerParameter,
    /// 通道轴，其后的轴均为空间轴
    pub axis: i32,
    /// 即使只有2个空间轴也使用N维的im2col
    pub force_nd_im2col: bool,
}

impl Default for ConvolutionParameter {
    fn default() -> Self {
        ConvolutionParameter {
            num_output: 0,
            bias_term: true,
            pad: Vec::new(),
            kernel_size: Vec::new(),
            stride: Vec::new(),
            dilation: Vec::new(),
            pad_h: None,
            pad_w: None,
            kernel_h: None,
            kernel_w: None,
            stride_h: None,
            stride_w: None,
            group: 1,
            weight_filler: FillerParameter::default(),
            bias_filler: FillerParameter::default(),
            axis: 1,
            force_nd_im2col: false,
        }
    }
}

/// 损失的归一化方式，整数编码与经典定义一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NormalizationMode {
    /// 除以全部位置数（outer × inner）
    Full = 0,
    /// 除以未被忽略的位置数
    Valid = 1,
    /// 除以outer（通常即batch大小）
    BatchSize = 2,
    /// 不归一化
    None = 3,
}

impl NormalizationMode {
    pub fn from_code(code: i32) -> Result<Self, LayerError> {
        NormalizationMode::from_i32(code).ok_or_else(|| {
            LayerError::Configuration(format!("未知的损失归一化方式编码：{code}"))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossParameter {
    /// 该标签值的位置不计入损失，也不产生梯度
    pub ignore_label: Option<i32>,
    pub normalization: Option<NormalizationMode>,
    /// 已弃用：仅在`normalization`缺省时生效，true对应`Valid`，false对应`BatchSize`
    pub normalize: Option<bool>,
}

impl LossParameter {
    /// 实际生效的归一化方式
    pub fn normalization_mode(&self) -> NormalizationMode {
        match (self.normalization, self.normalize) {
            (Some(mode), _) => mode,
            (None, Some(true)) => NormalizationMode::Valid,
            (None, Some(false)) => NormalizationMode::BatchSize,
            (None, None) => NormalizationMode::Valid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftmaxParameter {
    pub axis: i32,
}

impl Default for SoftmaxParameter {
    fn default() -> Self {
        SoftmaxParameter { axis: 1 }
    }
}

/// 单个层的完整参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerParameter {
    pub name: String,
    /// 层类型，如"BatchNorm"、"Convolution"
    #[serde(rename = "type")]
    pub layer_type: String,
    pub phase: Phase,
    /// 每个输出的损失权重
    pub loss_weight: Vec<f32>,
    /// 每个可学习参数的优化设置
    pub param: Vec<ParamSpec>,
    pub batch_norm_param: BatchNormParameter,
    pub convolution_param: ConvolutionParameter,
    pub loss_param: LossParameter,
    pub softmax_param: SoftmaxParameter,
}

impl LayerParameter {
    pub fn new(layer_type: &str) -> Self {
        LayerParameter {
            layer_type: layer_type.to_string(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, LayerError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, LayerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
