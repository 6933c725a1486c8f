/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : 层的统一接口与注册表。
 *                 每个层的生命周期：`setup`一次 → 输入形状变化时`reshape` → 由外部交替调用`forward`/`backward`。
 *                 各层只通过`SharedBlob`读写输入（bottom）与输出（top），参数blob由层自身持有。
 */

mod base_conv;
mod batch_norm;
mod conv;
mod softmax;
mod softmax_loss;

pub use batch_norm::BatchNormLayer;
pub use conv::ConvolutionLayer;
pub use softmax::SoftmaxLayer;
pub use softmax_loss::SoftmaxWithLossLayer;

use enum_dispatch::enum_dispatch;

use crate::blob::SharedBlob;
use crate::errors::LayerError;
use crate::math;
use crate::proto::LayerParameter;

#[cfg(test)]
mod tests;

/// 所有层共有的状态
#[derive(Debug, Clone, Default)]
pub struct LayerBase {
    pub(crate) layer_param: LayerParameter,
    /// 可学习参数（或统计量）blob
    pub(crate) blobs: Vec<SharedBlob>,
    /// 每个参数blob是否需要计算梯度
    pub(crate) param_propagate_down: Vec<bool>,
    /// 每个输出的损失权重，非0表示该输出是损失
    pub(crate) loss: Vec<f32>,
}

impl LayerBase {
    pub fn new(layer_param: LayerParameter) -> Self {
        LayerBase {
            layer_param,
            ..Default::default()
        }
    }
}

/*↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓层（Layer）特性↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓*/
#[enum_dispatch]
#[derive(Debug)]
pub enum LayerEnum {
    BatchNorm(BatchNormLayer),
    Convolution(ConvolutionLayer),
    Softmax(SoftmaxLayer),
    SoftmaxWithLoss(SoftmaxWithLossLayer),
}

#[enum_dispatch(LayerEnum)]
pub trait Layer {
    fn base(&self) -> &LayerBase;
    fn base_mut(&mut self) -> &mut LayerBase;
    /// 层类型名，与注册表中的键一致
    fn layer_type(&self) -> &'static str;

    /*↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓需各层实现↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓*/
    /// 层专属的初始化（读取参数、创建参数blob）
    fn layer_setup(&mut self, bottom: &[SharedBlob], top: &[SharedBlob])
    -> Result<(), LayerError>;
    /// 根据输入形状调整输出及内部缓冲区的形状
    fn reshape(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<(), LayerError>;
    fn forward_cpu(&mut self, bottom: &[SharedBlob], top: &[SharedBlob])
    -> Result<(), LayerError>;
    /// 由`top`的`diff`计算`bottom`的`diff`（`propagate_down[i]`为真时）以及参数的梯度（累加）
    fn backward_cpu(
        &mut self,
        top: &[SharedBlob],
        propagate_down: &[bool],
        bottom: &[SharedBlob],
    ) -> Result<(), LayerError>;
    /*↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑需各层实现↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑*/

    /*↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓输入输出个数约束↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓*/
    fn exact_num_bottom_blobs(&self) -> Option<usize> {
        None
    }
    fn min_bottom_blobs(&self) -> Option<usize> {
        None
    }
    fn max_bottom_blobs(&self) -> Option<usize> {
        None
    }
    fn exact_num_top_blobs(&self) -> Option<usize> {
        None
    }
    fn min_top_blobs(&self) -> Option<usize> {
        None
    }
    fn max_top_blobs(&self) -> Option<usize> {
        None
    }
    /// 是否要求输入与输出个数相等
    fn equal_num_bottom_top_blobs(&self) -> bool {
        false
    }

    fn check_blob_counts(
        &self,
        bottom: &[SharedBlob],
        top: &[SharedBlob],
    ) -> Result<(), LayerError> {
        let layer_type = self.layer_type();
        let check = |what: &str,
                     actual: usize,
                     exact: Option<usize>,
                     min: Option<usize>,
                     max: Option<usize>|
         -> Result<(), LayerError> {
            let violated = exact.is_some_and(|n| actual != n)
                || min.is_some_and(|n| actual < n)
                || max.is_some_and(|n| actual > n);
            if violated {
                return Err(LayerError::Configuration(format!(
                    "{layer_type}层的{what}个数为{actual}，要求：恰好{exact:?}，至少{min:?}，至多{max:?}"
                )));
            }
            Ok(())
        };
        check(
            "输入",
            bottom.len(),
            self.exact_num_bottom_blobs(),
            self.min_bottom_blobs(),
            self.max_bottom_blobs(),
        )?;
        check(
            "输出",
            top.len(),
            self.exact_num_top_blobs(),
            self.min_top_blobs(),
            self.max_top_blobs(),
        )?;
        if self.equal_num_bottom_top_blobs() && bottom.len() != top.len() {
            return Err(LayerError::Configuration(format!(
                "{layer_type}层的输入个数（{}）与输出个数（{}）必须相等",
                bottom.len(),
                top.len()
            )));
        }
        Ok(())
    }
    /*↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑输入输出个数约束↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑*/

    /*↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓对外调用↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓*/
    /// 初始化：检查输入输出个数 → 层专属初始化 → 调整形状 → 设置损失权重
    fn setup(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<(), LayerError> {
        self.check_blob_counts(bottom, top)?;
        self.layer_setup(bottom, top)?;
        let num_blobs = self.base().blobs.len();
        self.base_mut().param_propagate_down.resize(num_blobs, true);
        self.reshape(bottom, top)?;
        self.set_loss_weights(top)
    }

    /// 前向传播，返回本层贡献的加权损失（非损失层为0）
    fn forward(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<f32, LayerError> {
        self.reshape(bottom, top)?;
        self.forward_cpu(bottom, top)?;
        let mut loss = 0.;
        for (top_index, top) in top.iter().enumerate() {
            if self.loss(top_index) == 0. {
                continue;
            }
            let top = top.borrow();
            loss += math::dot(top.data(), top.diff());
        }
        Ok(loss)
    }

    fn backward(
        &mut self,
        top: &[SharedBlob],
        propagate_down: &[bool],
        bottom: &[SharedBlob],
    ) -> Result<(), LayerError> {
        if propagate_down.len() != bottom.len() {
            return Err(LayerError::Configuration(format!(
                "{}层的propagate_down个数（{}）必须等于输入个数（{}）",
                self.layer_type(),
                propagate_down.len(),
                bottom.len()
            )));
        }
        self.backward_cpu(top, propagate_down, bottom)
    }

    /// 把损失权重写入作为损失的输出的`diff`，反向传播即从该权重开始
    fn set_loss_weights(&mut self, top: &[SharedBlob]) -> Result<(), LayerError> {
        let loss_weights = self.base().layer_param.loss_weight.clone();
        if loss_weights.len() > top.len() {
            return Err(LayerError::Configuration(format!(
                "损失权重个数（{}）超过了输出个数（{}）",
                loss_weights.len(),
                top.len()
            )));
        }
        self.base_mut().loss = vec![0.; top.len()];
        for (top_index, &weight) in loss_weights.iter().enumerate() {
            if weight == 0. {
                continue;
            }
            self.base_mut().loss[top_index] = weight;
            top[top_index].borrow_mut().diff_mut().fill(weight);
        }
        Ok(())
    }
    /*↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑对外调用↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑*/

    /*↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓访问器↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓*/
    fn layer_param(&self) -> &LayerParameter {
        &self.base().layer_param
    }

    fn blobs(&self) -> &[SharedBlob] {
        &self.base().blobs
    }

    /// 在`setup`之前注入已有的参数blob（如从已训练的网络中恢复），此时层不会重新初始化参数
    fn set_blobs(&mut self, blobs: Vec<SharedBlob>) {
        self.base_mut().blobs = blobs;
    }

    /// 第`top_index`个输出的损失权重
    fn loss(&self, top_index: usize) -> f32 {
        self.base().loss.get(top_index).copied().unwrap_or(0.)
    }

    fn param_propagate_down(&self, param_index: usize) -> bool {
        self.base()
            .param_propagate_down
            .get(param_index)
            .copied()
            .unwrap_or(false)
    }

    fn set_param_propagate_down(&mut self, param_index: usize, value: bool) {
        let flags = &mut self.base_mut().param_propagate_down;
        if flags.len() <= param_index {
            flags.resize(param_index + 1, true);
        }
        flags[param_index] = value;
    }
    /*↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑访问器↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑*/
}
/*↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑层（Layer）特性↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑*/

/// 按`layer_type`创建层
pub fn create_layer(layer_param: LayerParameter) -> Result<LayerEnum, LayerError> {
    Ok(match layer_param.layer_type.as_str() {
        "BatchNorm" => BatchNormLayer::new(layer_param).into(),
        "Convolution" => ConvolutionLayer::new(layer_param).into(),
        "Softmax" => SoftmaxLayer::new(layer_param).into(),
        "SoftmaxWithLoss" => SoftmaxWithLossLayer::new(layer_param).into(),
        other => return Err(LayerError::UnknownLayerType(other.to_string())),
    })
}
