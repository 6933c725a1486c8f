/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : 卷积层。逐个样本调用公共卷积部分完成前向与反向；
 *                 权重与偏置的梯度在样本间、多次调用间都是累加的，清零由调用方负责。
 */

use std::rc::Rc;

use super::base_conv::BaseConvolution;
use super::{Layer, LayerBase};
use crate::blob::SharedBlob;
use crate::errors::LayerError;
use crate::proto::LayerParameter;

#[derive(Debug, Clone)]
pub struct ConvolutionLayer {
    base: LayerBase,
    conv: BaseConvolution,
}

impl ConvolutionLayer {
    pub fn new(layer_param: LayerParameter) -> Self {
        ConvolutionLayer {
            base: LayerBase::new(layer_param),
            conv: BaseConvolution::default(),
        }
    }

    /// 最近一次`reshape`得到的各空间轴输出尺寸
    pub fn output_shape(&self) -> &[usize] {
        &self.conv.output_shape
    }

    pub fn is_1x1(&self) -> bool {
        self.conv.is_1x1
    }
}

impl Layer for ConvolutionLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn layer_type(&self) -> &'static str {
        "Convolution"
    }

    fn min_bottom_blobs(&self) -> Option<usize> {
        Some(1)
    }

    fn min_top_blobs(&self) -> Option<usize> {
        Some(1)
    }

    fn equal_num_bottom_top_blobs(&self) -> bool {
        true
    }

    fn layer_setup(
        &mut self,
        bottom: &[SharedBlob],
        _top: &[SharedBlob],
    ) -> Result<(), LayerError> {
        let bottom = bottom[0].borrow();
        self.conv.setup(&mut self.base, &bottom)
    }

    fn reshape(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<(), LayerError> {
        for (i, b) in bottom.iter().enumerate() {
            if let Some(j) = top.iter().position(|t| Rc::ptr_eq(b, t)) {
                return Err(LayerError::Configuration(format!(
                    "卷积层不支持原地计算：第{i}个输入与第{j}个输出是同一个blob"
                )));
            }
        }
        self.conv.reshape(bottom, top)?;
        log::debug!(
            "{}：输入{:?}，输出空间尺寸{:?}",
            self.base.layer_param.name,
            self.conv.bottom_shape,
            self.conv.output_shape
        );
        Ok(())
    }

    fn forward_cpu(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<(), LayerError> {
        let weight = self.base.blobs[0].borrow();
        let bias = self.conv.bias_term.then(|| self.base.blobs[1].borrow());
        let (bottom_dim, top_dim) = (self.conv.bottom_dim, self.conv.top_dim);
        for (bottom, top) in bottom.iter().zip(top) {
            let bottom = bottom.borrow();
            let mut top = top.borrow_mut();
            let top_data = top.data_mut();
            for n in 0..self.conv.num {
                let output = &mut top_data[n * top_dim..];
                self.conv
                    .forward_cpu_gemm(&bottom.data()[n * bottom_dim..], weight.data(), output)?;
                if let Some(bias) = &bias {
                    self.conv.forward_cpu_bias(output, bias.data())?;
                }
            }
        }
        Ok(())
    }

    fn backward_cpu(
        &mut self,
        top: &[SharedBlob],
        propagate_down: &[bool],
        bottom: &[SharedBlob],
    ) -> Result<(), LayerError> {
        let (bottom_dim, top_dim) = (self.conv.bottom_dim, self.conv.top_dim);
        let propagate_weight = self.param_propagate_down(0);
        let propagate_bias = self.conv.bias_term && self.param_propagate_down(1);
        let mut weight = self.base.blobs[0].borrow_mut();
        let (weight_data, weight_diff) = weight.data_and_diff_mut();

        for (i, (top, bottom)) in top.iter().zip(bottom).enumerate() {
            let top = top.borrow();
            let top_diff = top.diff();
            if propagate_bias {
                let mut bias = self.base.blobs[1].borrow_mut();
                let bias_diff = bias.diff_mut();
                for n in 0..self.conv.num {
                    self.conv
                        .backward_cpu_bias(bias_diff, &top_diff[n * top_dim..])?;
                }
            }
            if !propagate_weight && !propagate_down[i] {
                continue;
            }
            let mut bottom = bottom.borrow_mut();
            let (bottom_data, bottom_diff) = bottom.data_and_diff_mut();
            for n in 0..self.conv.num {
                let output = &top_diff[n * top_dim..];
                if propagate_weight {
                    self.conv
                        .weight_cpu_gemm(&bottom_data[n * bottom_dim..], output, weight_diff)?;
                }
                if propagate_down[i] {
                    self.conv.backward_cpu_gemm(
                        output,
                        weight_data,
                        &mut bottom_diff[n * bottom_dim..],
                    )?;
                }
            }
        }
        Ok(())
    }
}
