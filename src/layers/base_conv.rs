/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : 卷积的公共部分：参数解析、权重创建、形状推导，以及单个样本上的
 *                 前向（im2col + GEMM）、偏置、输入梯度（GEMM + col2im）、权重梯度与偏置梯度。
 *                 分组卷积时权重、列缓冲区与输出按组切分，每组独立做一次矩阵乘法。
 */

use super::LayerBase;
use crate::blob::{Blob, SharedBlob};
use crate::errors::LayerError;
use crate::filler::Filler;
use crate::math::{self, ConvGeometry, Transpose};
use crate::proto::ConvolutionParameter;

/// 解析某个按空间轴给出的参数：列表长度为1时所有空间轴共用，
/// 长度等于空间轴数时逐轴给出，二维时也可用`_h`/`_w`两个字段
fn spatial_values(
    name: &str,
    list: &[usize],
    hw: (Option<usize>, Option<usize>),
    num_spatial_axes: usize,
    default: Option<usize>,
) -> Result<Vec<usize>, LayerError> {
    if hw.0.is_some() || hw.1.is_some() {
        if num_spatial_axes != 2 {
            return Err(LayerError::Configuration(format!(
                "{name}_h/{name}_w只能用于2个空间轴的卷积，实际空间轴数为{num_spatial_axes}"
            )));
        }
        if !list.is_empty() {
            return Err(LayerError::Configuration(format!(
                "{name}与{name}_h/{name}_w只能指定其一"
            )));
        }
        return match hw {
            (Some(h), Some(w)) => Ok(vec![h, w]),
            _ => Err(LayerError::Configuration(format!(
                "{name}_h与{name}_w必须同时指定"
            ))),
        };
    }
    match list.len() {
        0 => default
            .map(|value| vec![value; num_spatial_axes])
            .ok_or_else(|| LayerError::Configuration(format!("必须指定{name}"))),
        1 => Ok(vec![list[0]; num_spatial_axes]),
        len if len == num_spatial_axes => Ok(list.to_vec()),
        len => Err(LayerError::Configuration(format!(
            "{name}的个数必须为1或等于空间轴数{num_spatial_axes}，实际为{len}"
        ))),
    }
}

fn check_positive(name: &str, values: &[usize]) -> Result<(), LayerError> {
    if let Some(axis) = values.iter().position(|&v| v == 0) {
        return Err(LayerError::Configuration(format!(
            "{name}在第{axis}个空间轴上必须大于0"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub(super) struct BaseConvolution {
    pub(super) channel_axis: usize,
    pub(super) num_spatial_axes: usize,
    pub(super) geometry: ConvGeometry,
    force_nd_im2col: bool,
    /// 1x1、步长1、无填充时无需展开
    pub(super) is_1x1: bool,
    pub(super) channels: usize,
    pub(super) num_output: usize,
    pub(super) group: usize,
    pub(super) bias_term: bool,

    /// 以下随输入形状变化
    /// 通道轴之前所有轴的元素个数（通常即batch大小）
    pub(super) num: usize,
    pub(super) bottom_shape: Vec<usize>,
    pub(super) output_shape: Vec<usize>,
    /// `[channels, spatial...]`
    conv_input_shape: Vec<usize>,
    /// 单个样本的输入/输出元素个数
    pub(super) bottom_dim: usize,
    pub(super) top_dim: usize,
    /// 每个输出通道对应的权重个数（单组）
    kernel_dim: usize,
    weight_offset: usize,
    col_offset: usize,
    output_offset: usize,
    conv_out_spatial_dim: usize,
    col_buffer: Blob,
    bias_multiplier: Blob,
}

impl BaseConvolution {
    /// 解析卷积参数；参数blob不存在时按filler创建，存在时检查形状
    pub(super) fn setup(&mut self, base: &mut LayerBase, bottom: &Blob) -> Result<(), LayerError> {
        let param: &ConvolutionParameter = &base.layer_param.convolution_param;
        self.force_nd_im2col = param.force_nd_im2col;
        self.channel_axis = bottom.canonical_axis_index(param.axis)?;
        let first_spatial_axis = self.channel_axis + 1;
        self.num_spatial_axes = bottom.num_axes() - first_spatial_axis;

        let n = self.num_spatial_axes;
        let kernel_shape = spatial_values(
            "kernel",
            &param.kernel_size,
            (param.kernel_h, param.kernel_w),
            n,
            None,
        )?;
        let stride = spatial_values(
            "stride",
            &param.stride,
            (param.stride_h, param.stride_w),
            n,
            Some(1),
        )?;
        let pad = spatial_values("pad", &param.pad, (param.pad_h, param.pad_w), n, Some(0))?;
        let dilation = spatial_values("dilation", &param.dilation, (None, None), n, Some(1))?;
        check_positive("kernel", &kernel_shape)?;
        check_positive("stride", &stride)?;
        check_positive("dilation", &dilation)?;
        self.geometry = ConvGeometry {
            kernel_shape,
            pad,
            stride,
            dilation,
        };
        self.is_1x1 = self.geometry.is_1x1();

        self.channels = bottom.shape()[self.channel_axis];
        self.num_output = param.num_output;
        if self.num_output == 0 {
            return Err(LayerError::Configuration(
                "卷积层的num_output必须大于0".to_string(),
            ));
        }
        self.group = param.group;
        if self.group == 0 || self.channels % self.group != 0 || self.num_output % self.group != 0 {
            return Err(LayerError::Configuration(format!(
                "输入通道数{}与输出通道数{}都必须是分组数{}的整数倍",
                self.channels, self.num_output, self.group
            )));
        }
        self.bias_term = param.bias_term;

        // 权重形状[out, in / group, kernel...]，偏置形状[out]
        let mut weight_shape = vec![self.num_output, self.channels / self.group];
        weight_shape.extend_from_slice(&self.geometry.kernel_shape);
        let bias_shape = [self.num_output];
        let num_param_blobs = if self.bias_term { 2 } else { 1 };

        if base.blobs.is_empty() {
            let mut weight = Blob::new(&weight_shape);
            Filler::new(&param.weight_filler).fill(&mut weight)?;
            base.blobs.push(weight.into_shared());
            if self.bias_term {
                let mut bias = Blob::new(&bias_shape);
                Filler::new(&param.bias_filler).fill(&mut bias)?;
                base.blobs.push(bias.into_shared());
            }
        } else {
            log::info!("{}：跳过参数初始化", base.layer_param.name);
            if base.blobs.len() != num_param_blobs {
                return Err(LayerError::Configuration(format!(
                    "卷积层应有{num_param_blobs}个参数blob，实际为{}个",
                    base.blobs.len()
                )));
            }
            let weight = base.blobs[0].borrow();
            if weight.shape() != weight_shape.as_slice() {
                return Err(LayerError::shape_mismatch(
                    &weight_shape,
                    weight.shape(),
                    "已有的卷积权重形状不符",
                ));
            }
            if self.bias_term {
                let bias = base.blobs[1].borrow();
                if bias.shape() != bias_shape {
                    return Err(LayerError::shape_mismatch(
                        &bias_shape,
                        bias.shape(),
                        "已有的卷积偏置形状不符",
                    ));
                }
            }
        }

        self.kernel_dim = weight_shape[1..].iter().product();
        self.weight_offset = self.num_output * self.kernel_dim / self.group;
        Ok(())
    }

    /// 由输入形状推出各空间轴的输出尺寸
    pub(super) fn compute_output_shape(&mut self) -> Result<(), LayerError> {
        let first_spatial_axis = self.channel_axis + 1;
        self.output_shape = self
            .geometry
            .output_shape(&self.bottom_shape[first_spatial_axis..])?;
        Ok(())
    }

    pub(super) fn reshape(
        &mut self,
        bottom: &[SharedBlob],
        top: &[SharedBlob],
    ) -> Result<(), LayerError> {
        let first_spatial_axis = self.channel_axis + 1;
        let bottom_shape = bottom[0].borrow().shape().to_vec();
        if bottom_shape.len() != first_spatial_axis + self.num_spatial_axes {
            return Err(LayerError::shape_mismatch(
                &[first_spatial_axis + self.num_spatial_axes],
                &[bottom_shape.len()],
                "卷积层输入的轴数不可改变",
            ));
        }
        if bottom_shape[self.channel_axis] != self.channels {
            return Err(LayerError::shape_mismatch(
                &[self.channels],
                &[bottom_shape[self.channel_axis]],
                "卷积层输入的通道数与卷积核不一致",
            ));
        }
        for other in &bottom[1..] {
            let other = other.borrow();
            if other.shape() != bottom_shape.as_slice() {
                return Err(LayerError::shape_mismatch(
                    &bottom_shape,
                    other.shape(),
                    "卷积层的所有输入形状必须相同",
                ));
            }
        }
        self.num = bottom_shape[..self.channel_axis].iter().product();
        self.bottom_shape = bottom_shape;
        self.compute_output_shape()?;

        let mut top_shape = self.bottom_shape[..self.channel_axis].to_vec();
        top_shape.push(self.num_output);
        top_shape.extend_from_slice(&self.output_shape);
        for top in top {
            top.borrow_mut().reshape(&top_shape);
        }

        self.conv_out_spatial_dim = self.output_shape.iter().product();
        self.col_offset = self.kernel_dim * self.conv_out_spatial_dim;
        self.output_offset = self.num_output * self.conv_out_spatial_dim / self.group;
        self.conv_input_shape = self.bottom_shape[self.channel_axis..].to_vec();
        self.bottom_dim = self.conv_input_shape.iter().product();
        self.top_dim = self.num_output * self.conv_out_spatial_dim;

        let mut col_buffer_shape = vec![self.kernel_dim * self.group];
        col_buffer_shape.extend_from_slice(&self.output_shape);
        self.col_buffer.reshape(&col_buffer_shape);

        if self.bias_term && self.bias_multiplier.count() != self.conv_out_spatial_dim {
            self.bias_multiplier.reshape(&[self.conv_out_spatial_dim]);
            math::set(1., self.bias_multiplier.data_mut());
        }
        Ok(())
    }

    fn conv_im2col(&mut self, data: &[f32]) -> Result<(), LayerError> {
        let col = self.col_buffer.data_mut();
        if !self.force_nd_im2col && self.num_spatial_axes == 2 {
            let shape = &self.conv_input_shape;
            math::im2col(data, shape[0], shape[1], shape[2], &self.geometry, col)
        } else {
            math::im2col_nd(data, &self.conv_input_shape, &self.geometry, col)
        }
    }

    fn conv_col2im(&self, data: &mut [f32]) -> Result<(), LayerError> {
        let col = self.col_buffer.data();
        if !self.force_nd_im2col && self.num_spatial_axes == 2 {
            let shape = &self.conv_input_shape;
            math::col2im(col, shape[0], shape[1], shape[2], &self.geometry, data)
        } else {
            math::col2im_nd(col, &self.conv_input_shape, &self.geometry, data)
        }
    }

    /// 单个样本：`output = weights * im2col(input)`
    pub(super) fn forward_cpu_gemm(
        &mut self,
        input: &[f32],
        weights: &[f32],
        output: &mut [f32],
    ) -> Result<(), LayerError> {
        if !self.is_1x1 {
            self.conv_im2col(input)?;
        }
        let col_buff = if self.is_1x1 {
            input
        } else {
            self.col_buffer.data()
        };
        for g in 0..self.group {
            math::gemm(
                Transpose::NoTrans,
                Transpose::NoTrans,
                self.num_output / self.group,
                self.conv_out_spatial_dim,
                self.kernel_dim,
                1.,
                &weights[self.weight_offset * g..],
                &col_buff[self.col_offset * g..],
                0.,
                &mut output[self.output_offset * g..],
            )?;
        }
        Ok(())
    }

    /// 单个样本：每个输出通道加上各自的偏置
    pub(super) fn forward_cpu_bias(
        &self,
        output: &mut [f32],
        bias: &[f32],
    ) -> Result<(), LayerError> {
        math::gemm(
            Transpose::NoTrans,
            Transpose::NoTrans,
            self.num_output,
            self.conv_out_spatial_dim,
            1,
            1.,
            bias,
            self.bias_multiplier.data(),
            1.,
            output,
        )
    }

    /// 单个样本：由输出梯度求输入梯度（覆盖写入`input`）
    pub(super) fn backward_cpu_gemm(
        &mut self,
        output: &[f32],
        weights: &[f32],
        input: &mut [f32],
    ) -> Result<(), LayerError> {
        let group = self.group;
        let (m, n, k) = (
            self.kernel_dim,
            self.conv_out_spatial_dim,
            self.num_output / group,
        );
        let (weight_offset, output_offset, col_offset) =
            (self.weight_offset, self.output_offset, self.col_offset);
        let col_buff = if self.is_1x1 {
            &mut *input
        } else {
            self.col_buffer.data_mut()
        };
        for g in 0..group {
            math::gemm(
                Transpose::Trans,
                Transpose::NoTrans,
                m,
                n,
                k,
                1.,
                &weights[weight_offset * g..],
                &output[output_offset * g..],
                0.,
                &mut col_buff[col_offset * g..],
            )?;
        }
        if !self.is_1x1 {
            self.conv_col2im(input)?;
        }
        Ok(())
    }

    /// 单个样本：权重梯度累加到`weights_diff`
    pub(super) fn weight_cpu_gemm(
        &mut self,
        input: &[f32],
        output: &[f32],
        weights_diff: &mut [f32],
    ) -> Result<(), LayerError> {
        if !self.is_1x1 {
            self.conv_im2col(input)?;
        }
        let col_buff = if self.is_1x1 {
            input
        } else {
            self.col_buffer.data()
        };
        for g in 0..self.group {
            math::gemm(
                Transpose::NoTrans,
                Transpose::Trans,
                self.num_output / self.group,
                self.kernel_dim,
                self.conv_out_spatial_dim,
                1.,
                &output[self.output_offset * g..],
                &col_buff[self.col_offset * g..],
                1.,
                &mut weights_diff[self.weight_offset * g..],
            )?;
        }
        Ok(())
    }

    /// 单个样本：偏置梯度（输出梯度在空间轴上的和）累加到`bias_diff`
    pub(super) fn backward_cpu_bias(
        &self,
        bias_diff: &mut [f32],
        output: &[f32],
    ) -> Result<(), LayerError> {
        math::gemv(
            Transpose::NoTrans,
            self.num_output,
            self.conv_out_spatial_dim,
            1.,
            output,
            self.bias_multiplier.data(),
            1.,
            bias_diff,
        )
    }
}
