/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : 批归一化层：把每个通道归一化为0均值、单位方差。
 *                 训练阶段使用当前batch的统计量，并把统计量以滑动平均的方式累积到3个参数blob中
 *                 （均值之和、方差之和、累积次数）；使用全局统计量时则用累积值除以累积次数。
 *                 输入按`[N, C, spatial...]`排布，可视为`(N·C) x spatial`的矩阵，
 *                 按通道求均值需先对空间轴归约、再对batch轴归约。
 */

use std::rc::Rc;

use super::{Layer, LayerBase};
use crate::blob::{Blob, SharedBlob};
use crate::errors::LayerError;
use crate::math::{self, Transpose};
use crate::proto::{LayerParameter, ParamSpec, Phase};

/// 按通道做归约与广播所需的全1向量及中间缓冲区
#[derive(Debug, Clone, Default)]
struct ChannelReducer {
    num: usize,
    channels: usize,
    spatial_dim: usize,
    batch_sum_multiplier: Blob,
    spatial_sum_multiplier: Blob,
    /// `[N·C]`，两级归约的中间结果
    num_by_chans: Blob,
}

impl ChannelReducer {
    fn reshape(&mut self, num: usize, channels: usize, spatial_dim: usize) {
        self.num = num;
        self.channels = channels;
        self.spatial_dim = spatial_dim;
        // 全1向量只在长度变化时重新填充
        if self.batch_sum_multiplier.count() != num {
            self.batch_sum_multiplier.reshape(&[num]);
            math::set(1., self.batch_sum_multiplier.data_mut());
        }
        if self.spatial_sum_multiplier.count() != spatial_dim {
            self.spatial_sum_multiplier.reshape(&[spatial_dim]);
            math::set(1., self.spatial_sum_multiplier.data_mut());
        }
        self.num_by_chans.reshape(&[channels * num]);
    }

    /// `out[c] = alpha * Σ_{n, s} x[n, c, s]`
    fn reduce(&mut self, alpha: f32, x: &[f32], out: &mut [f32]) -> Result<(), LayerError> {
        math::gemv(
            Transpose::NoTrans,
            self.channels * self.num,
            self.spatial_dim,
            alpha,
            x,
            self.spatial_sum_multiplier.data(),
            0.,
            self.num_by_chans.data_mut(),
        )?;
        math::gemv(
            Transpose::Trans,
            self.num,
            self.channels,
            1.,
            self.num_by_chans.data(),
            self.batch_sum_multiplier.data(),
            0.,
            out,
        )
    }

    /// `out[n, c, s] = alpha * values[c] + beta * out[n, c, s]`
    fn broadcast(
        &mut self,
        alpha: f32,
        values: &[f32],
        beta: f32,
        out: &mut [f32],
    ) -> Result<(), LayerError> {
        math::gemm(
            Transpose::NoTrans,
            Transpose::NoTrans,
            self.num,
            self.channels,
            1,
            1.,
            self.batch_sum_multiplier.data(),
            values,
            0.,
            self.num_by_chans.data_mut(),
        )?;
        math::gemm(
            Transpose::NoTrans,
            Transpose::NoTrans,
            self.channels * self.num,
            self.spatial_dim,
            1,
            alpha,
            self.num_by_chans.data(),
            self.spatial_sum_multiplier.data(),
            beta,
            out,
        )
    }
}

#[derive(Debug, Clone)]
pub struct BatchNormLayer {
    base: LayerBase,
    channels: usize,
    eps: f32,
    moving_average_fraction: f32,
    use_global_stats: bool,
    mean: Blob,
    variance: Blob,
    /// 前向结束后保存广播到输入形状的`sqrt(variance + eps)`
    temp: Blob,
    /// 归一化后的输出；原地计算时其`diff`用来暂存输出梯度
    x_norm: Blob,
    reducer: ChannelReducer,
}

impl BatchNormLayer {
    pub fn new(layer_param: LayerParameter) -> Self {
        BatchNormLayer {
            base: LayerBase::new(layer_param),
            channels: 0,
            eps: 0.,
            moving_average_fraction: 0.,
            use_global_stats: false,
            mean: Blob::default(),
            variance: Blob::default(),
            temp: Blob::default(),
            x_norm: Blob::default(),
            reducer: ChannelReducer::default(),
        }
    }

    pub fn use_global_stats(&self) -> bool {
        self.use_global_stats
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// 已有参数blob（外部注入）时检查其形状
    fn check_existing_blobs(&self) -> Result<(), LayerError> {
        let expected: [&[usize]; 3] = [&[self.channels], &[self.channels], &[1]];
        if self.base.blobs.len() != expected.len() {
            return Err(LayerError::Configuration(format!(
                "批归一化层需要3个参数blob，实际为{}个",
                self.base.blobs.len()
            )));
        }
        for (blob, expected) in self.base.blobs.iter().zip(expected) {
            let blob = blob.borrow();
            if blob.shape() != expected {
                return Err(LayerError::shape_mismatch(
                    expected,
                    blob.shape(),
                    "批归一化层已有参数blob的形状不符",
                ));
            }
        }
        Ok(())
    }
}

impl Layer for BatchNormLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn layer_type(&self) -> &'static str {
        "BatchNorm"
    }

    fn exact_num_bottom_blobs(&self) -> Option<usize> {
        Some(1)
    }

    fn exact_num_top_blobs(&self) -> Option<usize> {
        Some(1)
    }

    fn layer_setup(
        &mut self,
        bottom: &[SharedBlob],
        _top: &[SharedBlob],
    ) -> Result<(), LayerError> {
        let param = &self.base.layer_param.batch_norm_param;
        self.moving_average_fraction = param.moving_average_fraction;
        self.use_global_stats = param
            .use_global_stats
            .unwrap_or(self.base.layer_param.phase == Phase::Test);
        self.eps = param.eps;

        let bottom = bottom[0].borrow();
        self.channels = match bottom.num_axes() {
            0 => {
                return Err(LayerError::Configuration(
                    "批归一化层的输入至少需要1个轴".to_string(),
                ));
            }
            1 => 1,
            _ => bottom.shape()[1],
        };

        if self.base.blobs.is_empty() {
            self.base.blobs = vec![
                Blob::shared(&[self.channels]),
                Blob::shared(&[self.channels]),
                Blob::shared(&[1]),
            ];
        } else {
            log::info!("{}：跳过参数初始化", self.base.layer_param.name);
            self.check_existing_blobs()?;
        }

        // 统计量不参与梯度下降，学习率必须为0
        for i in 0..self.base.blobs.len() {
            let specs = &mut self.base.layer_param.param;
            if specs.len() == i {
                specs.push(ParamSpec::frozen());
            } else if specs[i].lr_mult != 0. {
                return Err(LayerError::Configuration(format!(
                    "不能把批归一化的统计量配置为可学习参数：第{i}个参数的lr_mult为{}",
                    specs[i].lr_mult
                )));
            }
        }
        Ok(())
    }

    fn reshape(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<(), LayerError> {
        let shape = bottom[0].borrow().shape().to_vec();
        if shape.is_empty() {
            return Err(LayerError::shape_mismatch(
                &[self.channels],
                &shape,
                "批归一化层的输入至少需要1个轴",
            ));
        }
        // 一维输入视为单通道
        let channels = if shape.len() == 1 { 1 } else { shape[1] };
        if channels != self.channels {
            return Err(LayerError::shape_mismatch(
                &[self.channels],
                &[channels],
                "批归一化层输入的通道数与初始化时不一致",
            ));
        }
        top[0].borrow_mut().reshape(&shape);

        self.mean.reshape(&[self.channels]);
        self.variance.reshape(&[self.channels]);
        self.temp.reshape(&shape);
        self.x_norm.reshape(&shape);
        let num = shape[0];
        let count: usize = shape.iter().product();
        let spatial_dim = count / (self.channels * num).max(1);
        self.reducer.reshape(num, self.channels, spatial_dim);
        log::debug!(
            "{}：输入形状{shape:?}，每通道{num}x{spatial_dim}个元素",
            self.base.layer_param.name
        );
        Ok(())
    }

    fn forward_cpu(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<(), LayerError> {
        if !Rc::ptr_eq(&bottom[0], &top[0]) {
            let bottom = bottom[0].borrow();
            top[0].borrow_mut().set_data(bottom.data())?;
        }
        let mut top = top[0].borrow_mut();
        let top_data = top.data_mut();
        let (num, spatial_dim) = (self.reducer.num, self.reducer.spatial_dim);
        let per_channel = (num * spatial_dim) as f32;

        if self.use_global_stats {
            // 累积值除以累积次数，次数为0时视为0
            let count_acc = self.base.blobs[2].borrow().data()[0];
            let scale_factor = if count_acc == 0. { 0. } else { 1. / count_acc };
            math::scale(
                scale_factor,
                self.base.blobs[0].borrow().data(),
                self.mean.data_mut(),
            );
            math::scale(
                scale_factor,
                self.base.blobs[1].borrow().data(),
                self.variance.data_mut(),
            );
        } else {
            self.reducer
                .reduce(1. / per_channel, top_data, self.mean.data_mut())?;
        }

        // 减去均值
        self.reducer.broadcast(-1., self.mean.data(), 1., top_data)?;

        if !self.use_global_stats {
            // var(X) = E((X - EX)^2)
            math::powx(top_data, 2., self.temp.data_mut());
            self.reducer
                .reduce(1. / per_channel, self.temp.data(), self.variance.data_mut())?;

            // 滑动平均
            let fraction = self.moving_average_fraction;
            {
                let mut count_acc = self.base.blobs[2].borrow_mut();
                let count_acc = &mut count_acc.data_mut()[0];
                *count_acc = *count_acc * fraction + 1.;
            }
            math::axpby(
                1.,
                self.mean.data(),
                fraction,
                self.base.blobs[0].borrow_mut().data_mut(),
            );
            // 无偏估计的修正系数m/(m-1)
            let m = num * spatial_dim;
            let bias_correction = if m > 1 {
                m as f32 / (m - 1) as f32
            } else {
                1.
            };
            math::axpby(
                bias_correction,
                self.variance.data(),
                fraction,
                self.base.blobs[1].borrow_mut().data_mut(),
            );
        }

        // 除以sqrt(var + eps)
        math::add_scalar(self.eps, self.variance.data_mut());
        math::powx_assign(self.variance.data_mut(), 0.5);
        self.reducer
            .broadcast(1., self.variance.data(), 0., self.temp.data_mut())?;
        math::div_assign(top_data, self.temp.data());

        // 后续的原地层可能改写输出，需缓存归一化结果
        math::copy(top_data, self.x_norm.data_mut());
        Ok(())
    }

    fn backward_cpu(
        &mut self,
        top: &[SharedBlob],
        propagate_down: &[bool],
        bottom: &[SharedBlob],
    ) -> Result<(), LayerError> {
        if !propagate_down[0] {
            return Ok(());
        }
        let in_place = Rc::ptr_eq(&bottom[0], &top[0]);
        if in_place {
            let top = top[0].borrow();
            math::copy(top.diff(), self.x_norm.diff_mut());
        }
        let top_guard = (!in_place).then(|| top[0].borrow());
        let mut bottom = bottom[0].borrow_mut();
        let bottom_diff = bottom.diff_mut();
        let top_diff = match &top_guard {
            Some(top) => top.diff(),
            None => self.x_norm.diff(),
        };

        if self.use_global_stats {
            math::div(top_diff, self.temp.data(), bottom_diff);
            return Ok(());
        }

        // dX = (dY - mean(dY) - mean(dY·Y)·Y) / sqrt(var + eps)
        let top_data = self.x_norm.data();
        let per_channel = (self.reducer.num * self.reducer.spatial_dim) as f32;

        // sum(dY·Y)·Y
        math::mul(top_data, top_diff, bottom_diff);
        self.reducer.reduce(1., bottom_diff, self.mean.data_mut())?;
        self.reducer.broadcast(1., self.mean.data(), 0., bottom_diff)?;
        math::mul_assign(top_data, bottom_diff);

        // sum(dY) + sum(dY·Y)·Y
        self.reducer.reduce(1., top_diff, self.mean.data_mut())?;
        self.reducer.broadcast(1., self.mean.data(), 1., bottom_diff)?;

        // dY - (sum(dY) + sum(dY·Y)·Y) / m
        math::axpby(1., top_diff, -1. / per_channel, bottom_diff);

        // temp中仍是前向时的sqrt(var + eps)
        math::div_assign(bottom_diff, self.temp.data());
        Ok(())
    }
}
