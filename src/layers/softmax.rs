/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : 沿指定轴做softmax。输入视为`[outer, channels, inner]`，
 *                 对每个(outer, inner)位置在channels上归一化；先减去该位置的最大值以免exp溢出。
 */

use std::rc::Rc;

use super::{Layer, LayerBase};
use crate::blob::{Blob, SharedBlob};
use crate::errors::LayerError;
use crate::math::{self, Transpose};
use crate::proto::LayerParameter;

#[derive(Debug, Clone)]
pub struct SoftmaxLayer {
    base: LayerBase,
    softmax_axis: usize,
    outer_num: usize,
    channels: usize,
    inner_num: usize,
    /// `[channels]`的全1向量
    sum_multiplier: Blob,
    /// 每个位置的最大值/指数和，只用前`inner_num`个元素
    scale: Blob,
}

impl SoftmaxLayer {
    pub fn new(layer_param: LayerParameter) -> Self {
        SoftmaxLayer {
            base: LayerBase::new(layer_param),
            softmax_axis: 0,
            outer_num: 0,
            channels: 0,
            inner_num: 0,
            sum_multiplier: Blob::default(),
            scale: Blob::default(),
        }
    }

    pub fn softmax_axis(&self) -> usize {
        self.softmax_axis
    }

    /// `dX = (dY - Σ_c dY·Y) ⊙ Y`，`bottom_diff`进入时已等于输出梯度
    fn compute_gradient(
        &mut self,
        top_data: &[f32],
        bottom_diff: &mut [f32],
    ) -> Result<(), LayerError> {
        let (channels, inner_num) = (self.channels, self.inner_num);
        let dim = channels * inner_num;
        if dim == 0 || self.outer_num == 0 {
            return Ok(());
        }
        let scale = &mut self.scale.data_mut()[..inner_num];
        for i in 0..self.outer_num {
            let block_data = &top_data[i * dim..(i + 1) * dim];
            let block_diff = &mut bottom_diff[i * dim..(i + 1) * dim];
            for (k, s) in scale.iter_mut().enumerate() {
                *s = math::strided_dot(
                    channels,
                    &block_diff[k..],
                    inner_num,
                    &block_data[k..],
                    inner_num,
                );
            }
            math::gemm(
                Transpose::NoTrans,
                Transpose::NoTrans,
                channels,
                inner_num,
                1,
                -1.,
                self.sum_multiplier.data(),
                scale,
                1.,
                block_diff,
            )?;
        }
        math::mul_assign(top_data, bottom_diff);
        Ok(())
    }
}

impl Layer for SoftmaxLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn layer_type(&self) -> &'static str {
        "Softmax"
    }

    fn exact_num_bottom_blobs(&self) -> Option<usize> {
        Some(1)
    }

    fn exact_num_top_blobs(&self) -> Option<usize> {
        Some(1)
    }

    fn layer_setup(
        &mut self,
        _bottom: &[SharedBlob],
        _top: &[SharedBlob],
    ) -> Result<(), LayerError> {
        Ok(())
    }

    fn reshape(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<(), LayerError> {
        let (shape, axis) = {
            let bottom = bottom[0].borrow();
            let axis = bottom.canonical_axis_index(self.base.layer_param.softmax_param.axis)?;
            (bottom.shape().to_vec(), axis)
        };
        top[0].borrow_mut().reshape(&shape);
        self.softmax_axis = axis;
        self.outer_num = shape[..axis].iter().product();
        self.channels = shape[axis];
        self.inner_num = shape[axis + 1..].iter().product();
        if self.sum_multiplier.count() != self.channels {
            self.sum_multiplier.reshape(&[self.channels]);
            math::set(1., self.sum_multiplier.data_mut());
        }
        let mut scale_shape = shape;
        scale_shape[axis] = 1;
        self.scale.reshape(&scale_shape);
        Ok(())
    }

    fn forward_cpu(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<(), LayerError> {
        if !Rc::ptr_eq(&bottom[0], &top[0]) {
            let bottom = bottom[0].borrow();
            top[0].borrow_mut().set_data(bottom.data())?;
        }
        let (channels, inner_num) = (self.channels, self.inner_num);
        let dim = channels * inner_num;
        if dim == 0 || self.outer_num == 0 {
            return Ok(());
        }
        let mut top = top[0].borrow_mut();
        let top_data = top.data_mut();
        let scale = &mut self.scale.data_mut()[..inner_num];
        for i in 0..self.outer_num {
            let block = &mut top_data[i * dim..(i + 1) * dim];
            // 每个位置在channels上的最大值
            scale.copy_from_slice(&block[..inner_num]);
            for row in block.chunks(inner_num).skip(1) {
                scale
                    .iter_mut()
                    .zip(row)
                    .for_each(|(s, &x)| *s = s.max(x));
            }
            math::gemm(
                Transpose::NoTrans,
                Transpose::NoTrans,
                channels,
                inner_num,
                1,
                -1.,
                self.sum_multiplier.data(),
                scale,
                1.,
                block,
            )?;
            math::exp_assign(block);
            math::gemv(
                Transpose::Trans,
                channels,
                inner_num,
                1.,
                block,
                self.sum_multiplier.data(),
                0.,
                scale,
            )?;
            for row in block.chunks_mut(inner_num) {
                math::div_assign(row, scale);
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
        if !propagate_down[0] {
            return Ok(());
        }
        if Rc::ptr_eq(&bottom[0], &top[0]) {
            let mut blob = bottom[0].borrow_mut();
            let (top_data, bottom_diff) = blob.data_and_diff_mut();
            return self.compute_gradient(top_data, bottom_diff);
        }
        let top = top[0].borrow();
        let mut bottom = bottom[0].borrow_mut();
        bottom.set_diff(top.diff())?;
        self.compute_gradient(top.data(), bottom.diff_mut())
    }
}
