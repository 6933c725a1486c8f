/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : softmax与多分类负对数似然合并而成的损失层。
 *                 输入0为各类别的得分`[outer, classes, inner]`，输入1为`outer * inner`个整数标签；
 *                 输出0为标量损失，可选的输出1与内部的概率blob共享数据。
 */

use super::softmax::SoftmaxLayer;
use super::{Layer, LayerBase};
use crate::blob::{Blob, SharedBlob};
use crate::errors::LayerError;
use crate::math;
use crate::proto::{LayerParameter, NormalizationMode};

#[derive(Debug, Clone)]
pub struct SoftmaxWithLossLayer {
    base: LayerBase,
    /// 内部的softmax层，把输入0映射到`prob`
    softmax: SoftmaxLayer,
    prob: SharedBlob,
    ignore_label: Option<i32>,
    normalization: NormalizationMode,
    softmax_axis: usize,
    outer_num: usize,
    inner_num: usize,
}

impl SoftmaxWithLossLayer {
    pub fn new(layer_param: LayerParameter) -> Self {
        let mut softmax_param = layer_param.clone();
        softmax_param.layer_type = "Softmax".to_string();
        softmax_param.loss_weight.clear();
        SoftmaxWithLossLayer {
            base: LayerBase::new(layer_param),
            softmax: SoftmaxLayer::new(softmax_param),
            prob: Blob::default().into_shared(),
            ignore_label: None,
            normalization: NormalizationMode::Valid,
            softmax_axis: 0,
            outer_num: 0,
            inner_num: 0,
        }
    }

    /// 最近一次前向得到的各类别概率
    pub fn prob(&self) -> &SharedBlob {
        &self.prob
    }

    pub fn normalization(&self) -> NormalizationMode {
        self.normalization
    }

    /// 损失的归一化分母，不小于1。`valid_count`为`None`时`Valid`退化为`Full`
    pub fn get_normalizer(&self, mode: NormalizationMode, valid_count: Option<usize>) -> f32 {
        let full = (self.outer_num * self.inner_num) as f32;
        let normalizer = match mode {
            NormalizationMode::Full => full,
            NormalizationMode::Valid => valid_count.map_or(full, |count| count as f32),
            NormalizationMode::BatchSize => self.outer_num as f32,
            NormalizationMode::None => 1.,
        };
        // 某些样本可能所有标签都被忽略
        normalizer.max(1.)
    }

    /// 读取第`index`个标签：被忽略时返回`None`，超出类别范围时报错
    fn label_at(
        &self,
        labels: &[f32],
        index: usize,
        num_classes: usize,
    ) -> Result<Option<usize>, LayerError> {
        let label = labels[index] as i32;
        if self.ignore_label == Some(label) {
            return Ok(None);
        }
        if label < 0 || label as usize >= num_classes {
            return Err(LayerError::InvalidLabel { label, num_classes });
        }
        Ok(Some(label as usize))
    }

    fn softmax_vecs(&self, bottom: &[SharedBlob]) -> ([SharedBlob; 1], [SharedBlob; 1]) {
        ([bottom[0].clone()], [self.prob.clone()])
    }
}

impl Layer for SoftmaxWithLossLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn layer_type(&self) -> &'static str {
        "SoftmaxWithLoss"
    }

    fn exact_num_bottom_blobs(&self) -> Option<usize> {
        Some(2)
    }

    fn min_top_blobs(&self) -> Option<usize> {
        Some(1)
    }

    fn max_top_blobs(&self) -> Option<usize> {
        Some(2)
    }

    fn layer_setup(
        &mut self,
        bottom: &[SharedBlob],
        _top: &[SharedBlob],
    ) -> Result<(), LayerError> {
        // 损失层的输出0默认权重为1
        if self.base.layer_param.loss_weight.is_empty() {
            self.base.layer_param.loss_weight.push(1.);
        }
        let (softmax_bottom, softmax_top) = self.softmax_vecs(bottom);
        self.softmax.setup(&softmax_bottom, &softmax_top)?;

        let loss_param = &self.base.layer_param.loss_param;
        self.ignore_label = loss_param.ignore_label;
        if loss_param.normalization.is_none() && loss_param.normalize.is_some() {
            log::debug!(
                "{}：normalize已弃用，请改用normalization",
                self.base.layer_param.name
            );
        }
        self.normalization = loss_param.normalization_mode();
        Ok(())
    }

    fn reshape(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<(), LayerError> {
        // 形状检查全部先于缓冲区的调整
        {
            let data = bottom[0].borrow();
            let label = bottom[1].borrow();
            if data.shape().first() != label.shape().first() {
                return Err(LayerError::shape_mismatch(
                    &data.shape()[..data.num_axes().min(1)],
                    &label.shape()[..label.num_axes().min(1)],
                    "数据与标签的第0轴必须相同",
                ));
            }
            let axis = data.canonical_axis_index(self.base.layer_param.softmax_param.axis)?;
            let outer_inner = data.count_range(0, axis) * data.count_from(axis + 1);
            if outer_inner != label.count() {
                return Err(LayerError::shape_mismatch(
                    &[outer_inner],
                    &[label.count()],
                    "标签个数必须等于outer * inner\
                     （如得分为(N, C, H, W)、softmax轴为1时标签应有N*H*W个）",
                ));
            }
        }
        top[0].borrow_mut().reshape(&[]);

        let (softmax_bottom, softmax_top) = self.softmax_vecs(bottom);
        self.softmax.reshape(&softmax_bottom, &softmax_top)?;
        self.softmax_axis = self.softmax.softmax_axis();
        let data = bottom[0].borrow();
        self.outer_num = data.count_range(0, self.softmax_axis);
        self.inner_num = data.count_from(self.softmax_axis + 1);
        if let Some(prob_top) = top.get(1) {
            prob_top.borrow_mut().reshape_like(&data);
        }
        Ok(())
    }

    fn forward_cpu(&mut self, bottom: &[SharedBlob], top: &[SharedBlob]) -> Result<(), LayerError> {
        let (softmax_bottom, softmax_top) = self.softmax_vecs(bottom);
        self.softmax.forward(&softmax_bottom, &softmax_top)?;

        let prob = self.prob.borrow();
        let labels = bottom[1].borrow();
        let num_classes = prob.shape()[self.softmax_axis];
        let dim = num_classes * self.inner_num;
        let prob_data = prob.data();
        let mut loss = 0.;
        let mut count = 0;
        for i in 0..self.outer_num {
            for j in 0..self.inner_num {
                let Some(label) = self.label_at(labels.data(), i * self.inner_num + j, num_classes)?
                else {
                    continue;
                };
                let p = prob_data[i * dim + label * self.inner_num + j];
                loss -= p.max(f32::MIN_POSITIVE).ln();
                count += 1;
            }
        }
        let normalizer = self.get_normalizer(self.normalization, Some(count));
        top[0].borrow_mut().data_mut()[0] = loss / normalizer;
        if let Some(prob_top) = top.get(1) {
            prob_top.borrow_mut().share_data(&prob)?;
        }
        Ok(())
    }

    fn backward_cpu(
        &mut self,
        top: &[SharedBlob],
        propagate_down: &[bool],
        bottom: &[SharedBlob],
    ) -> Result<(), LayerError> {
        if propagate_down[1] {
            return Err(LayerError::UnsupportedGradient {
                layer_type: self.layer_type(),
                bottom_index: 1,
            });
        }
        if !propagate_down[0] {
            return Ok(());
        }
        let prob = self.prob.borrow();
        let labels = bottom[1].borrow();
        let mut bottom = bottom[0].borrow_mut();
        bottom.set_diff(prob.data())?;
        let bottom_diff = bottom.diff_mut();
        let num_classes = prob.shape()[self.softmax_axis];
        let dim = num_classes * self.inner_num;
        let mut count = 0;
        for i in 0..self.outer_num {
            for j in 0..self.inner_num {
                let position = i * dim + j;
                match self.label_at(labels.data(), i * self.inner_num + j, num_classes)? {
                    None => {
                        for c in 0..num_classes {
                            bottom_diff[position + c * self.inner_num] = 0.;
                        }
                    }
                    Some(label) => {
                        bottom_diff[position + label * self.inner_num] -= 1.;
                        count += 1;
                    }
                }
            }
        }
        let loss_weight =
            top[0].borrow().diff()[0] / self.get_normalizer(self.normalization, Some(count));
        math::scal(loss_weight, bottom_diff);
        Ok(())
    }
}
