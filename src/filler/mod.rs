/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : 可学习参数的初始化器（filler）。
 *                 xavier/msra按参数blob的形状推算fan_in与fan_out：
 *                 fan_in = count / shape[0]，fan_out = count / shape[1]。
 */

use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::blob::Blob;
use crate::errors::LayerError;
use crate::proto::{FillerParameter, FillerType, VarianceNorm};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone)]
pub struct Filler {
    param: FillerParameter,
}

impl Filler {
    pub fn new(param: &FillerParameter) -> Filler {
        Filler {
            param: param.clone(),
        }
    }

    /// 用线程随机数发生器填充`blob`的`data`平面
    pub fn fill(&self, blob: &mut Blob) -> Result<(), LayerError> {
        self.fill_with_rng(blob, &mut rand::thread_rng())
    }

    /// 用指定的随机数发生器填充，便于复现
    pub fn fill_with_rng<R: Rng>(&self, blob: &mut Blob, rng: &mut R) -> Result<(), LayerError> {
        match self.param.filler_type {
            FillerType::Constant => {
                blob.data_mut().fill(self.param.value);
                Ok(())
            }
            FillerType::Uniform => {
                fill_uniform(blob.data_mut(), self.param.min, self.param.max, rng)
            }
            FillerType::Gaussian => {
                fill_gaussian(blob.data_mut(), self.param.mean, self.param.std, rng);
                Ok(())
            }
            FillerType::Xavier => {
                let n = self.fan(blob)?;
                let scale = (3. / n).sqrt();
                fill_uniform(blob.data_mut(), -scale, scale, rng)
            }
            FillerType::Msra => {
                let n = self.fan(blob)?;
                fill_gaussian(blob.data_mut(), 0., (2. / n).sqrt(), rng);
                Ok(())
            }
        }
    }

    /// xavier/msra使用的归一化分母
    fn fan(&self, blob: &Blob) -> Result<f32, LayerError> {
        if blob.num_axes() < 2 || blob.count() == 0 {
            return Err(LayerError::Configuration(format!(
                "{:?}初始化要求参数至少有2个轴且非空，实际形状为{:?}",
                self.param.filler_type,
                blob.shape()
            )));
        }
        let fan_in = (blob.count() / blob.shape()[0]) as f32;
        let fan_out = (blob.count() / blob.shape()[1]) as f32;
        Ok(match self.param.variance_norm {
            VarianceNorm::FanIn => fan_in,
            VarianceNorm::FanOut => fan_out,
            VarianceNorm::Average => (fan_in + fan_out) / 2.,
        })
    }
}

fn fill_uniform<R: Rng>(
    data: &mut [f32],
    min: f32,
    max: f32,
    rng: &mut R,
) -> Result<(), LayerError> {
    if min > max {
        return Err(LayerError::Configuration(format!(
            "均匀分布的下界{min}大于上界{max}"
        )));
    }
    let uniform = Uniform::from(min..=max);
    data.iter_mut().for_each(|x| *x = uniform.sample(rng));
    Ok(())
}

/// Box-Muller变换生成正态分布样本
fn fill_gaussian<R: Rng>(data: &mut [f32], mean: f32, std: f32, rng: &mut R) {
    let mut filled = 0;
    while filled < data.len() {
        // u1取(0, 1]以避免ln(0)
        let u1: f32 = 1. - rng.gen_range(0.0..1.0);
        let u2: f32 = rng.gen_range(0.0..1.0);
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        for z in [r * theta.cos(), r * theta.sin()] {
            if filled < data.len() {
                data[filled] = mean + std * z;
                filled += 1;
            }
        }
    }
}
