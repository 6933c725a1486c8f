/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : 卷积的patch展开（im2col）及其逆运算（col2im）。
 *                 图像按`[channels, spatial...]`排布，展开后的列矩阵按
 *                 `[channels * ∏kernel, output_spatial...]`排布，卷积即可化为一次矩阵乘法。
 */

use num_integer::Integer;

use crate::errors::LayerError;

/// 卷积在各空间轴上的几何参数
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConvGeometry {
    pub kernel_shape: Vec<usize>,
    pub pad: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
}

impl ConvGeometry {
    pub fn num_spatial_axes(&self) -> usize {
        self.kernel_shape.len()
    }

    /// 单个通道上卷积核覆盖的元素个数
    pub fn kernel_size(&self) -> usize {
        self.kernel_shape.iter().product()
    }

    /// 是否为步长1、无填充的1x1卷积（此时无需展开）
    pub fn is_1x1(&self) -> bool {
        self.kernel_shape.iter().all(|&k| k == 1)
            && self.stride.iter().all(|&s| s == 1)
            && self.pad.iter().all(|&p| p == 0)
    }

    /// 由各空间轴的输入尺寸推出输出尺寸：
    /// `out = floor((in + 2 * pad - dilation * (kernel - 1) - 1) / stride) + 1`
    pub fn output_shape(&self, input_spatial: &[usize]) -> Result<Vec<usize>, LayerError> {
        if input_spatial.len() != self.num_spatial_axes() {
            return Err(LayerError::shape_mismatch(
                &self.kernel_shape,
                input_spatial,
                "输入的空间轴数必须与卷积核一致",
            ));
        }
        input_spatial
            .iter()
            .enumerate()
            .map(|(i, &input_dim)| {
                let kernel_extent = (self.dilation[i] * (self.kernel_shape[i] - 1) + 1) as i64;
                let numerator = input_dim as i64 + 2 * self.pad[i] as i64 - kernel_extent;
                let output_dim = Integer::div_floor(&numerator, &(self.stride[i] as i64)) + 1;
                if output_dim <= 0 {
                    return Err(LayerError::Configuration(format!(
                        "第{i}个空间轴的卷积输出尺寸无效：输入{input_dim}，核{}，填充{}，步长{}，空洞{}",
                        self.kernel_shape[i], self.pad[i], self.stride[i], self.dilation[i]
                    )));
                }
                Ok(output_dim as usize)
            })
            .collect()
    }

    /// 展开后列矩阵的形状`[channels * ∏kernel, output_spatial...]`
    pub fn col_shape(&self, im_shape: &[usize]) -> Result<Vec<usize>, LayerError> {
        let (&channels, spatial) = im_shape.split_first().ok_or_else(|| {
            LayerError::shape_mismatch(&[0], im_shape, "图像形状至少需要包含通道轴")
        })?;
        let mut col_shape = vec![channels * self.kernel_size()];
        col_shape.extend(self.output_shape(spatial)?);
        Ok(col_shape)
    }
}

fn in_range(index: isize, extent: usize) -> bool {
    index >= 0 && (index as usize) < extent
}

fn check_len(len: usize, required: usize, what: &str) -> Result<(), LayerError> {
    if len < required {
        return Err(LayerError::shape_mismatch(&[required], &[len], what));
    }
    Ok(())
}

/// 二维情形的遍历：按列矩阵的存储顺序依次给出`(列下标, 图像下标)`，落在填充区时图像下标为`None`
fn for_each_patch_2d(
    channels: usize,
    height: usize,
    width: usize,
    geometry: &ConvGeometry,
    mut visit: impl FnMut(usize, Option<usize>),
) -> Result<(), LayerError> {
    if geometry.num_spatial_axes() != 2 {
        return Err(LayerError::Configuration(format!(
            "二维im2col需要2个空间轴，实际为{}",
            geometry.num_spatial_axes()
        )));
    }
    let output = geometry.output_shape(&[height, width])?;
    let (output_h, output_w) = (output[0], output[1]);
    let (kernel_h, kernel_w) = (geometry.kernel_shape[0], geometry.kernel_shape[1]);
    let (pad_h, pad_w) = (geometry.pad[0] as isize, geometry.pad[1] as isize);
    let (stride_h, stride_w) = (geometry.stride[0] as isize, geometry.stride[1] as isize);
    let (dilation_h, dilation_w) = (geometry.dilation[0] as isize, geometry.dilation[1] as isize);
    let channel_size = height * width;

    let mut col = 0;
    for channel in 0..channels {
        let channel_offset = channel * channel_size;
        for kernel_row in 0..kernel_h as isize {
            for kernel_col in 0..kernel_w as isize {
                let mut input_row = kernel_row * dilation_h - pad_h;
                for _ in 0..output_h {
                    if !in_range(input_row, height) {
                        for _ in 0..output_w {
                            visit(col, None);
                            col += 1;
                        }
                    } else {
                        let mut input_col = kernel_col * dilation_w - pad_w;
                        for _ in 0..output_w {
                            let im = in_range(input_col, width).then(|| {
                                channel_offset + input_row as usize * width + input_col as usize
                            });
                            visit(col, im);
                            col += 1;
                            input_col += stride_w;
                        }
                    }
                    input_row += stride_h;
                }
            }
        }
    }
    Ok(())
}

/// 二维im2col：`data_im`为`[channels, height, width]`
pub fn im2col(
    data_im: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    geometry: &ConvGeometry,
    data_col: &mut [f32],
) -> Result<(), LayerError> {
    let col_count: usize = geometry.col_shape(&[channels, height, width])?.iter().product();
    check_len(data_im.len(), channels * height * width, "im2col的图像数据不足")?;
    check_len(data_col.len(), col_count, "im2col的列缓冲区不足")?;
    for_each_patch_2d(channels, height, width, geometry, |col, im| {
        data_col[col] = im.map_or(0., |i| data_im[i]);
    })
}

/// 二维col2im：把列矩阵累加回`[channels, height, width]`的图像（图像先被清零）
pub fn col2im(
    data_col: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    geometry: &ConvGeometry,
    data_im: &mut [f32],
) -> Result<(), LayerError> {
    let col_count: usize = geometry.col_shape(&[channels, height, width])?.iter().product();
    check_len(data_col.len(), col_count, "col2im的列数据不足")?;
    check_len(data_im.len(), channels * height * width, "col2im的图像缓冲区不足")?;
    data_im[..channels * height * width].fill(0.);
    for_each_patch_2d(channels, height, width, geometry, |col, im| {
        if let Some(i) = im {
            data_im[i] += data_col[col];
        }
    })
}

/// 任意空间维数的遍历，`im_shape`为`[channels, spatial...]`
fn for_each_patch_nd(
    im_shape: &[usize],
    geometry: &ConvGeometry,
    mut visit: impl FnMut(usize, Option<usize>),
) -> Result<(), LayerError> {
    let num_axes = geometry.num_spatial_axes();
    let col_shape = geometry.col_shape(im_shape)?;
    let kernel = &geometry.kernel_shape;
    let kernel_size = geometry.kernel_size();

    let mut d_offset = vec![0usize; num_axes];
    let mut d_iter = vec![0usize; num_axes];
    for c_col in 0..col_shape[0] {
        // 当前行对应卷积核内的哪个位置
        let mut offset = c_col;
        for d_i in (0..num_axes).rev() {
            if d_i < num_axes - 1 {
                offset /= kernel[d_i + 1];
            }
            d_offset[d_i] = offset % kernel[d_i];
        }
        d_iter.fill(0);
        loop {
            let mut index_col = c_col;
            let mut index_im = c_col / kernel_size;
            let mut is_padding = false;
            for d_i in 0..num_axes {
                let d = d_iter[d_i];
                let d_im = (d * geometry.stride[d_i]) as isize - geometry.pad[d_i] as isize
                    + (d_offset[d_i] * geometry.dilation[d_i]) as isize;
                is_padding |= !in_range(d_im, im_shape[d_i + 1]);
                index_col = index_col * col_shape[d_i + 1] + d;
                index_im = index_im * im_shape[d_i + 1] + d_im.max(0) as usize;
            }
            visit(index_col, (!is_padding).then_some(index_im));

            // 多维计数器加一，最低位在最后一轴
            let mut incremented = false;
            for d_i in (0..num_axes).rev() {
                if d_iter[d_i] + 1 == col_shape[d_i + 1] {
                    d_iter[d_i] = 0;
                } else {
                    d_iter[d_i] += 1;
                    incremented = true;
                    break;
                }
            }
            if !incremented {
                break;
            }
        }
    }
    Ok(())
}

/// N维im2col：`im_shape`为`[channels, spatial...]`
pub fn im2col_nd(
    data_im: &[f32],
    im_shape: &[usize],
    geometry: &ConvGeometry,
    data_col: &mut [f32],
) -> Result<(), LayerError> {
    let col_count: usize = geometry.col_shape(im_shape)?.iter().product();
    check_len(data_im.len(), im_shape.iter().product(), "im2col_nd的图像数据不足")?;
    check_len(data_col.len(), col_count, "im2col_nd的列缓冲区不足")?;
    for_each_patch_nd(im_shape, geometry, |col, im| {
        data_col[col] = im.map_or(0., |i| data_im[i]);
    })
}

/// N维col2im：把列矩阵累加回图像（图像先被清零）
pub fn col2im_nd(
    data_col: &[f32],
    im_shape: &[usize],
    geometry: &ConvGeometry,
    data_im: &mut [f32],
) -> Result<(), LayerError> {
    let col_count: usize = geometry.col_shape(im_shape)?.iter().product();
    let im_count: usize = im_shape.iter().product();
    check_len(data_col.len(), col_count, "col2im_nd的列数据不足")?;
    check_len(data_im.len(), im_count, "col2im_nd的图像缓冲区不足")?;
    data_im[..im_count].fill(0.);
    for_each_patch_nd(im_shape, geometry, |col, im| {
        if let Some(i) = im {
            data_im[i] += data_col[col];
        }
    })
}
