/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : 作用于扁平f32数组的BLAS式基本运算。
 *                 矩阵均按行主序解释，逻辑维度由调用方给出；
 *                 矩阵乘法借助ndarray的`general_mat_mul`/`general_mat_vec_mul`完成。
 */

mod im2col;

pub use im2col::{col2im, col2im_nd, im2col, im2col_nd, ConvGeometry};

use ndarray::linalg::{general_mat_mul, general_mat_vec_mul};
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2};

use crate::errors::LayerError;

#[cfg(test)]
mod tests;

/// 矩阵是否转置参与运算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    NoTrans,
    Trans,
}

/// 从扁平切片的前`rows * cols`个元素构建行主序矩阵视图
fn matrix_view(data: &[f32], rows: usize, cols: usize) -> Result<ArrayView2<'_, f32>, LayerError> {
    let len = rows * cols;
    let data = data
        .get(..len)
        .ok_or_else(|| {
            LayerError::shape_mismatch(&[rows, cols], &[data.len()], "矩阵元素不足")
        })?;
    Ok(ArrayView2::from_shape((rows, cols), data)?)
}

fn matrix_view_mut(
    data: &mut [f32],
    rows: usize,
    cols: usize,
) -> Result<ArrayViewMut2<'_, f32>, LayerError> {
    let len = rows * cols;
    let available = data.len();
    let data = data
        .get_mut(..len)
        .ok_or_else(|| {
            LayerError::shape_mismatch(&[rows, cols], &[available], "矩阵元素不足")
        })?;
    Ok(ArrayViewMut2::from_shape((rows, cols), data)?)
}

/// 按转置标记取得`op(A)`的视图，`op(A)`的形状为`rows x cols`
fn op_view(
    trans: Transpose,
    data: &[f32],
    rows: usize,
    cols: usize,
) -> Result<ArrayView2<'_, f32>, LayerError> {
    match trans {
        Transpose::NoTrans => matrix_view(data, rows, cols),
        Transpose::Trans => Ok(matrix_view(data, cols, rows)?.reversed_axes()),
    }
}

fn vector_view(data: &[f32], len: usize) -> Result<ArrayView1<'_, f32>, LayerError> {
    let data = data
        .get(..len)
        .ok_or_else(|| LayerError::shape_mismatch(&[len], &[data.len()], "向量元素不足"))?;
    Ok(ArrayView1::from(data))
}

fn vector_view_mut(data: &mut [f32], len: usize) -> Result<ArrayViewMut1<'_, f32>, LayerError> {
    let available = data.len();
    let data = data
        .get_mut(..len)
        .ok_or_else(|| LayerError::shape_mismatch(&[len], &[available], "向量元素不足"))?;
    Ok(ArrayViewMut1::from(data))
}

/// `C = alpha * op(A) * op(B) + beta * C`
///
/// `op(A)`为`m x k`，`op(B)`为`k x n`，`C`为`m x n`
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) -> Result<(), LayerError> {
    let a = op_view(trans_a, a, m, k)?;
    let b = op_view(trans_b, b, k, n)?;
    let mut c = matrix_view_mut(c, m, n)?;
    general_mat_mul(alpha, &a, &b, beta, &mut c);
    Ok(())
}

/// `y = alpha * op(A) * x + beta * y`
///
/// `A`为`m x n`（未转置时的形状）；不转置时`x`长`n`、`y`长`m`，转置时相反
#[allow(clippy::too_many_arguments)]
pub fn gemv(
    trans_a: Transpose,
    m: usize,
    n: usize,
    alpha: f32,
    a: &[f32],
    x: &[f32],
    beta: f32,
    y: &mut [f32],
) -> Result<(), LayerError> {
    let (x_len, y_len) = match trans_a {
        Transpose::NoTrans => (n, m),
        Transpose::Trans => (m, n),
    };
    let a = op_view(trans_a, a, y_len, x_len)?;
    let x = vector_view(x, x_len)?;
    let mut y = vector_view_mut(y, y_len)?;
    general_mat_vec_mul(alpha, &a, &x, beta, &mut y);
    Ok(())
}

/// `y = alpha * x + y`
pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    y.iter_mut().zip(x).for_each(|(y, &x)| *y += alpha * x);
}

/// `y = alpha * x + beta * y`
pub fn axpby(alpha: f32, x: &[f32], beta: f32, y: &mut [f32]) {
    y.iter_mut()
        .zip(x)
        .for_each(|(y, &x)| *y = alpha * x + beta * *y);
}

/// `y = alpha * x`
pub fn scale(alpha: f32, x: &[f32], y: &mut [f32]) {
    y.iter_mut().zip(x).for_each(|(y, &x)| *y = alpha * x);
}

/// `x = alpha * x`
pub fn scal(alpha: f32, x: &mut [f32]) {
    x.iter_mut().for_each(|x| *x *= alpha);
}

/// 用常数填充
pub fn set(alpha: f32, y: &mut [f32]) {
    y.fill(alpha);
}

pub fn copy(x: &[f32], y: &mut [f32]) {
    y.copy_from_slice(x);
}

/// `y[i] += alpha`
pub fn add_scalar(alpha: f32, y: &mut [f32]) {
    y.iter_mut().for_each(|y| *y += alpha);
}

/// `y[i] = y[i] ^ p`
pub fn powx_assign(y: &mut [f32], p: f32) {
    y.iter_mut().for_each(|y| *y = y.powf(p));
}

/// `y[i] = a[i] ^ p`
pub fn powx(a: &[f32], p: f32, y: &mut [f32]) {
    y.iter_mut().zip(a).for_each(|(y, &a)| *y = a.powf(p));
}

/// `y[i] = exp(y[i])`
pub fn exp_assign(y: &mut [f32]) {
    y.iter_mut().for_each(|y| *y = y.exp());
}

/// `y[i] = a[i] * b[i]`
pub fn mul(a: &[f32], b: &[f32], y: &mut [f32]) {
    y.iter_mut()
        .zip(a.iter().zip(b))
        .for_each(|(y, (&a, &b))| *y = a * b);
}

/// `y[i] = a[i] * y[i]`
pub fn mul_assign(a: &[f32], y: &mut [f32]) {
    y.iter_mut().zip(a).for_each(|(y, &a)| *y *= a);
}

/// `y[i] = a[i] / b[i]`
pub fn div(a: &[f32], b: &[f32], y: &mut [f32]) {
    y.iter_mut()
        .zip(a.iter().zip(b))
        .for_each(|(y, (&a, &b))| *y = a / b);
}

/// `y[i] = y[i] / b[i]`
pub fn div_assign(y: &mut [f32], b: &[f32]) {
    y.iter_mut().zip(b).for_each(|(y, &b)| *y /= b);
}

pub fn dot(x: &[f32], y: &[f32]) -> f32 {
    x.iter().zip(y).map(|(&x, &y)| x * y).sum()
}

/// 带步长的点积：`Σ_i x[i * incx] * y[i * incy]`，共`n`项
pub fn strided_dot(n: usize, x: &[f32], incx: usize, y: &[f32], incy: usize) -> f32 {
    x.iter()
        .step_by(incx)
        .zip(y.iter().step_by(incy))
        .take(n)
        .map(|(&x, &y)| x * y)
        .sum()
}
