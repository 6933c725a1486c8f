use super::*;
use crate::assert_err;
use crate::errors::LayerError;
use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn geometry_2d(kernel: usize, pad: usize, stride: usize, dilation: usize) -> ConvGeometry {
    ConvGeometry {
        kernel_shape: vec![kernel, kernel],
        pad: vec![pad, pad],
        stride: vec![stride, stride],
        dilation: vec![dilation, dilation],
    }
}

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

// ==================== 矩阵运算 ====================

#[test]
fn test_gemm_no_trans() {
    // [1 2 3]   [1 2]   [22 28]
    // [4 5 6] x [3 4] = [49 64]
    //           [5 6]
    let a = [1., 2., 3., 4., 5., 6.];
    let b = [1., 2., 3., 4., 5., 6.];
    let mut c = [1., 1., 1., 1.];
    gemm(Transpose::NoTrans, Transpose::NoTrans, 2, 2, 3, 1., &a, &b, 0., &mut c).unwrap();
    assert_eq!(c, [22., 28., 49., 64.]);

    // beta = 1 时累加
    gemm(Transpose::NoTrans, Transpose::NoTrans, 2, 2, 3, 0.5, &a, &b, 1., &mut c).unwrap();
    assert_eq!(c, [33., 42., 73.5, 96.]);
}

#[test]
fn test_gemm_trans() {
    // A存储为3x2，A^T为2x3；B存储为2x3，B^T为3x2
    let a_t = [1., 4., 2., 5., 3., 6.];
    let b_t = [1., 3., 5., 2., 4., 6.];
    let mut c = [0.; 4];
    gemm(Transpose::Trans, Transpose::Trans, 2, 2, 3, 1., &a_t, &b_t, 0., &mut c).unwrap();
    assert_eq!(c, [22., 28., 49., 64.]);
}

#[test]
fn test_gemm_outer_product() {
    // k = 1 时即外积，用于广播
    let ones = [1., 1., 1.];
    let values = [2., -1.];
    let mut c = [0.; 6];
    gemm(Transpose::NoTrans, Transpose::NoTrans, 3, 2, 1, 1., &ones, &values, 0., &mut c).unwrap();
    assert_eq!(c, [2., -1., 2., -1., 2., -1.]);
}

#[test]
fn test_gemm_insufficient_data() {
    let mut c = [0.; 4];
    assert_err!(
        gemm(Transpose::NoTrans, Transpose::NoTrans, 2, 2, 3, 1., &[1.; 5], &[1.; 6], 0., &mut c),
        LayerError::ShapeMismatch { .. }
    );
}

#[test]
fn test_gemv() {
    let a = [1., 2., 3., 4., 5., 6.];
    let mut y = [0.; 2];
    gemv(Transpose::NoTrans, 2, 3, 1., &a, &[1., 1., 1.], 0., &mut y).unwrap();
    assert_eq!(y, [6., 15.]);

    let mut y = [1.; 3];
    gemv(Transpose::Trans, 2, 3, 2., &a, &[1., -1.], 1., &mut y).unwrap();
    assert_eq!(y, [-5., -5., -5.]);
}

// ==================== 逐元素运算 ====================

#[test]
fn test_elementwise() {
    let x = [1., 2., 3.];
    let mut y = [1., 1., 1.];
    axpy(2., &x, &mut y);
    assert_eq!(y, [3., 5., 7.]);
    axpby(1., &x, -1., &mut y);
    assert_eq!(y, [-2., -3., -4.]);
    scale(0.5, &x, &mut y);
    assert_eq!(y, [0.5, 1., 1.5]);
    scal(2., &mut y);
    assert_eq!(y, [1., 2., 3.]);
    add_scalar(1., &mut y);
    assert_eq!(y, [2., 3., 4.]);
    powx_assign(&mut y, 2.);
    for (a, b) in y.iter().zip([4., 9., 16.]) {
        assert_abs_diff_eq!(*a, b, epsilon = 1e-5);
    }
    powx(&[4., 9.], 0.5, &mut y[..2]);
    assert_abs_diff_eq!(y[0], 2., epsilon = 1e-6);
    assert_abs_diff_eq!(y[1], 3., epsilon = 1e-6);
    y = [2., 3., 16.];
    mul(&x, &[2., 2., 2.], &mut y);
    assert_eq!(y, [2., 4., 6.]);
    mul_assign(&x, &mut y);
    assert_eq!(y, [2., 8., 18.]);
    div_assign(&mut y, &[2., 4., 6.]);
    assert_eq!(y, [1., 2., 3.]);
    div(&x, &[1., 4., 6.], &mut y);
    assert_eq!(y, [1., 0.5, 0.5]);
    set(7., &mut y);
    assert_eq!(y, [7., 7., 7.]);
    copy(&x, &mut y);
    assert_eq!(y, x);

    let mut e = [0., 1.];
    exp_assign(&mut e);
    assert_abs_diff_eq!(e[1], std::f32::consts::E, epsilon = 1e-6);
    assert_eq!(dot(&x, &x), 14.);
}

#[test]
fn test_strided_dot() {
    // 取下标 0, 2, 4
    let x = [1., 0., 2., 0., 3.];
    let y = [1., 9., 1., 9., 1.];
    assert_eq!(strided_dot(3, &x, 2, &y, 2), 6.);
    assert_eq!(strided_dot(2, &x, 2, &y, 2), 3.);
}

// ==================== 卷积几何与im2col ====================

#[test]
fn test_output_shape() {
    assert_eq!(geometry_2d(3, 0, 1, 1).output_shape(&[5, 5]).unwrap(), vec![3, 3]);
    assert_eq!(geometry_2d(3, 1, 1, 1).output_shape(&[5, 5]).unwrap(), vec![5, 5]);
    assert_eq!(geometry_2d(3, 1, 2, 1).output_shape(&[5, 6]).unwrap(), vec![3, 3]);
    // 空洞为2时3x3核的有效范围为5
    assert_eq!(geometry_2d(3, 0, 1, 2).output_shape(&[7, 5]).unwrap(), vec![3, 1]);
    // 核比输入大
    assert_err!(
        geometry_2d(5, 0, 1, 1).output_shape(&[3, 3]),
        LayerError::Configuration(_)
    );
    assert_err!(
        geometry_2d(3, 0, 1, 1).output_shape(&[3]),
        LayerError::ShapeMismatch { .. }
    );
}

#[test]
fn test_im2col_known_values() {
    // 1个通道的3x3图像，2x2核，步长1，无填充
    let im: Vec<f32> = (1..=9).map(|x| x as f32).collect();
    let geometry = geometry_2d(2, 0, 1, 1);
    let mut col = vec![0.; 4 * 4];
    im2col(&im, 1, 3, 3, &geometry, &mut col).unwrap();
    #[rustfmt::skip]
    let expected = [
        1., 2., 4., 5.,
        2., 3., 5., 6.,
        4., 5., 7., 8.,
        5., 6., 8., 9.,
    ];
    assert_eq!(col, expected);
}

#[test]
fn test_im2col_with_padding() {
    // 1x1图像，3x3核，填充1：只有中心位置取到图像值
    let geometry = geometry_2d(3, 1, 1, 1);
    let mut col = vec![-1.; 9];
    im2col(&[5.], 1, 1, 1, &geometry, &mut col).unwrap();
    assert_eq!(col, [0., 0., 0., 0., 5., 0., 0., 0., 0.]);
}

#[test]
fn test_im2col_nd_matches_2d() {
    let mut rng = StdRng::seed_from_u64(7);
    for geometry in [
        geometry_2d(3, 1, 2, 1),
        geometry_2d(2, 0, 1, 2),
        geometry_2d(3, 2, 3, 1),
    ] {
        let im = random_vec(&mut rng, 2 * 6 * 5);
        let col_count: usize = geometry.col_shape(&[2, 6, 5]).unwrap().iter().product();
        let mut col_2d = vec![0.; col_count];
        let mut col_nd = vec![0.; col_count];
        im2col(&im, 2, 6, 5, &geometry, &mut col_2d).unwrap();
        im2col_nd(&im, &[2, 6, 5], &geometry, &mut col_nd).unwrap();
        assert_eq!(col_2d, col_nd);

        let mut im_2d = vec![0.; im.len()];
        let mut im_nd = vec![0.; im.len()];
        col2im(&col_2d, 2, 6, 5, &geometry, &mut im_2d).unwrap();
        col2im_nd(&col_2d, &[2, 6, 5], &geometry, &mut im_nd).unwrap();
        for (a, b) in im_2d.iter().zip(&im_nd) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }
}

#[test]
fn test_col2im_is_adjoint_of_im2col() {
    // <im2col(x), y> == <x, col2im(y)>，三维空间轴
    let mut rng = StdRng::seed_from_u64(11);
    let geometry = ConvGeometry {
        kernel_shape: vec![2, 3, 2],
        pad: vec![1, 0, 1],
        stride: vec![1, 2, 2],
        dilation: vec![1, 1, 2],
    };
    let im_shape = [2, 4, 5, 4];
    let col_count: usize = geometry.col_shape(&im_shape).unwrap().iter().product();
    let x = random_vec(&mut rng, im_shape.iter().product());
    let y = random_vec(&mut rng, col_count);

    let mut col = vec![0.; col_count];
    im2col_nd(&x, &im_shape, &geometry, &mut col).unwrap();
    let mut im = vec![1.; x.len()];
    col2im_nd(&y, &im_shape, &geometry, &mut im).unwrap();
    assert_abs_diff_eq!(dot(&col, &y), dot(&x, &im), epsilon = 1e-4);
}

#[test]
fn test_im2col_buffer_too_small() {
    let geometry = geometry_2d(2, 0, 1, 1);
    let mut col = vec![0.; 15];
    assert_err!(
        im2col(&[0.; 9], 1, 3, 3, &geometry, &mut col),
        LayerError::ShapeMismatch { .. }
    );
    assert_err!(
        im2col(&[0.; 9], 1, 3, 3, &ConvGeometry::default(), &mut col),
        LayerError::Configuration(_) | LayerError::ShapeMismatch { .. }
    );
}
