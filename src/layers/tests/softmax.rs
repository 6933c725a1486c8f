use approx::assert_abs_diff_eq;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::gradient_checker::GradientChecker;
use super::*;
use crate::layers::SoftmaxLayer;

fn softmax_param(axis: i32) -> LayerParameter {
    let mut param = LayerParameter::new("Softmax");
    param.softmax_param.axis = axis;
    param
}

#[test]
fn test_forward_sums_to_one_per_position() {
    let mut rng = StdRng::seed_from_u64(21);
    let (num, channels, height, width) = (2, 10, 2, 3);
    let bottom = random_blob(&mut rng, &[num, channels, height, width], -3., 3.);
    let top = Blob::shared(&[]);
    let mut layer = SoftmaxLayer::new(softmax_param(1));
    layer.setup(&[bottom.clone()], &[top.clone()]).unwrap();
    layer.forward(&[bottom.clone()], &[top.clone()]).unwrap();
    assert_eq!(top.borrow().shape(), bottom.borrow().shape());

    let (x, y) = (data_of(&bottom), data_of(&top));
    let inner = height * width;
    for n in 0..num {
        for k in 0..inner {
            let index = |c: usize| n * channels * inner + c * inner + k;
            let sum: f32 = (0..channels).map(|c| y[index(c)]).sum();
            assert_abs_diff_eq!(sum, 1., epsilon = 1e-5);
            let denominator: f32 = (0..channels).map(|c| x[index(c)].exp()).sum();
            for c in 0..channels {
                assert_abs_diff_eq!(y[index(c)], x[index(c)].exp() / denominator, epsilon = 1e-5);
            }
        }
    }
}

#[test]
fn test_forward_large_inputs() {
    // 直接求exp会溢出，减去最大值后结果不受整体平移影响
    let bottom = blob_from(&[1000., 1001., 1002., -1000., -1001., -1002.], &[2, 3]);
    let top = Blob::shared(&[]);
    let mut layer = SoftmaxLayer::new(softmax_param(1));
    layer.setup(&[bottom.clone()], &[top.clone()]).unwrap();
    layer.forward(&[bottom.clone()], &[top.clone()]).unwrap();
    let y = data_of(&top);
    assert!(y.iter().all(|p| p.is_finite()));
    let denominator = 1. + (1f32).exp() + (2f32).exp();
    let expected = [1. / denominator, (1f32).exp() / denominator, (2f32).exp() / denominator];
    for c in 0..3 {
        assert_abs_diff_eq!(y[c], expected[c], epsilon = 1e-6);
        assert_abs_diff_eq!(y[3 + c], expected[2 - c], epsilon = 1e-6);
    }
}

#[test]
fn test_negative_axis() {
    let bottom = blob_from(&[0., 0., 2f32.ln(), 0.], &[2, 2]);
    let top = Blob::shared(&[]);
    let mut layer = SoftmaxLayer::new(softmax_param(-1));
    layer.setup(&[bottom.clone()], &[top.clone()]).unwrap();
    assert_eq!(layer.softmax_axis(), 1);
    layer.forward(&[bottom.clone()], &[top.clone()]).unwrap();
    let y = data_of(&top);
    assert_abs_diff_eq!(y[0], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(y[2], 2. / 3., epsilon = 1e-6);
    assert_abs_diff_eq!(y[3], 1. / 3., epsilon = 1e-6);

    // 沿第0轴
    let mut layer = SoftmaxLayer::new(softmax_param(0));
    layer.setup(&[bottom.clone()], &[top.clone()]).unwrap();
    layer.forward(&[bottom.clone()], &[top.clone()]).unwrap();
    let y = data_of(&top);
    assert_abs_diff_eq!(y[0], 1. / 3., epsilon = 1e-6);
    assert_abs_diff_eq!(y[2], 2. / 3., epsilon = 1e-6);
    assert_abs_diff_eq!(y[1], 0.5, epsilon = 1e-6);

    let mut layer = SoftmaxLayer::new(softmax_param(2));
    assert_err!(
        layer.setup(&[bottom.clone()], &[top.clone()]),
        LayerError::Configuration(_)
    );
}

#[test]
fn test_empty_batch() {
    let bottom = Blob::shared(&[0, 4]);
    let top = Blob::shared(&[]);
    let mut layer = SoftmaxLayer::new(softmax_param(1));
    layer.setup(&[bottom.clone()], &[top.clone()]).unwrap();
    layer.forward(&[bottom.clone()], &[top.clone()]).unwrap();
    assert_eq!(top.borrow().count(), 0);
    layer.backward(&[top.clone()], &[true], &[bottom.clone()]).unwrap();
}

#[test]
fn test_gradient() {
    let mut rng = StdRng::seed_from_u64(22);
    let bottom = random_blob(&mut rng, &[2, 4, 2, 3], -2., 2.);
    let top = Blob::shared(&[]);
    let mut layer = SoftmaxLayer::new(softmax_param(1));
    GradientChecker::new(1e-2, 1e-2).check(&mut layer, &[bottom], &[top], &[0], false);
}

#[test]
fn test_in_place_matches_out_of_place() {
    let mut rng = StdRng::seed_from_u64(23);
    let bottom = random_blob(&mut rng, &[3, 5, 2], -2., 2.);
    let top_diff = random_blob(&mut rng, &[3, 5, 2], -1., 1.);

    let top = Blob::shared(&[]);
    let mut layer = SoftmaxLayer::new(softmax_param(1));
    layer.setup(&[bottom.clone()], &[top.clone()]).unwrap();
    layer.forward(&[bottom.clone()], &[top.clone()]).unwrap();
    top.borrow_mut().set_diff(&data_of(&top_diff)).unwrap();
    layer.backward(&[top.clone()], &[true], &[bottom.clone()]).unwrap();
    let (expected_data, expected_diff) = (data_of(&top), diff_of(&bottom));

    let blob = blob_from(&data_of(&bottom), &[3, 5, 2]);
    let mut layer = SoftmaxLayer::new(softmax_param(1));
    layer.setup(&[blob.clone()], &[blob.clone()]).unwrap();
    layer.forward(&[blob.clone()], &[blob.clone()]).unwrap();
    blob.borrow_mut().set_diff(&data_of(&top_diff)).unwrap();
    layer.backward(&[blob.clone()], &[true], &[blob.clone()]).unwrap();
    for (a, b) in data_of(&blob).iter().zip(&expected_data) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-6);
    }
    for (a, b) in diff_of(&blob).iter().zip(&expected_diff) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-6);
    }
}

#[test]
fn test_blob_counts() {
    let bottom = Blob::shared(&[2, 3]);
    let mut layer = SoftmaxLayer::new(softmax_param(1));
    assert_err!(
        layer.setup(&[bottom.clone()], &[Blob::shared(&[]), Blob::shared(&[])]),
        LayerError::Configuration(_)
    );
}
