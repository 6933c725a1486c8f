use super::*;
use crate::assert_err;
use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn filler(filler_type: FillerType) -> FillerParameter {
    FillerParameter {
        filler_type,
        ..Default::default()
    }
}

fn mean_and_var(data: &[f32]) -> (f32, f32) {
    let n = data.len() as f32;
    let mean = data.iter().sum::<f32>() / n;
    let var = data.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
    (mean, var)
}

#[test]
fn test_constant() {
    let mut blob = Blob::new(&[2, 3]);
    let param = FillerParameter {
        value: 0.25,
        ..Default::default()
    };
    Filler::new(&param).fill(&mut blob).unwrap();
    assert!(blob.data().iter().all(|&x| x == 0.25));
    // diff平面不受影响
    assert!(blob.diff().iter().all(|&x| x == 0.));
}

#[test]
fn test_uniform() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut blob = Blob::new(&[1000]);
    let param = FillerParameter {
        min: -2.,
        max: 3.,
        ..filler(FillerType::Uniform)
    };
    Filler::new(&param).fill_with_rng(&mut blob, &mut rng).unwrap();
    assert!(blob.data().iter().all(|&x| (-2. ..=3.).contains(&x)));
    let (mean, _) = mean_and_var(blob.data());
    assert_abs_diff_eq!(mean, 0.5, epsilon = 0.2);

    let param = FillerParameter {
        min: 1.,
        max: 0.,
        ..filler(FillerType::Uniform)
    };
    assert_err!(Filler::new(&param).fill(&mut blob), LayerError::Configuration(_));
}

#[test]
fn test_gaussian() {
    let mut rng = StdRng::seed_from_u64(2);
    // 奇数个元素：最后一对样本只用一半
    let mut blob = Blob::new(&[4001]);
    let param = FillerParameter {
        mean: 1.,
        std: 2.,
        ..filler(FillerType::Gaussian)
    };
    Filler::new(&param).fill_with_rng(&mut blob, &mut rng).unwrap();
    assert!(blob.data().iter().all(|x| x.is_finite()));
    let (mean, var) = mean_and_var(blob.data());
    assert_abs_diff_eq!(mean, 1., epsilon = 0.15);
    assert_abs_diff_eq!(var, 4., epsilon = 0.4);
}

#[test]
fn test_xavier_bound() {
    let mut rng = StdRng::seed_from_u64(3);
    // fan_in = 4 * 3 * 3 = 36，fan_out = 8 * 3 * 3 = 72
    let mut blob = Blob::new(&[8, 4, 3, 3]);
    for (norm, n) in [
        (VarianceNorm::FanIn, 36.),
        (VarianceNorm::FanOut, 72.),
        (VarianceNorm::Average, 54.),
    ] {
        let param = FillerParameter {
            variance_norm: norm,
            ..filler(FillerType::Xavier)
        };
        Filler::new(&param).fill_with_rng(&mut blob, &mut rng).unwrap();
        let bound = (3f32 / n).sqrt();
        assert!(blob.data().iter().all(|x| x.abs() <= bound));
        assert!(blob.data().iter().any(|x| x.abs() > bound / 2.));
    }
}

#[test]
fn test_msra_variance() {
    let mut rng = StdRng::seed_from_u64(4);
    let mut blob = Blob::new(&[64, 8, 3, 3]);
    Filler::new(&filler(FillerType::Msra))
        .fill_with_rng(&mut blob, &mut rng)
        .unwrap();
    let (mean, var) = mean_and_var(blob.data());
    assert_abs_diff_eq!(mean, 0., epsilon = 0.05);
    // 2 / fan_in = 2 / 72
    assert_abs_diff_eq!(var, 2. / 72., epsilon = 0.004);
}

#[test]
fn test_fan_requires_two_axes() {
    let mut blob = Blob::new(&[5]);
    assert_err!(
        Filler::new(&filler(FillerType::Xavier)).fill(&mut blob),
        LayerError::Configuration(_)
    );
}
