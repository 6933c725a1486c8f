use super::Blob;
use crate::assert_err;
use crate::errors::LayerError;
use std::rc::Rc;

#[test]
fn test_new_and_count() {
    let blob = Blob::new(&[2, 3, 4, 5]);
    assert_eq!(blob.num_axes(), 4);
    assert_eq!(blob.count(), 120);
    assert_eq!(blob.count_range(1, 3), 12);
    assert_eq!(blob.count_from(2), 20);
    assert_eq!(blob.count_from(4), 1);
    assert!(blob.data().iter().all(|&x| x == 0.));
    assert!(blob.diff().iter().all(|&x| x == 0.));

    // 标量
    let scalar = Blob::new(&[]);
    assert_eq!(scalar.count(), 1);
    assert_eq!(scalar.num_axes(), 0);
}

#[test]
fn test_canonical_axis_index() {
    let blob = Blob::new(&[2, 3, 4]);
    assert_eq!(blob.canonical_axis_index(-1).unwrap(), 2);
    assert_eq!(blob.canonical_axis_index(0).unwrap(), 0);
    assert_eq!(blob.shape_at(-2).unwrap(), 3);
    assert_err!(blob.canonical_axis_index(3), LayerError::Configuration(_));
    assert_err!(blob.canonical_axis_index(-4), LayerError::Configuration(_));
}

#[test]
fn test_reshape_keeps_data_when_count_unchanged() {
    let mut blob = Blob::from_data(&[1., 2., 3., 4., 5., 6.], &[2, 3]).unwrap();
    blob.reshape(&[3, 2]);
    assert_eq!(blob.shape(), &[3, 2]);
    assert_eq!(blob.data(), &[1., 2., 3., 4., 5., 6.]);

    blob.reshape(&[4, 2]);
    assert_eq!(blob.count(), 8);
    assert!(blob.data().iter().all(|&x| x == 0.));
    assert_eq!(blob.diff().len(), 8);
}

#[test]
fn test_set_data_length_mismatch() {
    let mut blob = Blob::new(&[2, 2]);
    assert_err!(blob.set_data(&[1., 2., 3.]), LayerError::ShapeMismatch { .. });
    assert_err!(Blob::from_data(&[1.], &[2]), LayerError::ShapeMismatch { .. });
}

#[test]
fn test_share_data_is_copy_on_write() {
    let source = Blob::from_data(&[1., 2., 3.], &[3]).unwrap();
    let mut mirror = Blob::new(&[3]);
    mirror.share_data(&source).unwrap();
    assert!(mirror.shares_data_with(&source));
    assert_eq!(mirror.data(), &[1., 2., 3.]);

    // 写入共享方时复制出自己的一份，原blob不受影响
    let mut source = source;
    source.data_mut()[0] = 10.;
    assert!(!mirror.shares_data_with(&source));
    assert_eq!(mirror.data(), &[1., 2., 3.]);
    assert_eq!(source.data(), &[10., 2., 3.]);
}

#[test]
fn test_shared_handle_identity() {
    let a = Blob::shared(&[1, 2]);
    let b = Rc::clone(&a);
    let c = Blob::shared(&[1, 2]);
    assert!(Rc::ptr_eq(&a, &b));
    assert!(!Rc::ptr_eq(&a, &c));
}
