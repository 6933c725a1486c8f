mod softmax;

use rand::rngs::StdRng;
use rand::Rng;

pub use crate::assert_err;
pub use crate::blob::{Blob, SharedBlob};
pub use crate::errors::LayerError;
pub use crate::layers::{Layer, LayerEnum, create_layer};
pub use crate::proto::LayerParameter;

/// 元素在`[low, high)`内均匀随机的共享blob
fn random_blob(rng: &mut StdRng, shape: &[usize], low: f32, high: f32) -> SharedBlob {
    let mut blob = Blob::new(shape);
    blob.data_mut()
        .iter_mut()
        .for_each(|x| *x = rng.gen_range(low..high));
    blob.into_shared()
}

fn blob_from(data: &[f32], shape: &[usize]) -> SharedBlob {
    Blob::from_data(data, shape).unwrap().into_shared()
}

/// 输出数据的拷贝
fn data_of(blob: &SharedBlob) -> Vec<f32> {
    blob.borrow().data().to_vec()
}

fn diff_of(blob: &SharedBlob) -> Vec<f32> {
    blob.borrow().diff().to_vec()
}
