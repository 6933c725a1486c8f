//! # Blob Layers
//!
//! 在稠密的行主序`blob`（数据平面 + 梯度平面）上实现三种神经网络层的前向与反向计算：
//! 批归一化（`BatchNorm`）、N维分组卷积（`Convolution`）以及softmax与多分类交叉熵合并的
//! 损失层（`SoftmaxWithLoss`）。各层均通过`Layer`特性以统一的`setup`/`forward`/`backward`
//! 接口调用，并支持原地计算（输入与输出为同一blob）、参数梯度累加与数值边界保护。
//!

pub mod blob;
pub mod errors;
pub mod filler;
pub mod layers;
pub mod math;
pub mod proto;
pub mod utils;

pub use blob::{Blob, SharedBlob};
pub use errors::LayerError;
pub use layers::{
    BatchNormLayer, ConvolutionLayer, Layer, LayerEnum, SoftmaxLayer, SoftmaxWithLossLayer,
    create_layer,
};
pub use proto::LayerParameter;
