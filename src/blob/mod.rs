/*
 * @Author       : 老董
 * @Date         : 2026-10-19
 * @Description  : Blob：层之间传递数据的稠密缓冲区。
 *                 每个blob持有形状相同的两个平面：`data`（前向值）与`diff`（反向梯度），
 *                 底层均为扁平的f32数组，第0轴约定为batch轴。
 */

use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::LayerError;

#[cfg(test)]
mod tests;

/// 层与层之间共享的blob句柄。
/// 同一个句柄同时出现在某层的输入与输出中即表示原地（in-place）计算，可用`Rc::ptr_eq`识别。
pub type SharedBlob = Rc<RefCell<Blob>>;

/// 稠密缓冲区
///
/// 两个平面用`Rc`持有，以便`share_data`零拷贝共享存储；
/// 写入时通过`Rc::make_mut`做写时复制，共享的另一方不会被意外改写。
#[derive(Debug, Clone, Default)]
pub struct Blob {
    shape: Vec<usize>,
    data: Rc<Vec<f32>>,
    diff: Rc<Vec<f32>>,
}

impl Blob {
    /// 创建一个`data`与`diff`全为0的blob。`shape`为`[]`时表示标量（元素个数为1）
    pub fn new(shape: &[usize]) -> Blob {
        let count = shape.iter().product();
        Blob {
            shape: shape.to_vec(),
            data: Rc::new(vec![0.; count]),
            diff: Rc::new(vec![0.; count]),
        }
    }

    /// 用给定数据创建blob，`data`的长度必须等于`shape`中所有元素的乘积
    pub fn from_data(data: &[f32], shape: &[usize]) -> Result<Blob, LayerError> {
        let mut blob = Blob::new(shape);
        blob.set_data(data)?;
        Ok(blob)
    }

    /// 创建一个全0的共享blob
    pub fn shared(shape: &[usize]) -> SharedBlob {
        Blob::new(shape).into_shared()
    }

    pub fn into_shared(self) -> SharedBlob {
        Rc::new(RefCell::new(self))
    }

    /// 改变形状。元素个数不变时保留原有数据，否则两个平面都重新分配并清零
    pub fn reshape(&mut self, shape: &[usize]) {
        let count: usize = shape.iter().product();
        if count != self.count() {
            self.data = Rc::new(vec![0.; count]);
            self.diff = Rc::new(vec![0.; count]);
        }
        self.shape = shape.to_vec();
    }

    pub fn reshape_like(&mut self, other: &Blob) {
        self.reshape(other.shape());
    }

    /*↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓形状相关↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓*/
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// 轴数（阶数），标量为0
    pub fn num_axes(&self) -> usize {
        self.shape.len()
    }

    /// 元素总数
    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// `[start, end)`轴范围内的元素个数
    pub fn count_range(&self, start: usize, end: usize) -> usize {
        self.shape[start.min(end)..end].iter().product()
    }

    /// 从第`start`轴（含）到最后一轴的元素个数
    pub fn count_from(&self, start: usize) -> usize {
        self.shape[start.min(self.shape.len())..].iter().product()
    }

    /// 把可能为负的轴号（-1表示最后一轴）转换为`[0, num_axes)`内的轴号
    pub fn canonical_axis_index(&self, axis: i32) -> Result<usize, LayerError> {
        let num_axes = self.num_axes() as i32;
        if axis < -num_axes || axis >= num_axes {
            return Err(LayerError::Configuration(format!(
                "轴号{axis}超出范围：形状{:?}的合法轴号为[-{num_axes}, {num_axes})",
                self.shape
            )));
        }
        Ok(if axis < 0 {
            (axis + num_axes) as usize
        } else {
            axis as usize
        })
    }

    /// 第`axis`轴的长度，支持负轴号
    pub fn shape_at(&self, axis: i32) -> Result<usize, LayerError> {
        Ok(self.shape[self.canonical_axis_index(axis)?])
    }
    /*↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑形状相关↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑*/

    /*↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓两个平面↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓*/
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        Rc::make_mut(&mut self.data).as_mut_slice()
    }

    pub fn diff(&self) -> &[f32] {
        &self.diff
    }

    pub fn diff_mut(&mut self) -> &mut [f32] {
        Rc::make_mut(&mut self.diff).as_mut_slice()
    }

    /// 同时取得只读的`data`和可写的`diff`
    pub fn data_and_diff_mut(&mut self) -> (&[f32], &mut [f32]) {
        (&self.data, Rc::make_mut(&mut self.diff).as_mut_slice())
    }

    pub fn set_data(&mut self, values: &[f32]) -> Result<(), LayerError> {
        check_len(values.len(), self)?;
        self.data_mut().copy_from_slice(values);
        Ok(())
    }

    pub fn set_diff(&mut self, values: &[f32]) -> Result<(), LayerError> {
        check_len(values.len(), self)?;
        self.diff_mut().copy_from_slice(values);
        Ok(())
    }

    /// 令本blob的`data`平面与`other`共用同一块存储（不拷贝）
    pub fn share_data(&mut self, other: &Blob) -> Result<(), LayerError> {
        check_len(other.count(), self)?;
        self.data = Rc::clone(&other.data);
        Ok(())
    }

    /// 两者的`data`平面是否为同一块存储
    pub fn shares_data_with(&self, other: &Blob) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
    /*↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑两个平面↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑*/
}

fn check_len(len: usize, blob: &Blob) -> Result<(), LayerError> {
    if len != blob.count() {
        return Err(LayerError::shape_mismatch(
            blob.shape(),
            &[len],
            "数据长度必须等于blob的元素个数",
        ));
    }
    Ok(())
}
