//! # 加权轮询选路
//!
//! ## 核心意图（Why）
//! - 运行时每次就绪集合变化都重建选路器，选路器自身只需要在构建时展开权重、选路时推进游标；
//! - [`PickerSlot`] 以 `ArcSwap` 持有当前选路器，重建与选路之间无锁竞争，进行中的调用继续使用旧实例。
//!
//! ## 行为契约（What）
//! - 展开：每个连接按出现顺序重复 `clamp(weight, 1, MAX_WEIGHT)` 次，未给权重按 1 处理；
//! - 游标：初始位置默认在 `[0, len)` 内均匀随机，[`WeightedRoundRobinPicker::with_cursor`] 可固定起点；
//! - 选路：返回游标处的连接并把游标按长度取模前移一位；
//! - 空集合：每次选路都返回 [`PickError::NoConnectionAvailable`]，不阻塞也不 panic。
//!
//! ## 风险与权衡（Trade-offs）
//! - 展开后的长度等于权重之和，权重很大时内存随之线性增长；
//! - 游标是唯一的逐调用锁，临界区只有一次读与一次写。

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::Rng;
use spark_registry::instance::MAX_WEIGHT;

use crate::error::PickError;

/// 一个就绪集合上的加权轮询选路器。
pub struct WeightedRoundRobinPicker<C> {
    expanded: Vec<C>,
    cursor: Mutex<usize>,
}

impl<C: Clone> WeightedRoundRobinPicker<C> {
    /// 以随机起点构建。
    pub fn build<I>(ready: I) -> Self
    where
        I: IntoIterator<Item = (C, Option<u32>)>,
    {
        let expanded = expand(ready);
        let start = if expanded.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..expanded.len())
        };
        Self::from_expanded(expanded, start)
    }

    /// 以固定起点构建；起点按展开长度取模。
    pub fn with_cursor<I>(ready: I, cursor: usize) -> Self
    where
        I: IntoIterator<Item = (C, Option<u32>)>,
    {
        let expanded = expand(ready);
        let start = cursor.checked_rem(expanded.len()).unwrap_or(0);
        Self::from_expanded(expanded, start)
    }

    fn from_expanded(expanded: Vec<C>, start: usize) -> Self {
        Self {
            expanded,
            cursor: Mutex::new(start),
        }
    }

    pub fn pick(&self) -> Result<C, PickError> {
        if self.expanded.is_empty() {
            return Err(PickError::NoConnectionAvailable);
        }
        let mut cursor = self.cursor.lock();
        let picked = self.expanded[*cursor].clone();
        *cursor = (*cursor + 1) % self.expanded.len();
        Ok(picked)
    }

    /// 展开后的长度，即权重之和。
    pub fn len(&self) -> usize {
        self.expanded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expanded.is_empty()
    }
}

impl<C: Clone> Default for WeightedRoundRobinPicker<C> {
    fn default() -> Self {
        Self::from_expanded(Vec::new(), 0)
    }
}

impl<C> fmt::Debug for WeightedRoundRobinPicker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightedRoundRobinPicker")
            .field("len", &self.expanded.len())
            .field("cursor", &*self.cursor.lock())
            .finish()
    }
}

fn expand<C: Clone, I>(ready: I) -> Vec<C>
where
    I: IntoIterator<Item = (C, Option<u32>)>,
{
    let mut expanded = Vec::new();
    for (conn, weight) in ready {
        let copies = weight.unwrap_or(1).clamp(1, MAX_WEIGHT) as usize;
        expanded.extend(std::iter::repeat_n(conn, copies));
    }
    expanded
}

/// 持有当前选路器的热替换槽位。
pub struct PickerSlot<C> {
    current: ArcSwap<WeightedRoundRobinPicker<C>>,
}

impl<C: Clone> PickerSlot<C> {
    /// 初始为空选路器。
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(WeightedRoundRobinPicker::default()),
        }
    }

    /// 按新的就绪集合整体替换选路器。
    pub fn rebuild<I>(&self, ready: I)
    where
        I: IntoIterator<Item = (C, Option<u32>)>,
    {
        self.replace(WeightedRoundRobinPicker::build(ready));
    }

    pub fn replace(&self, picker: WeightedRoundRobinPicker<C>) {
        self.current.store(Arc::new(picker));
    }

    /// 当前选路器的强引用，替换后仍然有效。
    pub fn current(&self) -> Arc<WeightedRoundRobinPicker<C>> {
        self.current.load_full()
    }

    pub fn pick(&self) -> Result<C, PickError> {
        self.current.load().pick()
    }
}

impl<C: Clone> Default for PickerSlot<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for PickerSlot<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickerSlot")
            .field("current", &*self.current.load())
            .finish()
    }
}
