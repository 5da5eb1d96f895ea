//! RPC 运行时一侧的协作契约：地址集合的接收者。

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use spark_registry::Instance;

use crate::{error::PickError, picker::PickerSlot};

/// 交给运行时的一个地址及其权重。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub addr: String,
    pub weight: Option<u32>,
}

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            weight: None,
        }
    }
}

impl From<&Instance> for Address {
    fn from(instance: &Instance) -> Self {
        Self {
            addr: instance.address.clone(),
            weight: instance.weight,
        }
    }
}

impl From<Instance> for Address {
    fn from(instance: Instance) -> Self {
        Self {
            addr: instance.address,
            weight: instance.weight,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// 接收地址集合的连接。
///
/// # 教案式说明
/// - **契约 (What)**：每次调用都携带完整集合，实现必须整体替换而不是合并；
/// - **前置条件**：实现不得在回调内回调解析桥接（调用发生在扇出锁内）。
pub trait ClientConn: Send + Sync + 'static {
    fn update_addresses(&self, addresses: Vec<Address>);
}

/// 以地址本身作为“连接”的最小运行时：收到地址集合即重建加权轮询选路器。
#[derive(Default)]
pub struct AddressBalancer {
    addresses: Mutex<Vec<Address>>,
    picker: PickerSlot<Address>,
}

impl AddressBalancer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 最近一次收到的地址集合。
    pub fn addresses(&self) -> Vec<Address> {
        self.addresses.lock().clone()
    }

    pub fn pick(&self) -> Result<Address, PickError> {
        self.picker.pick()
    }
}

impl ClientConn for AddressBalancer {
    fn update_addresses(&self, addresses: Vec<Address>) {
        self.picker
            .rebuild(addresses.iter().map(|address| (address.clone(), address.weight)));
        *self.addresses.lock() = addresses;
    }
}

impl fmt::Debug for AddressBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressBalancer")
            .field("addresses", &*self.addresses.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_replace_the_whole_set() {
        let conn = AddressBalancer::new();
        conn.update_addresses(vec![Address::new("a:1"), Address::new("b:1")]);
        conn.update_addresses(vec![Address::new("c:1")]);
        assert_eq!(conn.addresses(), vec![Address::new("c:1")]);
        assert_eq!(conn.pick().unwrap(), Address::new("c:1"));

        conn.update_addresses(Vec::new());
        assert_eq!(conn.pick(), Err(PickError::NoConnectionAvailable));
    }

    #[test]
    fn instance_weight_is_carried() {
        let address = Address::from(Instance::new("a:1").with_weight(4));
        assert_eq!(address.weight, Some(4));
        assert_eq!(address.to_string(), "a:1");
    }
}
