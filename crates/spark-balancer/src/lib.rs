//! # spark-balancer
//!
//! ## 定位与职责（Why）
//! - 把 `scheme://namespace/endpoint` 形式的拨号地址接到 `spark-registry` 的发现快照上，
//!   并把每份快照整体交给 RPC 运行时的连接；
//! - 提供按权重展开的轮询选路器，运行时在就绪集合变化时整体重建。
//!
//! ## 模块关系（Where）
//! - `target`：拨号地址解析；
//! - `resolver`：scheme 注册表、共享监听缓存与首个快照的有界等待；
//! - `conn`：地址集合接收者契约以及一个基于选路器的最小实现；
//! - `picker`：加权轮询选路器与热替换槽位。

pub mod conn;

/// 构建与选路两条路径上的错误类型。
pub mod error;

pub mod picker;
pub mod resolver;
pub mod target;

pub use conn::{Address, AddressBalancer, ClientConn};
pub use error::{BalancerError, PickError};
pub use picker::{PickerSlot, WeightedRoundRobinPicker};
pub use resolver::{ResolverBridge, ResolverHandle, ResolverRegistry};
pub use target::DialTarget;
