//! # name：名字服务协作者
//!
//! ## 核心意图（Why）
//! - 端口核心只需要三项能力：按名查询、登记、注销；缓存与一致性属于名字服务自身；
//! - [`MemoryNameService`] 以 `DashMap` 提供进程内实现，供同进程端口互联与测试使用。
//!
//! ## 行为契约（What）
//! - `query_name` 未命中返回 `None`（相当于无效 Contact）；
//! - `register_name` 遇到重名返回 [`PortError::NameInUse`]，不覆盖既有登记；
//! - `unregister_name` 对未登记的名字是空操作。

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::contact::Contact;
use crate::error::{PortError, Result};

/// 名字服务客户端契约。
pub trait NameClient: Send + Sync {
    /// 查询端口名对应的地址。
    fn query_name(&self, name: &str) -> Option<Contact>;

    /// 以 `contact` 登记端口名，返回实际登记的 Contact（名称字段被置为 `name`）。
    fn register_name(&self, name: &str, contact: Contact) -> Result<Contact>;

    /// 注销端口名。
    fn unregister_name(&self, name: &str) -> Result<()>;
}

/// 进程内名字服务。
///
/// # 教案式注释
/// - **意图 (Why)**：多个端口并发打开/关闭时需要原子的登记语义，避免互相覆盖；
/// - **契约 (What)**：以 `Arc<str>` 为键；克隆出的句柄共享同一张表。
#[derive(Clone, Debug, Default)]
pub struct MemoryNameService {
    entries: Arc<DashMap<Arc<str>, Contact>>,
}

impl MemoryNameService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前登记的名字数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl NameClient for MemoryNameService {
    fn query_name(&self, name: &str) -> Option<Contact> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    fn register_name(&self, name: &str, contact: Contact) -> Result<Contact> {
        let contact = contact.with_name(name);
        match self.entries.entry(Arc::from(name)) {
            Entry::Occupied(_) => Err(PortError::NameInUse {
                name: name.to_owned(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(contact.clone());
                tracing::debug!(port = name, contact = %contact, "name registered");
                Ok(contact)
            }
        }
    }

    fn unregister_name(&self, name: &str) -> Result<()> {
        if self.entries.remove(name).is_some() {
            tracing::debug!(port = name, "name unregistered");
        }
        Ok(())
    }
}
