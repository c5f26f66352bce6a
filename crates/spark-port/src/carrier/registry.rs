use parking_lot::Mutex;

use super::{Carrier, HEADER_LEN, TcpCarrier, TextCarrier, UdpCarrier};

/// 进程级 Carrier 注册表。
///
/// # 教案式注释
/// - **意图 (Why)**：可用 Carrier 的集合是进程级状态，但以显式对象注入 Face 与 Protocol，
///   测试可以构造只含部分 Carrier 的注册表；
/// - **逻辑 (How)**：模板列表受一把互斥锁保护，`register_carrier` 是唯一的修改入口；
///   查找时在锁内克隆出新实例，锁不跨越任何 IO；
/// - **契约 (What)**：`choose_carrier` 按注册顺序尝试 `check_header`，第一个匹配者胜出，
///   返回的实例已根据连接头调整参数。
#[derive(Debug, Default)]
pub struct CarrierRegistry {
    templates: Mutex<Vec<Box<dyn Carrier>>>,
}

impl CarrierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 `tcp`（含别名 `fast_tcp`）、`text`、`text_ack`、`udp`。
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_carrier(Box::new(TcpCarrier::new(true)));
        registry.register_carrier(Box::new(TextCarrier::new(false)));
        registry.register_carrier(Box::new(TextCarrier::new(true)));
        registry.register_carrier(Box::new(UdpCarrier::new()));
        registry
    }

    /// 注册模板；同名模板被替换并保持原有顺序。
    pub fn register_carrier(&self, carrier: Box<dyn Carrier>) {
        let mut templates = self.templates.lock();
        match templates
            .iter_mut()
            .find(|existing| existing.name() == carrier.name())
        {
            Some(existing) => *existing = carrier,
            None => templates.push(carrier),
        }
    }

    pub fn lookup_carrier(&self, name: &str) -> Option<Box<dyn Carrier>> {
        self.templates
            .lock()
            .iter()
            .find_map(|template| template.create_named(name))
    }

    pub fn choose_carrier(&self, header: &[u8; HEADER_LEN]) -> Option<Box<dyn Carrier>> {
        let mut carrier = self
            .templates
            .lock()
            .iter()
            .find(|template| template.check_header(header))
            .map(|template| template.create())?;
        carrier.set_parameters(header);
        Some(carrier)
    }

    pub fn names(&self) -> Vec<String> {
        self.templates
            .lock()
            .iter()
            .map(|template| template.name().to_owned())
            .collect()
    }
}
