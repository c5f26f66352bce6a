use crate::contact::Route;

/// 一次连接事件：输入或输出连接的建立与移除。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    /// 输入连接为 `true`，输出连接为 `false`。
    pub incoming: bool,
    /// 建立为 `true`，移除为 `false`。
    pub created: bool,
    pub route: Route,
    /// 人类可读的说明，与日志中的文字一致。
    pub message: String,
}

impl PortInfo {
    pub(crate) fn added(incoming: bool, route: &Route) -> Self {
        let verb = if incoming {
            "Receiving input"
        } else {
            "Sending output"
        };
        Self {
            incoming,
            created: true,
            message: format!(
                "{verb} from {} to {} using {}",
                route.from(),
                route.to(),
                route.carrier()
            ),
            route: route.clone(),
        }
    }

    pub(crate) fn removed(incoming: bool, route: &Route) -> Self {
        let verb = if incoming {
            "Removing input"
        } else {
            "Removing output"
        };
        Self {
            incoming,
            created: false,
            message: format!("{verb} from {} to {}", route.from(), route.to()),
            route: route.clone(),
        }
    }
}

/// 连接事件的接收者。
///
/// # 教案式注释
/// - **契约 (What)**：回调在单元或端口的任务中同步调用，调用时不持有端口的任何锁；
///   实现应尽快返回，可在回调中查询端口状态，但不应在其中阻塞等待。
pub trait PortReport: Send + Sync {
    fn report(&self, info: &PortInfo);
}

impl<F> PortReport for F
where
    F: Fn(&PortInfo) + Send + Sync,
{
    fn report(&self, info: &PortInfo) {
        self(info)
    }
}
