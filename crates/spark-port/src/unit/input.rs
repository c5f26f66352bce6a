use std::sync::Arc;

use spark_transport::InterruptHandle;

use super::{FinishGuard, UnitShared, UnitState};
use crate::bottle::Bottle;
use crate::command::{PortCommand, key};
use crate::core::WeakPortCore;
use crate::error::Result;
use crate::io::{ConnectionReader, ConnectionWriter, PortReader, PortWriter, SizedMessage};
use crate::protocol::Protocol;

const HELP_LINES: &[&str] = &[
    "This is a port.  Here are the commands it responds to:",
    "*       Gives a description of this port",
    "d       Signals the beginning of input for the port's owner",
    "D       The same as \"d\" except replies should be suppressed (\"data-only\")",
    "q       Disconnects",
    "r       Reverse connection type to be a reader",
    "/port   Requests to send output to /port",
    "!/port  Requests to stop sending output to /port",
    "~/port  Requests to stop receiving input from /port",
    "a       Signals the beginning of an administrative message",
    "?       Gives this help",
];

const NOT_UNDERSTOOD_LINES: &[&str] = &[
    "Port command not understood.",
    "Type d to send data to the port's owner.",
    "Type ? for help.",
];

/// 一个输入连接。
///
/// 工作任务循环读取消息：数据投递给端口（队列或处理器），管理命令就地处理并回复，
/// `q`、EOF、错误或关闭时退出。`close()` 立即中断流，可重复调用。
#[derive(Clone)]
pub struct InputUnit {
    shared: Arc<UnitShared>,
    interrupt: InterruptHandle,
}

impl std::fmt::Debug for InputUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputUnit")
            .field("id", &self.shared.id())
            .field("route", &self.shared.route())
            .field("state", &self.shared.state())
            .finish()
    }
}

enum Flow {
    Continue,
    Stop,
}

impl InputUnit {
    pub(crate) fn spawn(protocol: Protocol, shared: Arc<UnitShared>, core: WeakPortCore) -> Self {
        let unit = Self {
            shared: Arc::clone(&shared),
            interrupt: protocol.interrupt_handle(),
        };
        tokio::spawn(run(protocol, shared, core));
        unit
    }

    pub fn shared(&self) -> &Arc<UnitShared> {
        &self.shared
    }

    /// 中断流并等待工作任务退出。
    pub async fn close(&self) {
        self.shared.begin_closing();
        self.interrupt.interrupt();
        self.shared.wait_finished().await;
    }
}

async fn run(mut protocol: Protocol, shared: Arc<UnitShared>, core: WeakPortCore) {
    let finish = FinishGuard(Arc::clone(&shared));
    let interrupt = protocol.interrupt_handle();
    if !shared.transition(UnitState::Running) {
        protocol.close().await;
        return;
    }
    let route = protocol.route().clone();
    tracing::debug!(route = %route, "input unit started");

    loop {
        if !shared.is_running() {
            break;
        }
        let mut reader = match protocol.begin_read().await {
            Ok(reader) => reader,
            Err(err) => {
                if err.is_interrupted() || !shared.is_running() {
                    tracing::debug!(route = %route, "input interrupted");
                } else {
                    tracing::debug!(route = %route, code = err.code(), "input stream ended");
                }
                break;
            }
        };
        let flags = protocol.flags();
        let command = if flags.can_escape {
            match PortCommand::read(&mut reader) {
                Ok(command) => command,
                Err(err) => {
                    tracing::warn!(route = %route, error = %err, "unreadable port command");
                    break;
                }
            }
        } else {
            PortCommand::data("", flags.supports_reply)
        };

        if command.key() == key::REVERSE {
            if let Err(err) = protocol.end_read().await {
                tracing::warn!(route = %route, error = %err, "reverse request not acknowledged");
                break;
            }
            shared.begin_closing();
            match core.upgrade() {
                Some(core) => core.adopt_reversed(protocol).await,
                None => protocol.close().await,
            }
            drop(finish);
            return;
        }

        let flow = match dispatch(&mut protocol, &core, &command, reader, &interrupt).await {
            Ok(flow) => flow,
            Err(err) => {
                if !err.is_interrupted() {
                    tracing::warn!(route = %route, code = err.code(), error = %err, "input connection failed");
                }
                break;
            }
        };
        if let Err(err) = protocol.end_read().await {
            tracing::debug!(route = %route, code = err.code(), "acknowledgement failed");
            break;
        }
        if matches!(flow, Flow::Stop) {
            break;
        }
    }

    shared.begin_closing();
    protocol.close().await;
    tracing::debug!(route = %route, "input unit stopped");
}

async fn dispatch(
    protocol: &mut Protocol,
    core: &WeakPortCore,
    command: &PortCommand,
    mut reader: ConnectionReader,
    interrupt: &InterruptHandle,
) -> Result<Flow> {
    let flags = protocol.flags();
    let text_mode = reader.is_text_mode();
    match command.key() {
        key::DATA | key::DATA_NO_REPLY => {
            let want_reply = command.key() == key::DATA && flags.supports_reply;
            let reader = reader.with_envelope(command.text().to_owned());
            let reply = match core.upgrade() {
                Some(core) => core.deliver(reader, want_reply, interrupt).await,
                None => None,
            };
            if want_reply {
                let writer = reply.unwrap_or_else(|| ConnectionWriter::new(text_mode));
                protocol.reply(&SizedMessage::payload(writer)).await?;
            }
        }
        key::ADMIN => {
            let mut request = Bottle::new();
            request.read(&mut reader)?;
            let response = match core.upgrade() {
                Some(core) => core.admin(&request).await,
                None => {
                    let mut response = Bottle::new();
                    response.add_vocab("fail").push("port is closing");
                    response
                }
            };
            if flags.supports_reply || text_mode {
                let mut writer = ConnectionWriter::new(text_mode);
                response.write(&mut writer)?;
                protocol.reply(&SizedMessage::payload(writer)).await?;
            }
        }
        key::QUIT => return Ok(Flow::Stop),
        key::ADD_OUTPUT | key::REMOVE_OUTPUT | key::REMOVE_INPUT => {
            let Some(core) = core.upgrade() else {
                return Ok(Flow::Stop);
            };
            let target = command.text();
            let outcome = match command.key() {
                key::ADD_OUTPUT => core.add_output(target, None).await,
                key::REMOVE_OUTPUT => core.remove_output_with(target, false).await,
                _ => core.remove_input_with(target, false).await,
            };
            let message = outcome.unwrap_or_else(|err| err.to_string());
            tracing::debug!(route = %protocol.route(), command = %command.key(), "{message}");
            if text_mode {
                protocol.write_lines(&[message]).await?;
            }
        }
        key::DESCRIBE if text_mode => {
            if let Some(core) = core.upgrade() {
                protocol.write_lines(&core.describe()).await?;
            }
        }
        key::HELP | key::HELP_ALT if text_mode => {
            protocol.write_lines(&owned(HELP_LINES)).await?;
        }
        other => {
            if text_mode {
                protocol.write_lines(&owned(NOT_UNDERSTOOD_LINES)).await?;
            } else {
                tracing::debug!(route = %protocol.route(), key = %other, "ignoring port command");
            }
        }
    }
    Ok(Flow::Continue)
}

fn owned(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|line| (*line).to_owned()).collect()
}
