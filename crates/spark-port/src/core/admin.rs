//! 管理命令（`a`）的词汇表：`help`、`ver`、`add`、`del`、`list`、`prop`。
//!
//! 请求与回复都是 [`Bottle`]；关键字既可以是词汇也可以是字符串。

use super::PortCore;
use crate::bottle::{Bottle, Value};
use crate::contact::Route;

const HELP: &[&str] = &[
    "[help]                  # give this help",
    "[ver]                   # report protocol version information",
    "[add] $portname         # add an output connection",
    "[add] $portname $car    # add an output with a given protocol",
    "[del] $portname         # remove an input or output connection",
    "[list] [in]             # list input connections",
    "[list] [out]            # list output connections",
    "[list] [in]  $portname  # give details for input",
    "[list] [out] $portname  # give details for output",
    "[prop] [get]            # get all user-defined properties",
    "[prop] [get] $prop      # get a user-defined property",
    "[prop] [set] $prop $val # set a user-defined property",
];

fn fail(reason: &str) -> Bottle {
    let mut reply = Bottle::new();
    reply.add_vocab("fail").push(reason);
    reply
}

fn status(ok: bool, message: String) -> Bottle {
    let mut reply = Bottle::new();
    reply.push(if ok { 0i32 } else { -1i32 }).push(message);
    reply
}

fn word(request: &Bottle, index: usize) -> Option<String> {
    request.get(index).and_then(Value::as_word)
}

impl PortCore {
    /// 处理一条管理命令并返回回复。
    pub(crate) async fn admin(&self, request: &Bottle) -> Bottle {
        let command = word(request, 0).unwrap_or_default();
        tracing::debug!(port = %self.name(), request = %request, "admin command");
        match command.as_str() {
            "help" => {
                let mut reply = Bottle::new();
                reply.add_vocab("many");
                for line in HELP {
                    reply.push(*line);
                }
                reply
            }
            "ver" => {
                let mut reply = Bottle::new();
                reply.add_vocab("ver").push(1i32).push(2i32).push(3i32);
                reply
            }
            "add" => {
                let Some(target) = word(request, 1) else {
                    return fail("add needs a port name");
                };
                let carrier = word(request, 2);
                match self.add_output(&target, carrier.as_deref()).await {
                    Ok(message) => status(true, message),
                    Err(err) => status(false, err.to_string()),
                }
            }
            "del" => {
                let Some(target) = word(request, 1) else {
                    return fail("del needs a port name");
                };
                let output = self.remove_output_with(&target, false).await;
                let input = self.remove_input_with(&target, false).await;
                match (output, input) {
                    (Ok(message), _) | (Err(_), Ok(message)) => status(true, message),
                    (Err(err), Err(_)) => status(false, err.to_string()),
                }
            }
            "list" => self.admin_list(request),
            "prop" => self.admin_prop(request),
            _ => fail("send [help] for list of valid commands"),
        }
    }

    fn admin_list(&self, request: &Bottle) -> Bottle {
        let routes = match word(request, 1).as_deref() {
            Some("in") => self.input_routes(),
            Some("out") => self.output_routes(),
            _ => return fail("list needs [in] or [out]"),
        };
        let outgoing = word(request, 1).as_deref() == Some("out");
        let peer = |route: &Route| {
            if outgoing {
                route.to().to_owned()
            } else {
                route.from().to_owned()
            }
        };
        let mut reply = Bottle::new();
        match word(request, 2) {
            None => {
                for route in &routes {
                    reply.push(peer(route));
                }
            }
            Some(target) => {
                if let Some(route) = routes.iter().find(|route| peer(route) == target) {
                    reply
                        .add_pair("from", route.from())
                        .add_pair("to", route.to())
                        .add_pair("carrier", route.carrier());
                }
            }
        }
        reply
    }

    fn admin_prop(&self, request: &Bottle) -> Bottle {
        match (word(request, 1).as_deref(), word(request, 2)) {
            (Some("get"), None) => self.properties(),
            (Some("get"), Some(key)) => {
                let mut reply = Bottle::new();
                if let Some(value) = self.property(&key) {
                    reply.push(value);
                }
                reply
            }
            (Some("set"), Some(key)) => match request.get(3) {
                Some(value) => {
                    self.set_property(&key, value.clone());
                    let mut reply = Bottle::new();
                    reply.add_vocab("ok");
                    reply
                }
                None => fail("prop set needs a value"),
            },
            _ => fail("prop needs [get] or [set]"),
        }
    }
}
