// Jackson Coxson

use std::{future::Future, time::Duration};

use crate::IdeviceError;

/// Awaits `fut`, failing with `ConnectionTimeout` once `timeout` elapses
pub(crate) async fn bounded<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, IdeviceError>
where
    F: Future<Output = Result<T, IdeviceError>>,
{
    match timeout {
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .map_err(|_| IdeviceError::ConnectionTimeout)?,
        None => fut.await,
    }
}

/// Renders a plist value as an indented tree for logs
pub fn pretty_print_plist(p: &plist::Value) -> String {
    print_plist(p, 0)
}

/// Renders a plist dictionary as an indented tree for logs
pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    print_dict(dict, 0)
}

fn print_dict(dict: &plist::Dictionary, indent: usize) -> String {
    let inner = dict
        .iter()
        .map(|(k, v)| format!("{}{k}: {}", "  ".repeat(indent + 1), print_plist(v, indent + 1)))
        .collect::<Vec<String>>();
    if inner.is_empty() {
        "{}".to_string()
    } else {
        format!("{{\n{}\n{}}}", inner.join(",\n"), "  ".repeat(indent))
    }
}

fn print_plist(p: &plist::Value, indent: usize) -> String {
    match p {
        plist::Value::Array(arr) => {
            let items = arr
                .iter()
                .map(|v| format!("{}{}", "  ".repeat(indent + 1), print_plist(v, indent + 1)))
                .collect::<Vec<String>>();
            if items.is_empty() {
                "[]".to_string()
            } else {
                format!("[\n{}\n{}]", items.join(",\n"), "  ".repeat(indent))
            }
        }
        plist::Value::Dictionary(dict) => print_dict(dict, indent),
        plist::Value::Boolean(b) => b.to_string(),
        plist::Value::Data(d) => {
            if d.len() > 32 {
                format!("<{} bytes>", d.len())
            } else {
                format!("{d:02x?}")
            }
        }
        plist::Value::Date(d) => d.to_xml_format(),
        plist::Value::Real(r) => r.to_string(),
        plist::Value::Integer(i) => i.to_string(),
        plist::Value::String(s) => format!("\"{s}\""),
        plist::Value::Uid(u) => format!("Uid({})", u.get()),
        _ => "<unknown>".to_string(),
    }
}
