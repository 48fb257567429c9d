//! Info text protocol: newline separated commands and `name\tvalue` replies.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use super::frame::Frame;
use crate::error::{Error, Result};
use crate::result_code::ResultCode;

/// Builds an info request frame for the given commands.
pub fn encode_request<S: AsRef<str>>(commands: &[S]) -> Frame {
    let size: usize = commands.iter().map(|c| c.as_ref().len() + 1).sum();
    let mut body = BytesMut::with_capacity(size);
    for command in commands {
        body.put_slice(command.as_ref().as_bytes());
        body.put_u8(b'\n');
    }
    Frame::info(body)
}

/// Parses an info reply body into a command to value map.
///
/// Lines without a tab map the whole line to an empty value.
pub fn parse_response(body: &[u8]) -> Result<HashMap<String, String>> {
    let text = std::str::from_utf8(body)
        .map_err(|e| Error::Protocol(format!("info response is not UTF-8: {}", e)))?;

    let mut values = HashMap::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        match line.split_once('\t') {
            Some((name, value)) => values.insert(name.to_string(), value.to_string()),
            None => values.insert(line.to_string(), String::new()),
        };
    }
    Ok(values)
}

/// Turns an `ERROR...` or `FAIL...` reply into an error.
///
/// Recognized shapes are `ERROR`, `ERROR:<code>`, `ERROR:<code>:<message>`
/// and the same with `FAIL`.
pub fn check_response(command: &str, value: &str) -> Result<()> {
    let rest = if let Some(rest) = value.strip_prefix("ERROR") {
        rest
    } else if let Some(rest) = value.strip_prefix("FAIL") {
        rest
    } else {
        return Ok(());
    };

    let mut parts = rest.trim_start_matches(':').splitn(2, ':');
    let code = parts
        .next()
        .and_then(|c| c.trim().parse::<i32>().ok())
        .map(ResultCode::from_value)
        .unwrap_or(ResultCode::ServerError);
    let message = parts.next().unwrap_or("").trim();

    Err(Error::server(
        code,
        format!("info command `{}` failed: {}", command, message),
    ))
}

/// Parses a `k1=v1;k2=v2` list such as the `statistics` reply.
pub fn parse_name_value_list(value: &str, separator: char) -> HashMap<String, String> {
    value
        .split(separator)
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}
