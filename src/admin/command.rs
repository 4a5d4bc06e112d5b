//! Wire codec for the admin control fiber.
//!
//! Commands travel on the reserved fiber as a 12-byte little-endian
//! header followed by a serialized argument:
//!
//! ```text
//! [u32 serial] [u32 command] [u32 arg_size] [arg: arg_size bytes]
//! ```
//!
//! Argument encoding: scalar fields are `u32` little-endian; map-valued
//! fields are a `u32` pair count followed by
//! `[u16 key_len][key][u16 value_len][value]` entries in sorted key
//! order.
//!
//! Defined commands (values are on the wire, do not renumber):
//! - `1` `CreateServiceRequest { service_id, params }` → replies with `2`
//! - `2` `ServiceStatus { id, service_id, error_code, params }` → no reply
//! - `3` `StopServiceRequest { unique_id }` → replies with `2`
//!
//! Serial 0 / command 0 / empty argument is the keepalive.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

/// Size of the command header on the control fiber.
pub const COMMAND_HEADER_SIZE: usize = 12;

/// Map of string parameters carried by create requests and status
/// replies. Ordered so encoding is deterministic.
pub type Parameters = BTreeMap<String, String>;

/// One framed command on the control fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    /// Request serial echoed by the reply; 0 for keepalives.
    pub serial: u32,
    /// Command id; 0 for keepalives.
    pub command: u32,
    /// Serialized argument.
    pub arg: Vec<u8>,
}

impl AdminCommand {
    /// The periodic keepalive command.
    pub fn keep_alive() -> Self {
        Self {
            serial: 0,
            command: 0,
            arg: Vec::new(),
        }
    }

    /// True for the reserved keepalive form.
    pub fn is_keep_alive(&self) -> bool {
        self.serial == 0 && self.command == 0 && self.arg.is_empty()
    }

    /// Encode header plus argument into one wire buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COMMAND_HEADER_SIZE + self.arg.len());
        buf.extend_from_slice(&self.serial.to_le_bytes());
        buf.extend_from_slice(&self.command.to_le_bytes());
        buf.extend_from_slice(&(self.arg.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.arg);
        buf
    }

    /// Decode the fixed header; the argument is read separately, sized
    /// by the returned `arg_size`.
    pub fn decode_header(buf: &[u8; COMMAND_HEADER_SIZE]) -> (u32, u32, u32) {
        let serial = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let command = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let arg_size = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        (serial, command, arg_size)
    }
}

// ----------------------------------------------------------------------
// Argument primitives
// ----------------------------------------------------------------------

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn take_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    let end = *offset + 4;
    if buf.len() < end {
        bail!("argument truncated at offset {offset}");
    }
    let value = u32::from_le_bytes([buf[*offset], buf[*offset + 1], buf[*offset + 2], buf[*offset + 3]]);
    *offset = end;
    Ok(value)
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    debug_assert!(value.len() <= u16::MAX as usize);
    buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn take_str(buf: &[u8], offset: &mut usize) -> Result<String> {
    let end = *offset + 2;
    if buf.len() < end {
        bail!("argument truncated at offset {offset}");
    }
    let len = u16::from_le_bytes([buf[*offset], buf[*offset + 1]]) as usize;
    *offset = end;
    let end = *offset + len;
    if buf.len() < end {
        bail!("string truncated at offset {offset}");
    }
    let value = std::str::from_utf8(&buf[*offset..end])?.to_owned();
    *offset = end;
    Ok(value)
}

fn put_params(buf: &mut Vec<u8>, params: &Parameters) {
    put_u32(buf, params.len() as u32);
    for (key, value) in params {
        put_str(buf, key);
        put_str(buf, value);
    }
}

fn take_params(buf: &[u8], offset: &mut usize) -> Result<Parameters> {
    let count = take_u32(buf, offset)?;
    let mut params = Parameters::new();
    for _ in 0..count {
        let key = take_str(buf, offset)?;
        let value = take_str(buf, offset)?;
        params.insert(key, value);
    }
    Ok(params)
}

// ----------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------

/// Ask the peer to construct and start a microservice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateServiceRequest {
    /// Well-known factory id of the service to start.
    pub service_id: u32,
    /// Constructor parameters.
    pub params: Parameters,
}

impl CreateServiceRequest {
    /// Command id on the wire.
    pub const COMMAND_ID: u32 = 1;
    /// Replies arrive as [`ServiceStatus`].
    pub const REPLY_ID: u32 = ServiceStatus::COMMAND_ID;

    /// Build a request with no parameters yet.
    pub fn new(service_id: u32) -> Self {
        Self {
            service_id,
            params: Parameters::new(),
        }
    }

    /// Add one constructor parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_owned(), value.into());
        self
    }

    /// Serialize the argument body.
    pub fn encode_arg(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, self.service_id);
        put_params(&mut buf, &self.params);
        buf
    }

    /// Parse the argument body.
    pub fn decode_arg(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let service_id = take_u32(buf, &mut offset)?;
        let params = take_params(buf, &mut offset)?;
        Ok(Self { service_id, params })
    }
}

/// Status of a remotely managed service, sent as the reply to create
/// and stop requests and whenever a service changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Unique id assigned by the peer's service manager.
    pub id: u32,
    /// Factory id of the service; 0 in stop replies.
    pub service_id: u32,
    /// 0 on success; 4 means "stopped" and removes the table entry.
    pub error_code: u32,
    /// Parameters the service was created with.
    pub params: Parameters,
}

impl ServiceStatus {
    /// Command id on the wire.
    pub const COMMAND_ID: u32 = 2;

    /// Serialize the argument body.
    pub fn encode_arg(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, self.id);
        put_u32(&mut buf, self.service_id);
        put_u32(&mut buf, self.error_code);
        put_params(&mut buf, &self.params);
        buf
    }

    /// Parse the argument body.
    pub fn decode_arg(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let id = take_u32(buf, &mut offset)?;
        let service_id = take_u32(buf, &mut offset)?;
        let error_code = take_u32(buf, &mut offset)?;
        let params = take_params(buf, &mut offset)?;
        Ok(Self {
            id,
            service_id,
            error_code,
            params,
        })
    }
}

/// Ask the peer to stop the service it started under `unique_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopServiceRequest {
    /// Id returned by the matching create.
    pub unique_id: u32,
}

impl StopServiceRequest {
    /// Command id on the wire.
    pub const COMMAND_ID: u32 = 3;
    /// Replies arrive as [`ServiceStatus`].
    pub const REPLY_ID: u32 = ServiceStatus::COMMAND_ID;

    /// Serialize the argument body.
    pub fn encode_arg(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, self.unique_id);
        buf
    }

    /// Parse the argument body.
    pub fn decode_arg(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let unique_id = take_u32(buf, &mut offset)?;
        Ok(Self { unique_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_header_round_trip() {
        let cmd = AdminCommand {
            serial: 7,
            command: 1,
            arg: b"abc".to_vec(),
        };
        let encoded = cmd.encode();
        let mut header = [0u8; COMMAND_HEADER_SIZE];
        header.copy_from_slice(&encoded[..COMMAND_HEADER_SIZE]);
        assert_eq!(AdminCommand::decode_header(&header), (7, 1, 3));
        assert_eq!(&encoded[COMMAND_HEADER_SIZE..], b"abc");
    }

    #[test]
    fn test_keep_alive_form() {
        let ka = AdminCommand::keep_alive();
        assert!(ka.is_keep_alive());
        assert_eq!(ka.encode().len(), COMMAND_HEADER_SIZE);
    }

    #[test]
    fn test_create_request_round_trip() {
        let req = CreateServiceRequest::new(3)
            .with_param("local_port", "12000")
            .with_param("remote_ip", "93.184.216.34")
            .with_param("remote_port", "80");
        let decoded = CreateServiceRequest::decode_arg(&req.encode_arg()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_params_encode_in_sorted_key_order() {
        let req = CreateServiceRequest::new(4)
            .with_param("zeta", "1")
            .with_param("alpha", "2");
        let arg = req.encode_arg();
        let alpha = arg.windows(5).position(|w| w == b"alpha");
        let zeta = arg.windows(4).position(|w| w == b"zeta");
        assert!(alpha.unwrap() < zeta.unwrap());
    }

    #[test]
    fn test_service_status_round_trip() {
        let status = ServiceStatus {
            id: 42,
            service_id: 2,
            error_code: 0,
            params: Parameters::new(),
        };
        let decoded = ServiceStatus::decode_arg(&status.encode_arg()).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_stop_request_round_trip() {
        let stop = StopServiceRequest { unique_id: 9 };
        let decoded = StopServiceRequest::decode_arg(&stop.encode_arg()).unwrap();
        assert_eq!(decoded, stop);
    }

    #[test]
    fn test_truncated_arg_rejected() {
        let req = CreateServiceRequest::new(3).with_param("k", "v");
        let arg = req.encode_arg();
        assert!(CreateServiceRequest::decode_arg(&arg[..arg.len() - 1]).is_err());
        assert!(CreateServiceRequest::decode_arg(&[0x01]).is_err());
    }

    #[test]
    fn test_reply_routing_ids() {
        assert_eq!(CreateServiceRequest::REPLY_ID, ServiceStatus::COMMAND_ID);
        assert_eq!(StopServiceRequest::REPLY_ID, ServiceStatus::COMMAND_ID);
    }
}
