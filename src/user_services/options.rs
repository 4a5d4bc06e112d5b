//! Option grammar of the forwarding CLI flags.
//!
//! Two shapes, parsed from the right so IPv6-free host names with
//! colons never ambiguate the port fields:
//!
//! - forward options (`-L`, `-R`, `-U`, `-V`):
//!   `[bind_address:]port:remote_host:remote_port`
//! - listening options (`-D`, `-F`, `-X`, `-Y`):
//!   `[bind_address:]port`
//!
//! An omitted bind address means "loopback by default"; an explicitly
//! empty one (a leading `:`) means "every interface", written `*`.

use anyhow::{bail, Result};

/// A bind address plus port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    /// `""` = loopback default, `"*"` = every interface.
    pub bind_addr: String,
    /// TCP/UDP port.
    pub port: u16,
}

/// A local listening endpoint paired with the destination it forwards
/// to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    /// Where to listen.
    pub from: ListenSpec,
    /// Destination host.
    pub to_addr: String,
    /// Destination port.
    pub to_port: u16,
}

fn parse_port(input: &str) -> Result<u16> {
    match input.parse::<u32>() {
        Ok(value) if value <= u16::MAX as u32 => Ok(value as u16),
        _ => bail!("invalid port: {input}"),
    }
}

impl ListenSpec {
    /// Parse `[bind_address:]port`.
    pub fn parse(option: &str) -> Result<Self> {
        match option.rfind(':') {
            Some(index) => {
                let bind = &option[..index];
                Ok(Self {
                    bind_addr: if bind.is_empty() { "*".to_owned() } else { bind.to_owned() },
                    port: parse_port(&option[index + 1..])?,
                })
            }
            None => Ok(Self {
                bind_addr: String::new(),
                port: parse_port(option)?,
            }),
        }
    }
}

impl ForwardSpec {
    /// Parse `[bind_address:]port:remote_host:remote_port`.
    pub fn parse(option: &str) -> Result<Self> {
        let Some(port_sep) = option.rfind(':') else {
            bail!("malformed forward option: {option}");
        };
        let to_port = parse_port(&option[port_sep + 1..])?;

        let Some(host_sep) = option[..port_sep].rfind(':') else {
            bail!("malformed forward option: {option}");
        };
        let to_addr = option[host_sep + 1..port_sep].to_owned();
        if to_addr.is_empty() {
            bail!("missing remote host: {option}");
        }

        let from = ListenSpec::parse(&option[..host_sep])?;
        Ok(Self {
            from,
            to_addr,
            to_port,
        })
    }
}
