//! User services: end-user forwarding intents.
//!
//! A user service adapts one CLI flag (`-L 13080:host:80`,
//! `-D 11080`, …) into the pair of microservice sets that realize it: a
//! list of `CreateServiceRequest`s for the peer and a list started
//! locally. The admin client drives the sequence (local halves start
//! only after every peer-side create succeeded) and tears partial
//! starts back down on failure.
//!
//! The relay fiber port connecting the two halves is the user-chosen
//! port, which keeps concurrent forwards naturally disjoint.

pub mod options;

use std::sync::Arc;

use anyhow::Result;

use crate::admin::command::CreateServiceRequest;
use crate::fiber::FiberPort;
use crate::services::copy::FileEnquirer;
use crate::services::datagram_forwarder::DatagramForwarder;
use crate::services::datagram_listener::DatagramListener;
use crate::services::shell::ShellServer;
use crate::services::socks::SocksServer;
use crate::services::stream_forwarder::StreamForwarder;
use crate::services::stream_listener::StreamListener;
use crate::user_services::options::{ForwardSpec, ListenSpec};

/// One end-user forwarding intent.
pub trait UserService: Send + Sync {
    /// Short name used in logs and status callbacks.
    fn name(&self) -> &str;

    /// Create requests to send to the peer, in order.
    fn remote_create_requests(&self) -> Vec<CreateServiceRequest>;

    /// Create requests started locally once every remote side runs.
    fn local_create_requests(&self) -> Vec<CreateServiceRequest>;
}

/// Stream port forward (`-L [bind:]port:host:rport`): listen locally,
/// connect remotely.
pub struct StreamForward {
    spec: ForwardSpec,
}

impl StreamForward {
    /// Parse the `-L` option value.
    pub fn parse(option: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            spec: ForwardSpec::parse(option)?,
        }))
    }

    fn relay_port(&self) -> FiberPort {
        FiberPort::from(self.spec.from.port)
    }
}

impl UserService for StreamForward {
    fn name(&self) -> &str {
        "tcp-forward"
    }

    fn remote_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![StreamForwarder::create_request(
            self.relay_port(),
            &self.spec.to_addr,
            self.spec.to_port,
        )]
    }

    fn local_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![StreamListener::create_request(
            &self.spec.from.bind_addr,
            self.spec.from.port,
            self.relay_port(),
        )]
    }
}

/// Reverse stream forward (`-R [bind:]port:host:rport`): listen on the
/// peer, connect locally.
pub struct RemoteStreamForward {
    spec: ForwardSpec,
}

impl RemoteStreamForward {
    /// Parse the `-R` option value.
    pub fn parse(option: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            spec: ForwardSpec::parse(option)?,
        }))
    }

    fn relay_port(&self) -> FiberPort {
        FiberPort::from(self.spec.from.port)
    }
}

impl UserService for RemoteStreamForward {
    fn name(&self) -> &str {
        "remote-tcp-forward"
    }

    fn remote_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![StreamListener::create_request(
            &self.spec.from.bind_addr,
            self.spec.from.port,
            self.relay_port(),
        )]
    }

    fn local_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![StreamForwarder::create_request(
            self.relay_port(),
            &self.spec.to_addr,
            self.spec.to_port,
        )]
    }
}

/// Datagram forward (`-U [bind:]port:host:rport`).
pub struct DatagramForward {
    spec: ForwardSpec,
}

impl DatagramForward {
    /// Parse the `-U` option value.
    pub fn parse(option: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            spec: ForwardSpec::parse(option)?,
        }))
    }

    fn relay_port(&self) -> FiberPort {
        FiberPort::from(self.spec.from.port)
    }
}

impl UserService for DatagramForward {
    fn name(&self) -> &str {
        "udp-forward"
    }

    fn remote_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![DatagramForwarder::create_request(
            self.relay_port(),
            &self.spec.to_addr,
            self.spec.to_port,
        )]
    }

    fn local_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![DatagramListener::create_request(
            &self.spec.from.bind_addr,
            self.spec.from.port,
            self.relay_port(),
        )]
    }
}

/// Reverse datagram forward (`-V [bind:]port:host:rport`).
pub struct RemoteDatagramForward {
    spec: ForwardSpec,
}

impl RemoteDatagramForward {
    /// Parse the `-V` option value.
    pub fn parse(option: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            spec: ForwardSpec::parse(option)?,
        }))
    }

    fn relay_port(&self) -> FiberPort {
        FiberPort::from(self.spec.from.port)
    }
}

impl UserService for RemoteDatagramForward {
    fn name(&self) -> &str {
        "remote-udp-forward"
    }

    fn remote_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![DatagramListener::create_request(
            &self.spec.from.bind_addr,
            self.spec.from.port,
            self.relay_port(),
        )]
    }

    fn local_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![DatagramForwarder::create_request(
            self.relay_port(),
            &self.spec.to_addr,
            self.spec.to_port,
        )]
    }
}

/// SOCKS proxy (`-D [bind:]port`): listen locally, resolve and connect
/// on the peer.
pub struct Socks {
    spec: ListenSpec,
}

impl Socks {
    /// Parse the `-D` option value.
    pub fn parse(option: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            spec: ListenSpec::parse(option)?,
        }))
    }

    fn relay_port(&self) -> FiberPort {
        FiberPort::from(self.spec.port)
    }
}

impl UserService for Socks {
    fn name(&self) -> &str {
        "socks"
    }

    fn remote_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![SocksServer::create_request(self.relay_port())]
    }

    fn local_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![StreamListener::create_request(
            &self.spec.bind_addr,
            self.spec.port,
            self.relay_port(),
        )]
    }
}

/// Reverse SOCKS proxy (`-F [bind:]port`): listen on the peer, resolve
/// and connect locally.
pub struct RemoteSocks {
    spec: ListenSpec,
}

impl RemoteSocks {
    /// Parse the `-F` option value.
    pub fn parse(option: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            spec: ListenSpec::parse(option)?,
        }))
    }

    fn relay_port(&self) -> FiberPort {
        FiberPort::from(self.spec.port)
    }
}

impl UserService for RemoteSocks {
    fn name(&self) -> &str {
        "remote-socks"
    }

    fn remote_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![StreamListener::create_request(
            &self.spec.bind_addr,
            self.spec.port,
            self.relay_port(),
        )]
    }

    fn local_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![SocksServer::create_request(self.relay_port())]
    }
}

/// Shell exposed locally (`-X [bind:]port`): local listener, shell
/// sessions spawn on the peer.
pub struct Shell {
    spec: ListenSpec,
}

impl Shell {
    /// Parse the `-X` option value.
    pub fn parse(option: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            spec: ListenSpec::parse(option)?,
        }))
    }

    fn relay_port(&self) -> FiberPort {
        FiberPort::from(self.spec.port)
    }
}

impl UserService for Shell {
    fn name(&self) -> &str {
        "shell"
    }

    fn remote_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![ShellServer::create_request(self.relay_port())]
    }

    fn local_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![StreamListener::create_request(
            &self.spec.bind_addr,
            self.spec.port,
            self.relay_port(),
        )]
    }
}

/// Shell exposed remotely (`-Y [bind:]port`): listener on the peer,
/// shell sessions spawn here.
pub struct RemoteShell {
    spec: ListenSpec,
}

impl RemoteShell {
    /// Parse the `-Y` option value.
    pub fn parse(option: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            spec: ListenSpec::parse(option)?,
        }))
    }

    fn relay_port(&self) -> FiberPort {
        FiberPort::from(self.spec.port)
    }
}

impl UserService for RemoteShell {
    fn name(&self) -> &str {
        "remote-shell"
    }

    fn remote_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![StreamListener::create_request(
            &self.spec.bind_addr,
            self.spec.port,
            self.relay_port(),
        )]
    }

    fn local_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![ShellServer::create_request(self.relay_port())]
    }
}

/// One-shot remote file fetch used by the copy front-end.
pub struct FileCopy {
    remote_path: String,
    local_path: String,
}

impl FileCopy {
    /// Fetch `remote_path` from the peer into `local_path`.
    pub fn new(remote_path: impl Into<String>, local_path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            remote_path: remote_path.into(),
            local_path: local_path.into(),
        })
    }
}

impl UserService for FileCopy {
    fn name(&self) -> &str {
        "file-copy"
    }

    fn remote_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![crate::services::copy::FileToFiber::create_request()]
    }

    fn local_create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![FileEnquirer::create_request(
            &self.remote_path,
            &self.local_path,
        )]
    }
}
