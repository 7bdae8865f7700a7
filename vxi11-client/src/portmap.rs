//! Portmapper lookups (RFC 1833, version 2).
use std::time::Duration;

use vxi11_protocol::{
    IPPROTO_TCP, Mapping, PMAPPROC_GETPORT, PMAPPROC_NULL, PORTMAPPER_PROGRAM,
    PORTMAPPER_VERSION, rpc::ReplyStatus,
};

use crate::{
    error::{Error, RpcError},
    rpc::RpcClient,
    transport::Connection,
};

pub struct Portmapper {
    rpc: RpcClient,
}

impl Portmapper {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Portmapper, Error> {
        let conn = Connection::connect(host, port, timeout)?;
        Ok(Portmapper {
            rpc: RpcClient::new(conn, PORTMAPPER_PROGRAM, PORTMAPPER_VERSION),
        })
    }

    /// Calls the `NULL` procedure to check that the portmapper answers.
    pub fn ping(&mut self, timeout: Duration) -> Result<(), RpcError> {
        self.rpc.call(PMAPPROC_NULL, &(), timeout)
    }

    /// Returns the TCP port a program is registered on.
    ///
    /// A program that is not registered is reported as [`ReplyStatus::ProgramUnavailable`].
    pub fn get_port(&mut self, program: u32, version: u32, timeout: Duration) -> Result<u16, RpcError> {
        let mapping = Mapping {
            program,
            version,
            protocol: IPPROTO_TCP,
            port: 0,
        };
        let port: u32 = self.rpc.call(PMAPPROC_GETPORT, &mapping, timeout)?;
        log::debug!("Portmapper: program {:#x} v{} on port {}", program, version, port);
        match u16::try_from(port) {
            Ok(0) | Err(_) => Err(RpcError::Rejected(ReplyStatus::ProgramUnavailable)),
            Ok(port) => Ok(port),
        }
    }

    pub fn close(&mut self) {
        self.rpc.close();
    }
}
