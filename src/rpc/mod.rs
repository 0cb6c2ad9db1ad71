//! ONC-RPC v2 client for the RPC-based SMAPI server.
//!
//! Calls travel over TCP with record marking. Every call carries the
//! session token of the previous reply and every reply hands out a new one.

mod xdr;

use std::fmt;
use std::time::Duration;

use crate::debug;
use crate::error::{Error, Result};
use crate::framed::{ForceTime, Function};
use crate::transport::{TcpTransport, Transport};

use self::xdr::{XdrReader, XdrWriter};

/// SMAPI program number.
pub const DEFAULT_PROGRAM: u32 = 300_067;
/// SMAPI program version.
pub const DEFAULT_VERSION: u32 = 2;
/// Port of the portmapper that publishes the SMAPI port.
pub const PORTMAPPER_PORT: u16 = 111;

const PORTMAPPER_PROGRAM: u32 = 100_000;
const PORTMAPPER_VERSION: u32 = 2;
const PMAP_GETPORT: u32 = 3;
const IPPROTO_TCP: u32 = 6;

const PROC_LOGIN: u32 = 1;
const PROC_LOGOUT: u32 = 2;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const RPC_VERSION: u32 = 2;
const AUTH_NONE: u32 = 0;
const REPLY_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;

const LAST_FRAGMENT: u32 = 0x8000_0000;
const MAX_RECORD: usize = 1 << 20;
const MAX_NAME: usize = 255;

/// Return code of a partially failed list operation.
pub const RC_LIST_PARTIAL: i32 = 200;
/// Reason codes that carry a failing-image list.
pub const RS_LIST_FAILURES: [i32; 3] = [28, 32, 36];

/// Procedure number of an image function.
pub fn procedure(function: Function) -> u32 {
    match function {
        Function::ImageActivate => 35,
        Function::ImageDeactivate => 36,
        Function::ImageRecycle => 37,
        Function::ImageStatusQuery => 39,
    }
}

/// Opaque session token.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Token(pub [u8; 8]);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<opaque>)")
    }
}

/// One image in a failing-image list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailingImage {
    /// Image name.
    pub name: String,
    /// Per-image return code.
    pub rc: i32,
    /// Per-image reason code.
    pub rs: i32,
}

/// Counts and failures of a partially completed list operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FailingList {
    /// Images processed.
    pub processed: i32,
    /// Images not processed.
    pub not_processed: i32,
    /// Images that failed.
    pub images: Vec<FailingImage>,
}

/// Decoded result of one SMAPI call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    /// Return code.
    pub rc: i32,
    /// Reason code.
    pub rs: i32,
    /// Token to present on the next call.
    pub token: Token,
    /// Present for return code 200 with reason 28, 32 or 36.
    pub failing: Option<FailingList>,
}

/// The generated-stub surface of the SMAPI server.
pub trait SmapiStub {
    /// Authenticate and obtain the first session token.
    fn login(&mut self, user: &str, password: &[u8]) -> Result<CallResult>;

    /// Invoke an image function.
    fn image_call(
        &mut self,
        function: Function,
        token: &Token,
        target: &str,
        force_time: Option<ForceTime>,
    ) -> Result<CallResult>;

    /// End the session.
    fn logout(&mut self, token: &Token) -> Result<CallResult>;

    /// Drop the connection.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// [`SmapiStub`] speaking ONC-RPC over a stream transport.
pub struct OncRpcStub<T> {
    transport: T,
    program: u32,
    version: u32,
    xid: u32,
}

impl OncRpcStub<TcpTransport> {
    /// Connect to the SMAPI server, asking the portmapper for its port unless `port` is given.
    pub fn connect(address: &str, port: Option<u16>, timeout: Duration) -> Result<Self> {
        let port = match port {
            Some(p) => p,
            None => {
                let pm = TcpTransport::connect(address, PORTMAPPER_PORT, false, timeout)?;
                let mut pm = OncRpcStub::with_program(pm, PORTMAPPER_PROGRAM, PORTMAPPER_VERSION);
                let port = pm.getport(DEFAULT_PROGRAM, DEFAULT_VERSION)?;
                if let Err(err) = pm.transport.shutdown() {
                    let _ = &err;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %err, "portmapper shutdown failed");
                }
                port
            }
        };
        let transport = TcpTransport::connect(address, port, false, timeout)?;
        Ok(Self::new(transport))
    }
}

impl<T: Transport> OncRpcStub<T> {
    /// Stub for the default SMAPI program and version.
    pub fn new(transport: T) -> Self {
        Self::with_program(transport, DEFAULT_PROGRAM, DEFAULT_VERSION)
    }

    /// Stub for an explicit program and version.
    pub fn with_program(transport: T, program: u32, version: u32) -> Self {
        Self {
            transport,
            program,
            version,
            xid: rand::random(),
        }
    }

    /// Close the transport.
    pub fn shutdown(&mut self) -> Result<()> {
        self.transport.shutdown()
    }

    fn getport(&mut self, program: u32, version: u32) -> Result<u16> {
        let mut args = XdrWriter::new();
        args.u32(program).u32(version).u32(IPPROTO_TCP).u32(0);
        let reply = self.call(PMAP_GETPORT, args)?;
        let port = XdrReader::new(&reply).u32()?;
        match u16::try_from(port) {
            Ok(0) | Err(_) => Err(Error::Protocol("smapi program is not registered")),
            Ok(p) => Ok(p),
        }
    }

    fn call(&mut self, procedure: u32, args: XdrWriter) -> Result<Vec<u8>> {
        self.xid = self.xid.wrapping_add(1);
        let xid = self.xid;

        let mut msg = XdrWriter::new();
        msg.u32(xid)
            .u32(MSG_CALL)
            .u32(RPC_VERSION)
            .u32(self.program)
            .u32(self.version)
            .u32(procedure)
            .u32(AUTH_NONE)
            .u32(0)
            .u32(AUTH_NONE)
            .u32(0)
            .bytes(&args.finish());

        let mut record = XdrWriter::new();
        record.u32(LAST_FRAGMENT | msg.len() as u32).bytes(&msg.finish());
        self.transport.send_all(&record.finish())?;

        let reply = self.read_record()?;
        debug::dump_hex("rpc recv", &reply);
        let mut r = XdrReader::new(&reply);
        if r.u32()? != xid {
            return Err(Error::Protocol("rpc reply xid mismatch"));
        }
        if r.u32()? != MSG_REPLY {
            return Err(Error::Protocol("rpc message is not a reply"));
        }
        if r.u32()? != REPLY_ACCEPTED {
            return Err(Error::Protocol("rpc call denied"));
        }
        let _verf_flavor = r.u32()?;
        r.opaque(400)?;
        let stat = r.u32()?;
        if stat != ACCEPT_SUCCESS {
            return Err(Error::protocol_owned(format!("rpc call not accepted: {stat}")));
        }
        let consumed = reply.len() - r.remaining();
        Ok(reply[consumed..].to_vec())
    }

    fn read_record(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let mut mark = [0u8; 4];
            self.transport.recv_exact(&mut mark)?;
            let mark = u32::from_be_bytes(mark);
            let len = (mark & !LAST_FRAGMENT) as usize;
            if out.len() + len > MAX_RECORD {
                return Err(Error::Protocol("rpc record too large"));
            }
            let start = out.len();
            out.resize(start + len, 0);
            self.transport.recv_exact(&mut out[start..])?;
            if mark & LAST_FRAGMENT != 0 {
                return Ok(out);
            }
        }
    }
}

impl<T: Transport> SmapiStub for OncRpcStub<T> {
    fn login(&mut self, user: &str, password: &[u8]) -> Result<CallResult> {
        let mut args = XdrWriter::new();
        args.string(user).opaque(password);
        let reply = self.call(PROC_LOGIN, args)?;
        decode_result(&reply)
    }

    fn image_call(
        &mut self,
        function: Function,
        token: &Token,
        target: &str,
        force_time: Option<ForceTime>,
    ) -> Result<CallResult> {
        let mut args = XdrWriter::new();
        args.fixed_opaque(&token.0).string(target);
        if function == Function::ImageDeactivate {
            let ft = force_time.ok_or(Error::InvalidArgument("deactivate requires a force time"))?;
            args.string(&ft.to_string());
        }
        let reply = self.call(procedure(function), args)?;
        decode_result(&reply)
    }

    fn logout(&mut self, token: &Token) -> Result<CallResult> {
        let mut args = XdrWriter::new();
        args.fixed_opaque(&token.0);
        let reply = self.call(PROC_LOGOUT, args)?;
        decode_result(&reply)
    }

    fn close(&mut self) -> Result<()> {
        self.shutdown()
    }
}

impl<T> fmt::Debug for OncRpcStub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OncRpcStub")
            .field("program", &self.program)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Encode a call result the way the server does.
pub fn encode_result(result: &CallResult) -> Vec<u8> {
    let mut w = XdrWriter::new();
    w.i32(result.rc).i32(result.rs).fixed_opaque(&result.token.0);
    if let Some(list) = &result.failing {
        w.i32(list.processed)
            .i32(list.not_processed)
            .u32(list.images.len() as u32);
        for img in &list.images {
            w.string(&img.name).i32(img.rc).i32(img.rs);
        }
    }
    w.finish().to_vec()
}

fn decode_result(reply: &[u8]) -> Result<CallResult> {
    let mut r = XdrReader::new(reply);
    let rc = r.i32()?;
    let rs = r.i32()?;
    let mut token = Token::default();
    token.0.copy_from_slice(r.fixed_opaque(8)?);

    let failing = if rc == RC_LIST_PARTIAL && RS_LIST_FAILURES.contains(&rs) {
        let processed = r.i32()?;
        let not_processed = r.i32()?;
        let count = r.u32()? as usize;
        // Each entry is at least 12 bytes.
        if count > r.remaining() / 12 {
            return Err(Error::Protocol("failing image count exceeds reply"));
        }
        let mut images = Vec::with_capacity(count);
        for _ in 0..count {
            images.push(FailingImage {
                name: r.string(MAX_NAME)?,
                rc: r.i32()?,
                rs: r.i32()?,
            });
        }
        Some(FailingList {
            processed,
            not_processed,
            images,
        })
    } else {
        None
    };

    Ok(CallResult {
        rc,
        rs,
        token,
        failing,
    })
}
