//! Correlated command/response protocol over an event channel.
//!
//! A command is acknowledged asynchronously: the endpoint later emits an
//! event on the same channel, possibly interleaved with events that belong
//! to other commands. Every submitted command carries a [`Correlator`] and
//! [`EventSession::submit`] skips events whose correlator differs.

mod ber;
mod snmp;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::error::{Error, Result};
use crate::record::{Cell, FieldError, Record};

pub use snmp::SnmpChannel;

/// Object identifiers of the hardware console event MIB.
pub mod oid {
    /// Prefix of every CPC image object.
    pub const CPC_IMAGE: &str = "1.3.6.1.4.1.2.6.42.0.2.2";
    /// Group object listing all images of the CPC.
    pub const CPC_IMAGE_GROUP: &str = "1.3.6.1.4.1.2.6.42.0.2.1.2";
    /// Attribute suffix: space-separated group contents.
    pub const GROUP_CONTENTS_SUFFIX: &str = "22";
    /// Attribute suffix: object name.
    pub const NAME_SUFFIX: &str = "1";
    /// Attribute suffix: 32-bit status word.
    pub const STATUS_SUFFIX: &str = "5";

    /// Activate command.
    pub const ACTIVATE: &str = "1.3.6.1.4.1.2.6.42.2.1";
    /// Deactivate command.
    pub const DEACTIVATE: &str = "1.3.6.1.4.1.2.6.42.2.2";
    /// Reset-clear command.
    pub const RESET_CLEAR: &str = "1.3.6.1.4.1.2.6.42.2.5";
    /// CCW load command.
    pub const LOAD: &str = "1.3.6.1.4.1.2.6.42.2.6";
    /// Stop-all command.
    pub const STOP: &str = "1.3.6.1.4.1.2.6.42.2.9";
    /// Operating-system console command.
    pub const SEND_OPSYS_COMMAND: &str = "1.3.6.1.4.1.2.6.42.2.12";
    /// SCSI load command.
    pub const SCSI_LOAD: &str = "1.3.6.1.4.1.2.6.42.2.37";
    /// SCSI dump command.
    pub const SCSI_DUMP: &str = "1.3.6.1.4.1.2.6.42.2.38";

    /// Event field: event type.
    pub const EVENT_TYPE: &str = "1.3.6.1.4.1.2.6.42.3.1";
    /// Image attribute suffix naming the command object of a response.
    pub const COMMAND_OBJECT_SUFFIX: &str = "50";
    /// Image attribute suffix naming the condition code of a response.
    pub const CONDITION_CODE_SUFFIX: &str = "51";
    /// Image attribute suffix naming the last-response indicator.
    pub const LAST_INDICATOR_SUFFIX: &str = "52";
    /// Event field: message text.
    pub const EVENT_MESSAGE: &str = "1.3.6.1.4.1.2.6.42.3.5";
    /// Event field: command correlator.
    pub const EVENT_CORRELATOR: &str = "1.3.6.1.4.1.2.6.42.3.6";
    /// Command parameter list; parameter `n` is `COMMAND_PARAMETER.n`.
    pub const COMMAND_PARAMETER: &str = "1.3.6.1.4.1.2.6.42.4";

    /// Object id of an attribute of the image object `image`.
    ///
    /// Image objects are `CPC_IMAGE.<id>`; attributes are `CPC_IMAGE.<suffix>.<id>`.
    pub fn image_attribute(image: &str, suffix: &str) -> Option<String> {
        let id = image
            .strip_prefix(CPC_IMAGE)
            .and_then(|rest| rest.strip_prefix('.'))?;
        Some(format!("{CPC_IMAGE}.{suffix}.{id}"))
    }
}

/// Initial receive buffer size.
pub const INITIAL_BUFFER_SIZE: usize = 10_000;

/// Event type of a command response.
pub const EVENT_COMMAND_RESPONSE: i64 = 0;
/// Event type of an operating-system message.
pub const EVENT_OPSYS_MESSAGE: i64 = 1;

// Fixed positions in a command response event.
const POS_TARGET: usize = 0;
const POS_EVENT_TYPE: usize = 1;
const POS_COMMAND_OBJECT: usize = 2;
const POS_COMMAND_CODE: usize = 3;
const POS_CONDITION_NAME: usize = 4;
const POS_CONDITION_CODE: usize = 5;
const POS_LAST_NAME: usize = 6;
const POS_LAST_INDICATOR: usize = 7;
const POS_MESSAGE: usize = 9;
const POS_CORRELATOR: usize = 11;
const POS_OPSYS_TEXT: usize = 5;

/// Which events a channel subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMask {
    /// Responses to correlated commands.
    CommandResponse,
    /// Operating-system console messages.
    OpsysMessage,
}

/// Result of a buffered channel read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    /// The record fit into the provided buffer.
    Ready(Record),
    /// The pending response needs a buffer of this many bytes; nothing was consumed.
    NeedMore(usize),
}

/// A 4-byte token tying a command to its asynchronous response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlator([u8; 4]);

impl Correlator {
    /// Derive a correlator from random bits, the process id and the clock.
    ///
    /// Unique among in-flight commands of this process, not secret.
    pub fn generate() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let v = rand::rng()
            .next_u32()
            .wrapping_add(std::process::id())
            ^ secs;
        Self(v.to_be_bytes())
    }

    /// Correlator from raw bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Whether `record` carries this correlator at the correlator position.
    pub fn matches(&self, record: &Record) -> bool {
        matches!(record.get(POS_CORRELATOR), Ok(Cell::OctetString(b)) if b[..] == self.0[..])
    }
}

/// One correlated command.
#[derive(Debug, Clone)]
pub struct CommandRequest<'a> {
    /// Target object id.
    pub target: &'a str,
    /// Command code object id.
    pub command: &'a str,
    /// Positional parameter list.
    pub params: &'a Record,
    /// Correlator echoed by the response event.
    pub correlator: Correlator,
}

/// A channel speaking the hardware console event API.
pub trait EventChannel {
    /// Open the channel for the given event class.
    fn initialize(&mut self, mask: EventMask, timeout: Duration) -> Result<()>;

    /// Read one object into a buffer of `buf.len()` bytes.
    fn get(&mut self, object: &str, buf: &mut [u8], timeout: Duration) -> Result<Fetch>;

    /// Submit a command; the acknowledgement arrives later as an event.
    fn command(&mut self, request: &CommandRequest<'_>, timeout: Duration) -> Result<()>;

    /// Wait for the next event.
    ///
    /// Must return [`Error::Timeout`] when nothing arrives in time.
    fn wait(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Fetch>;

    /// Close the channel.
    fn terminate(&mut self) -> Result<()>;
}

impl<T: EventChannel + ?Sized> EventChannel for Box<T> {
    fn initialize(&mut self, mask: EventMask, timeout: Duration) -> Result<()> {
        (**self).initialize(mask, timeout)
    }

    fn get(&mut self, object: &str, buf: &mut [u8], timeout: Duration) -> Result<Fetch> {
        (**self).get(object, buf, timeout)
    }

    fn command(&mut self, request: &CommandRequest<'_>, timeout: Duration) -> Result<()> {
        (**self).command(request, timeout)
    }

    fn wait(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Fetch> {
        (**self).wait(buf, timeout)
    }

    fn terminate(&mut self) -> Result<()> {
        (**self).terminate()
    }
}

/// How the endpoint answered a correlated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// Condition code zero with the last indicator set.
    Acknowledged,
    /// The command failed on the endpoint.
    Failed {
        /// Condition code.
        rc: i64,
        /// Message text carried by the event, if any.
        text: Option<String>,
    },
}

/// An operating-system console message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsysMessage {
    /// Image object the message belongs to.
    pub target: String,
    /// Message text.
    pub text: String,
}

impl OpsysMessage {
    /// Decode a console message event; other event types yield `None`.
    pub fn from_record(record: &Record) -> Option<Self> {
        if record.integer(POS_EVENT_TYPE).ok()? != EVENT_OPSYS_MESSAGE {
            return None;
        }
        Some(Self {
            target: record.object_id(POS_TARGET).ok()?.to_owned(),
            text: record.text(POS_OPSYS_TEXT).ok()?,
        })
    }
}

/// A live event channel with its growable receive buffer.
///
/// Only one command may be outstanding at a time; `submit` takes `&mut self`.
pub struct EventSession {
    channel: Box<dyn EventChannel + Send>,
    buf: Vec<u8>,
    timeout: Duration,
    open: bool,
}

impl EventSession {
    /// Initialize `channel` for `mask`.
    pub fn open(
        mut channel: Box<dyn EventChannel + Send>,
        mask: EventMask,
        timeout: Duration,
    ) -> Result<Self> {
        channel.initialize(mask, timeout)?;
        Ok(Self {
            channel,
            buf: vec![0u8; INITIAL_BUFFER_SIZE],
            timeout,
            open: true,
        })
    }

    /// Current receive buffer capacity.
    pub fn buffer_size(&self) -> usize {
        self.buf.len()
    }

    /// Read one object, growing the buffer to the reported size as often as needed.
    pub fn get(&mut self, object: &str) -> Result<Record> {
        loop {
            match self.channel.get(object, &mut self.buf, self.timeout)? {
                Fetch::Ready(record) => return Ok(record),
                Fetch::NeedMore(needed) => self.grow(needed)?,
            }
        }
    }

    /// Wait for the next event of any kind.
    pub fn next_event(&mut self, timeout: Duration) -> Result<Record> {
        loop {
            match self.channel.wait(&mut self.buf, timeout)? {
                Fetch::Ready(record) => return Ok(record),
                Fetch::NeedMore(needed) => self.grow(needed)?,
            }
        }
    }

    /// Submit a command and wait for its correlated acknowledgement.
    ///
    /// Events with another correlator, or with a non-response event type, are
    /// skipped. A wait that times out ends the command with [`Error::Timeout`].
    pub fn submit(&mut self, target: &str, command: &str, params: &Record) -> Result<Ack> {
        if !self.open {
            return Err(Error::Protocol("event session is closed"));
        }
        let correlator = Correlator::generate();
        let request = CommandRequest {
            target,
            command,
            params,
            correlator,
        };
        self.channel.command(&request, self.timeout)?;

        loop {
            let event = self.next_event(self.timeout)?;
            if !correlator.matches(&event) {
                #[cfg(feature = "tracing")]
                tracing::debug!(cells = event.len(), "skipping non-matching event");
                continue;
            }
            match verify_response(&event, target, command) {
                Ok(Some(ack)) => return Ok(ack),
                Ok(None) => continue,
                Err(err) => {
                    return Err(Error::protocol_owned(format!("not acknowledged - {err}")));
                }
            }
        }
    }

    /// Terminate the channel. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.channel.terminate()
    }

    fn grow(&mut self, needed: usize) -> Result<()> {
        if needed <= self.buf.len() {
            return Err(Error::BufferOverflow {
                needed,
                capacity: self.buf.len(),
            });
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(needed)?;
        buf.resize(needed, 0);
        self.buf = buf;
        Ok(())
    }
}

impl std::fmt::Debug for EventSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSession")
            .field("buffer_size", &self.buf.len())
            .field("timeout", &self.timeout)
            .field("open", &self.open)
            .finish()
    }
}

/// Verify a correlated response. `Ok(None)` means the event is not a command response.
///
/// The command object, condition code and last indicator are named by
/// attributes of the target image (`CPC_IMAGE.<suffix>.<id>`).
fn verify_response(
    event: &Record,
    target: &str,
    command: &str,
) -> std::result::Result<Option<Ack>, String> {
    let field = |e: FieldError| e.to_string();
    let attribute = |suffix: &str| {
        oid::image_attribute(target, suffix)
            .ok_or_else(|| format!("{target} is not an image object"))
    };
    let expect_oid = |index: usize,
                      expected: &str,
                      mismatch: &str|
     -> std::result::Result<(), String> {
        if event.object_id(index).map_err(field)? == expected {
            Ok(())
        } else {
            Err(mismatch.to_owned())
        }
    };

    expect_oid(POS_TARGET, target, "protocol error - objectid [1]")?;
    if event.integer(POS_EVENT_TYPE).map_err(field)? != EVENT_COMMAND_RESPONSE {
        return Ok(None);
    }
    expect_oid(
        POS_COMMAND_OBJECT,
        &attribute(oid::COMMAND_OBJECT_SUFFIX)?,
        "protocol error - objectid [2]",
    )?;
    expect_oid(POS_COMMAND_CODE, command, "protocol error - objectid [3]")?;
    expect_oid(
        POS_CONDITION_NAME,
        &attribute(oid::CONDITION_CODE_SUFFIX)?,
        "command response protocol error: condition code",
    )?;
    let rc = event.integer(POS_CONDITION_CODE).map_err(field)?;
    if rc != 0 {
        let text = event.text(POS_MESSAGE).ok().filter(|t| !t.is_empty());
        return Ok(Some(Ack::Failed { rc, text }));
    }
    expect_oid(
        POS_LAST_NAME,
        &attribute(oid::LAST_INDICATOR_SUFFIX)?,
        "command response protocol error: last indicator",
    )?;
    if event.integer(POS_LAST_INDICATOR).map_err(field)? != 1 {
        return Err("protocol error: last indicator not set".to_owned());
    }
    Ok(Some(Ack::Acknowledged))
}

/// Message fragments that mark a failed command as a harmless race.
const BENIGN_MARKERS: [&str; 5] = [
    "135921664",
    "135921680",
    "Being Deactivated",
    "Not Active",
    "Already Active",
];

/// Whether a failure message describes a race the caller can ignore.
pub fn is_benign(message: &str) -> bool {
    BENIGN_MARKERS.iter().any(|m| message.contains(m))
}

/// Description of an event API return code.
pub fn api_error_description(code: u32) -> &'static str {
    const DESCRIPTIONS: [&str; 30] = [
        "NO_ERROR - 0",
        "NO_SUCH_OBJECT - 1",
        "INVALID_DATA_TYPE - 2",
        "INVALID_DATA_LENGTH - 3",
        "INVALID_DATA_PTR - 4",
        "INVALID_DATA_VALUE - 5",
        "INVALID_INIT_PTR - 6",
        "INVALID_ID_PTR - 7",
        "INVALID_BUF_PTR - 8",
        "INVALID_BUF_SIZE - 9",
        "INVALID_DATATYPE_PTR - 10",
        "INVALID_TARGET (wrong IP address) - 11",
        "INVALID_EVENT_MASK - 12",
        "INVALID_PARAMETER - 13",
        "READ_ONLY_OBJECT - 14",
        "SNMP_INIT_ERROR - 15",
        "INVALID_OBJECT_ID - 16",
        "REQUEST_ALLOC_ERROR - 17",
        "REQUEST_SEND_ERROR - 18",
        "TIMEOUT (may be also wrong community/password) - 19",
        "REQUEST_RECV_ERROR - 20",
        "SNMP_ERROR - 21",
        "INVALID_TIMEOUT - 22",
        "INVALID_CMD - 23",
        "OBJECT_BUSY - 24",
        "INVALID_OBJECT - 25",
        "COMMAND_FAILED - 26",
        "INITTERM_OK - 27",
        "INVALID_HOST / DISRUPTIVE_OK - 28",
        "INVALID_COMMUNITY / PARTIAL_HW - 29",
    ];
    DESCRIPTIONS
        .get(code as usize)
        .copied()
        .unwrap_or("unknown error")
}

/// Offset added to event API codes when reported as result codes.
pub const API_CODE_OFFSET: u32 = 2000;

/// Event API code for a timed-out request.
pub const API_TIMEOUT: u32 = 19;
