use core::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::crypto::SecretBytes;
use crate::error::{Error, Result};

/// Command timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period passed to a VM deactivate when force is not requested.
pub const DEFAULT_SHUTDOWN_TIME: u32 = 300;

/// Poll interval for operating-system messages in a dialog.
pub const DEFAULT_MSG_TIMEOUT: Duration = Duration::from_secs(5);

/// Server types understood by the built-in backend registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerType {
    /// Logical partition managed through the event API.
    Lpar,
    /// z/VM guest managed through the RPC service.
    Vm,
    /// z/VM guest managed through the socket service.
    Vm5,
}

impl ServerType {
    /// Canonical type tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lpar => "LPAR",
            Self::Vm => "VM",
            Self::Vm5 => "VM5",
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [Self::Lpar, Self::Vm, Self::Vm5]
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or(Error::InvalidArgument("unknown server type"))
    }
}

impl From<ServerType> for String {
    fn from(t: ServerType) -> Self {
        t.as_str().to_owned()
    }
}

/// Logical image operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageOp {
    /// Reset (clear) the image.
    Reset,
    /// Activate the image.
    Activate,
    /// Deactivate the image.
    Deactivate,
    /// Stop all processors of the image.
    Stop,
    /// IPL from a CCW device.
    Load,
    /// IPL from a SCSI device.
    ScsiLoad,
    /// Dump to a SCSI device.
    ScsiDump,
    /// Interactive operating-system console.
    Dialog,
    /// Enumerate the images of the server.
    List,
    /// Query image status.
    GetStatus,
}

impl ImageOp {
    /// Lowercase operation name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Stop => "stop",
            Self::Load => "load",
            Self::ScsiLoad => "scsiload",
            Self::ScsiDump => "scsidump",
            Self::Dialog => "dialog",
            Self::List => "list",
            Self::GetStatus => "getstatus",
        }
    }

    pub(crate) fn is_scsi(self) -> bool {
        matches!(self, Self::ScsiLoad | Self::ScsiDump)
    }

    pub(crate) fn is_load_family(self) -> bool {
        matches!(self, Self::Load | Self::ScsiLoad | Self::ScsiDump)
    }
}

impl fmt::Display for ImageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state force option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Force {
    /// Not given.
    #[default]
    Unset,
    /// Explicitly off.
    Off,
    /// Explicitly on.
    On,
}

impl Force {
    pub(crate) fn is_on(self) -> bool {
        self == Self::On
    }
}

/// Optional parameters of an image operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parms {
    /// Requested operation.
    pub op: Option<ImageOp>,
    /// Force the operation.
    pub force: Force,
    /// Activation profile name.
    pub profile: Option<String>,
    /// Load device address.
    pub load_address: Option<String>,
    /// Load parameter string.
    pub load_parms: Option<String>,
    /// Clear memory on load (`None` means clear unless storing status).
    pub clear: Option<bool>,
    /// Store status before load.
    pub store_status: Option<bool>,
    /// Load timeout in seconds.
    pub load_timeout: Option<u32>,
    /// SCSI world-wide port name.
    pub scsi_wwpn: Option<String>,
    /// SCSI logical unit number.
    pub scsi_lun: Option<String>,
    /// SCSI boot program selector.
    pub scsi_bps: Option<u32>,
    /// SCSI operating-system specific load parameters.
    pub scsi_ossparms: Option<String>,
    /// SCSI boot record logical block address.
    pub scsi_bootrec: Option<String>,
    /// File receiving a copy of dialog output.
    pub msg_file: Option<PathBuf>,
    /// Dialog message poll interval.
    pub msg_timeout: Option<Duration>,
    /// Deactivate grace period in seconds.
    pub shutdown_time: Option<u32>,
}

impl Parms {
    /// Parameters for the given operation with everything else unset.
    pub fn for_op(op: ImageOp) -> Self {
        Self {
            op: Some(op),
            ..Self::default()
        }
    }

    pub(crate) fn shutdown_time_or_default(&self) -> u32 {
        self.shutdown_time.unwrap_or(DEFAULT_SHUTDOWN_TIME)
    }
}

/// One managed partition or guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Name as known to the server.
    pub name: String,
    /// Optional operator-facing alias.
    pub alias: Option<String>,
}

impl Image {
    /// Create an image with no alias.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }
}

/// One hardware-management endpoint and the images it owns.
#[derive(Clone)]
pub struct Server {
    address: String,
    declared_type: String,
    user: Option<String>,
    password: Option<SecretBytes>,
    encryption: bool,
    timeout: Duration,
    port: Option<u16>,
    fingerprint: Option<String>,
    parms: Parms,
    images: Vec<Image>,
}

impl Server {
    /// Create a [`ServerBuilder`].
    pub fn builder(address: impl Into<String>, declared_type: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(address, declared_type)
    }

    /// Host name or address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Type tag as configured (matched case-insensitively).
    pub fn declared_type(&self) -> &str {
        &self.declared_type
    }

    /// User id.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub(crate) fn password(&self) -> Option<&SecretBytes> {
        self.password.as_ref()
    }

    /// Whether a password was configured.
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Whether the connection is encrypted.
    pub fn encryption(&self) -> bool {
        self.encryption
    }

    /// Per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Service port, if configured.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Pinned certificate fingerprint (colon-separated SHA-256 hex).
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Operation parameters.
    pub fn parms(&self) -> &Parms {
        &self.parms
    }

    /// Configured images.
    pub fn images(&self) -> &[Image] {
        &self.images
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("declared_type", &self.declared_type)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<secret>"))
            .field("encryption", &self.encryption)
            .field("timeout", &self.timeout)
            .field("port", &self.port)
            .field("fingerprint", &self.fingerprint)
            .field("images", &self.images.len())
            .finish()
    }
}

/// Builder for [`Server`].
#[derive(Debug)]
pub struct ServerBuilder {
    address: String,
    declared_type: String,
    user: Option<String>,
    password: Option<SecretBytes>,
    encryption: bool,
    timeout: Duration,
    port: Option<u16>,
    fingerprint: Option<String>,
    parms: Parms,
    images: Vec<Image>,
}

impl ServerBuilder {
    /// Create a new builder.
    pub fn new(address: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            declared_type: declared_type.into(),
            user: None,
            password: None,
            encryption: true,
            timeout: DEFAULT_TIMEOUT,
            port: None,
            fingerprint: None,
            parms: Parms::default(),
            images: Vec::new(),
        }
    }

    /// Set the user id.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password (bytes).
    pub fn password_bytes(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(SecretBytes::new(password.into()));
        self
    }

    /// Set the password (UTF-8 string). This is a convenience wrapper around [`Self::password_bytes`].
    pub fn password(mut self, password: impl AsRef<str>) -> Self {
        self.password = Some(SecretBytes::new(password.as_ref().as_bytes().to_vec()));
        self
    }

    /// Enable or disable encryption (on by default).
    pub fn encryption(mut self, enabled: bool) -> Self {
        self.encryption = enabled;
        self
    }

    /// Set the per-command timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the service port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Pin the server certificate fingerprint.
    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Set the operation parameters.
    pub fn parms(mut self, parms: Parms) -> Self {
        self.parms = parms;
        self
    }

    /// Add an image.
    pub fn image(mut self, name: impl Into<String>) -> Self {
        self.images.push(Image::new(name));
        self
    }

    /// Add an image with an alias.
    pub fn image_with_alias(mut self, name: impl Into<String>, alias: impl Into<String>) -> Self {
        self.images.push(Image {
            name: name.into(),
            alias: Some(alias.into()),
        });
        self
    }

    /// Validate and build the [`Server`].
    pub fn build(self) -> Result<Server> {
        if self.address.trim().is_empty() {
            return Err(Error::InvalidArgument("server address is required"));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidArgument("timeout must be greater than zero"));
        }

        Ok(Server {
            address: self.address,
            declared_type: self.declared_type,
            user: self.user,
            password: self.password,
            encryption: self.encryption,
            timeout: self.timeout,
            port: self.port,
            fingerprint: self.fingerprint,
            parms: self.parms,
            images: self.images,
        })
    }
}

/// Status word of an LPAR image.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ImageStatus(pub u32);

impl ImageStatus {
    const FLAGS: [(u32, &'static str); 21] = [
        (0x0000_0001, "operating"),
        (0x0000_0002, "not operating"),
        (0x0000_0004, "no power"),
        (0x0000_0008, "not activated"),
        (0x0000_0010, "exceptions"),
        (0x0000_0020, "status check"),
        (0x0000_0040, "service"),
        (0x0000_0080, "link not active"),
        (0x0000_0100, "power save"),
        (0x0000_0200, "serious alert"),
        (0x0000_0400, "alert"),
        (0x0000_0800, "environmental alert"),
        (0x0000_1000, "service required"),
        (0x0000_2000, "degraded"),
        (0x0000_4000, "storage exceeded"),
        (0x0000_8000, "logoff timeout"),
        (0x0001_0000, "forced sleep"),
        (0x0002_0000, "image not operating"),
        (0x0004_0000, "image not activated"),
        (0x0008_0000, "image not capable"),
        (0x8000_0000, "unknown"),
    ];

    /// Names of every set flag, in bit order.
    pub fn flags(self) -> Vec<&'static str> {
        Self::FLAGS
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }

    /// Whether the image reports itself operating.
    pub fn is_operating(self) -> bool {
        self.0 & 0x0000_0001 != 0
    }
}

impl fmt::Debug for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ImageStatus")
            .field(&format_args!("{:#010x}", self.0))
            .finish()
    }
}
