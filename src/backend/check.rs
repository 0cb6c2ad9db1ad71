//! Structural checks run before any connection is opened.

use crate::error::{ClassifiedError, ErrorKind, Findings, ReturnCode};
use crate::types::{Force, ImageOp, Parms, Server};

const MAX_PASSWORD: usize = 16;
const MAX_PROFILE: usize = 16;
const MAX_LOAD_PARMS: usize = 8;
const MAX_SCSI_LOAD_ADDRESS: usize = 5;
const MAX_HEX_FIELD: usize = 16;
const MAX_IMAGE_NAME: usize = 80;
const MAX_BPS: u32 = 30;
const LOAD_TIMEOUT_RANGE: std::ops::RangeInclusive<u32> = 60..=600;

type CheckResult = Result<(), ClassifiedError>;

/// Validate an LPAR-type server.
///
/// Every violation is reported; the code of the last one is returned. The
/// shared-device rule is evaluated last so it decides the code whenever it fires.
pub fn check_lpar(server: &Server) -> CheckResult {
    let mut f = Findings::new();
    let p = server.parms();
    let op = p.op;

    if server.encryption() {
        f.fail(
            ReturnCode::InvalidParameterValue,
            "encrypted LPAR-type server connections are not supported by the SNMPv2c event channel",
        );
    }
    if server.user().is_some() && !server.encryption() {
        f.fail(
            ReturnCode::UserNameEncryptionOff,
            "option --userid must not be specified for unencrypted LPAR-type server connection",
        );
    }
    if server.encryption() && server.user().is_none() {
        f.fail(
            ReturnCode::NoUserName,
            "option --userid must be specified for encrypted LPAR-type server connection",
        );
    }
    if server.port().is_some() {
        f.fail(
            ReturnCode::ConflictingOptions,
            "option --port must not be specified for an LPAR-type server",
        );
    }
    match server.password() {
        Some(pw) if pw.len() > MAX_PASSWORD => f.fail(
            ReturnCode::InvalidParameterValue,
            "password too long - maximum size is 16 characters",
        ),
        Some(_) => {}
        None => f.fail(
            ReturnCode::MissingPassword,
            "option --password must be specified",
        ),
    }

    if let Some(t) = p.msg_timeout {
        if op != Some(ImageOp::Dialog) {
            f.fail(
                ReturnCode::ConflictingOptions,
                "option --msgtimeout can only be specified for command --dialog",
            );
        }
        if t.as_secs() < 1 {
            f.fail(
                ReturnCode::InvalidParameterValue,
                format!("msgtimeout value {} is zero or too small", t.as_secs()),
            );
        }
    }
    if p.msg_file.is_some() && op != Some(ImageOp::Dialog) {
        f.fail(
            ReturnCode::ConflictingOptions,
            "option --msgfilename can only be specified for command --dialog",
        );
    }

    if let Some(profile) = &p.profile {
        if op != Some(ImageOp::Activate) {
            f.fail(
                ReturnCode::ConflictingOptions,
                "option --profile can only be specified for command --activate",
            );
        }
        if profile.len() > MAX_PROFILE {
            f.fail(
                ReturnCode::InvalidParameterValue,
                format!("profile_name {profile} too long - maximum size is 16 characters"),
            );
        }
    }

    check_load_options(&mut f, p);
    check_scsi_options(&mut f, p);

    for image in server.images() {
        if image.name.len() > MAX_IMAGE_NAME {
            f.fail(
                ReturnCode::InvalidParameterValue,
                format!(
                    "image_name {} too long - maximum size is 80 characters",
                    image.name
                ),
            );
        }
    }

    if server.images().len() > 1
        && p.force != Force::On
        && (p.load_address.is_some() || p.scsi_wwpn.is_some() || p.scsi_lun.is_some())
    {
        let op_name = op.map_or("the", |o| o.as_str());
        f.fail(
            ReturnCode::MoreThanOneImage,
            format!(
                "More than one image name specified for {op_name} operation with the load \
                 address or SCSI WWPN or SCSI LUN specified without -F (--force) parameter."
            ),
        );
    }

    f.into_result()
}

fn check_load_options(f: &mut Findings, p: &Parms) {
    let op = p.op;
    let load_family = op.is_some_and(ImageOp::is_load_family);

    if !load_family {
        if p.load_address.is_some() {
            f.fail(
                ReturnCode::ConflictingOptions,
                "option --address_load can only be specified for commands --load, --scsiload, and --scsidump",
            );
        }
        if p.load_parms.is_some() {
            f.fail(
                ReturnCode::ConflictingOptions,
                "option --parameters_load can only be specified for command --load, --scsiload, and --scsidump",
            );
        }
    }
    if op != Some(ImageOp::Load) {
        if p.clear.is_some() {
            f.fail(
                ReturnCode::ConflictingOptions,
                "option --noclear can only be specified for command --load",
            );
        }
        if p.store_status.is_some() {
            f.fail(
                ReturnCode::ConflictingOptions,
                "option --storestatus can only be specified for command --load",
            );
        }
        if p.load_timeout.is_some() {
            f.fail(
                ReturnCode::ConflictingOptions,
                "option --load_timeout can only be specified for command --load",
            );
        }
    }
    if let Some(parms) = &p.load_parms {
        if parms.len() > MAX_LOAD_PARMS {
            f.fail(
                ReturnCode::InvalidParameterValue,
                format!("parameters_load {parms} too long - maximum length is 8"),
            );
        }
    }
    if let Some(t) = p.load_timeout {
        if t < *LOAD_TIMEOUT_RANGE.start() {
            f.fail(
                ReturnCode::InvalidParameterValue,
                format!("load_timeout value {t} too small - minimum value is 60"),
            );
        } else if t > *LOAD_TIMEOUT_RANGE.end() {
            f.fail(
                ReturnCode::InvalidParameterValue,
                format!("load_timeout value {t} too large - maximum value is 600"),
            );
        }
    }
}

fn check_scsi_options(f: &mut Findings, p: &Parms) {
    let scsi = p.op.is_some_and(ImageOp::is_scsi);

    if scsi {
        if let Some(addr) = &p.load_address {
            if addr.len() > MAX_SCSI_LOAD_ADDRESS {
                f.fail(
                    ReturnCode::InvalidParameterValue,
                    format!(
                        "load_address {addr} too long - maximum size when using SCSI load is 5 characters"
                    ),
                );
            }
        }
    } else {
        let given = [
            ("wwpn_scsiload", p.scsi_wwpn.is_some()),
            ("lun_scsiload", p.scsi_lun.is_some()),
            ("bps_scsiload", p.scsi_bps.is_some()),
            ("ossparms_scsiload", p.scsi_ossparms.is_some()),
            ("bootrecord_scsiload", p.scsi_bootrec.is_some()),
        ];
        for (name, _) in given.iter().filter(|(_, set)| *set) {
            f.fail(
                ReturnCode::ConflictingOptions,
                format!(
                    "option --{name} can only be specified for commands --scsiload and --scsidump"
                ),
            );
        }
    }

    for (name, value) in [
        ("wwpn_scsiload", &p.scsi_wwpn),
        ("lun_scsiload", &p.scsi_lun),
        ("bootrecord_scsiload", &p.scsi_bootrec),
    ] {
        let Some(v) = value else { continue };
        if v.len() > MAX_HEX_FIELD {
            f.fail(
                ReturnCode::InvalidParameterValue,
                format!("{name} {v} too long - maximum length is 16"),
            );
        } else if !v.chars().all(|c| c.is_ascii_hexdigit()) {
            f.fail(
                ReturnCode::InvalidParameterValue,
                format!("{name} {v} is not a hexadecimal number"),
            );
        }
    }
    if let Some(bps) = p.scsi_bps {
        if bps > MAX_BPS {
            f.fail(
                ReturnCode::InvalidParameterValue,
                format!("bps_scsiload value {bps} too large - maximum value is 30"),
            );
        }
    }
}

/// Validate a VM-type server. The first violation is returned.
pub fn check_vm(server: &Server) -> CheckResult {
    let fail = |code, msg: String| Err(ClassifiedError::new(ErrorKind::Validation, code, msg));
    let p = server.parms();

    if server.address().is_empty() {
        return fail(ReturnCode::MissingServer, "Error: missing VM server address".to_owned());
    }
    if server.user().is_none() {
        return fail(
            ReturnCode::MissingUserId,
            format!("Error: missing Userid for VM server {}", server.address()),
        );
    }
    if !server.has_password() {
        return fail(
            ReturnCode::MissingPassword,
            format!("Error: missing Password for VM server {}", server.address()),
        );
    }
    if p.force != Force::Unset && p.op != Some(ImageOp::Deactivate) {
        return fail(
            ReturnCode::ConflictingOptions,
            "For a VM-type server, option force may only be specified in conjunction with the \
             deactivate command"
                .to_owned(),
        );
    }

    let lpar_only = [
        ("profile", p.profile.is_some()),
        ("load_address", p.load_address.is_some()),
        ("load_parms", p.load_parms.is_some()),
        ("noclear", p.clear.is_some()),
        ("storestatus", p.store_status.is_some()),
        ("load_timeout", p.load_timeout.is_some()),
        ("msg_timeout", p.msg_timeout.is_some()),
        ("msg_filename", p.msg_file.is_some()),
        ("scsiload_wwpn", p.scsi_wwpn.is_some()),
        ("scsiload_lun", p.scsi_lun.is_some()),
        ("scsiload_bps", p.scsi_bps.is_some()),
        ("scsiload_ossparms", p.scsi_ossparms.is_some()),
        ("scsiload_bootrec", p.scsi_bootrec.is_some()),
    ];
    if let Some((name, _)) = lpar_only.iter().find(|(_, set)| *set) {
        return fail(
            ReturnCode::ConflictingOptions,
            format!("option {name} must not be specified for a VM-type server"),
        );
    }

    if let Some(op) = p.op {
        if matches!(
            op,
            ImageOp::Stop
                | ImageOp::Load
                | ImageOp::ScsiLoad
                | ImageOp::ScsiDump
                | ImageOp::Dialog
                | ImageOp::List
        ) {
            return fail(
                ReturnCode::ConflictingOptions,
                format!(
                    "{} operation must not be specified for a VM-type server",
                    op.as_str().to_ascii_uppercase()
                ),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lpar(parms: Parms) -> crate::types::ServerBuilder {
        Server::builder("10.0.0.1", "LPAR")
            .encryption(false)
            .password("pw")
            .parms(parms)
    }

    #[test]
    fn valid_lpar_activate_passes() {
        let mut parms = Parms::for_op(ImageOp::Activate);
        parms.profile = Some("DEFAULT".to_owned());
        let server = lpar(parms).image("LPAR1").build().expect("server");
        assert!(check_lpar(&server).is_ok());
    }

    #[test]
    fn shared_load_address_wins_over_conflicts() {
        let mut parms = Parms::for_op(ImageOp::Deactivate);
        parms.load_address = Some("5C00".to_owned());
        let server = lpar(parms)
            .image("LPAR1")
            .image("LPAR2")
            .build()
            .expect("server");

        let err = check_lpar(&server).expect_err("expected failure");
        assert_eq!(err.code(), ReturnCode::MoreThanOneImage);
        assert_eq!(err.messages().len(), 2);
    }

    #[test]
    fn force_allows_shared_device() {
        let mut parms = Parms::for_op(ImageOp::Load);
        parms.load_address = Some("5C00".to_owned());
        parms.force = Force::On;
        let server = lpar(parms)
            .image("LPAR1")
            .image("LPAR2")
            .build()
            .expect("server");
        assert!(check_lpar(&server).is_ok());
    }

    #[test]
    fn encryption_requires_user() {
        let server = Server::builder("10.0.0.1", "LPAR")
            .password("pw")
            .parms(Parms::for_op(ImageOp::Reset))
            .image("LPAR1")
            .build()
            .expect("server");
        let err = check_lpar(&server).expect_err("expected failure");
        assert_eq!(err.code(), ReturnCode::NoUserName);
        assert_eq!(err.messages().len(), 2);
    }

    #[test]
    fn encrypted_lpar_is_rejected_before_login() {
        let server = Server::builder("127.0.0.1", "LPAR")
            .user("operator")
            .password("secret")
            .parms(Parms::for_op(ImageOp::Activate))
            .image("LPAR1")
            .build()
            .expect("server");
        let err = check_lpar(&server).expect_err("expected failure");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.code(), ReturnCode::InvalidParameterValue);
        assert_eq!(
            err.messages(),
            ["encrypted LPAR-type server connections are not supported by the SNMPv2c event channel"]
        );
    }

    #[test]
    fn load_limits_are_enforced() {
        let mut parms = Parms::for_op(ImageOp::Load);
        parms.load_parms = Some("TOOLONGPARM".to_owned());
        parms.load_timeout = Some(30);
        let server = lpar(parms).image("LPAR1").build().expect("server");
        let err = check_lpar(&server).expect_err("expected failure");
        assert_eq!(err.code(), ReturnCode::InvalidParameterValue);
        assert_eq!(err.messages().len(), 2);
    }

    #[test]
    fn scsi_fields_need_scsi_ops_and_hex() {
        let mut parms = Parms::for_op(ImageOp::Load);
        parms.scsi_lun = Some("0001".to_owned());
        let server = lpar(parms).image("LPAR1").build().expect("server");
        let err = check_lpar(&server).expect_err("expected failure");
        assert_eq!(err.code(), ReturnCode::ConflictingOptions);

        let mut parms = Parms::for_op(ImageOp::ScsiLoad);
        parms.scsi_wwpn = Some("50050763zz".to_owned());
        let server = lpar(parms).image("LPAR1").build().expect("server");
        let err = check_lpar(&server).expect_err("expected failure");
        assert_eq!(err.code(), ReturnCode::InvalidParameterValue);
    }

    #[test]
    fn msg_timeout_only_with_dialog() {
        let mut parms = Parms::for_op(ImageOp::Reset);
        parms.msg_timeout = Some(Duration::from_secs(5));
        let server = lpar(parms).image("LPAR1").build().expect("server");
        let err = check_lpar(&server).expect_err("expected failure");
        assert_eq!(err.code(), ReturnCode::ConflictingOptions);
    }

    fn vm(parms: Parms) -> crate::types::ServerBuilder {
        Server::builder("vmhost", "VM").parms(parms).image("LINUX1")
    }

    #[test]
    fn vm_requires_user_then_password() {
        let server = vm(Parms::for_op(ImageOp::Activate))
            .build()
            .expect("server");
        let err = check_vm(&server).expect_err("expected failure");
        assert_eq!(err.code(), ReturnCode::MissingUserId);
        assert_eq!(err.messages(), ["Error: missing Userid for VM server vmhost"]);

        let server = vm(Parms::for_op(ImageOp::Activate))
            .user("MAINT")
            .build()
            .expect("server");
        assert_eq!(
            check_vm(&server).expect_err("expected failure").code(),
            ReturnCode::MissingPassword
        );
    }

    #[test]
    fn vm_rejects_force_outside_deactivate_and_lpar_ops() {
        let mut parms = Parms::for_op(ImageOp::Reset);
        parms.force = Force::On;
        let server = vm(parms).user("u").password("p").build().expect("server");
        assert_eq!(
            check_vm(&server).expect_err("expected failure").code(),
            ReturnCode::ConflictingOptions
        );

        let server = vm(Parms::for_op(ImageOp::Stop))
            .user("u")
            .password("p")
            .build()
            .expect("server");
        let err = check_vm(&server).expect_err("expected failure");
        assert_eq!(
            err.messages(),
            ["STOP operation must not be specified for a VM-type server"]
        );

        let mut parms = Parms::for_op(ImageOp::Deactivate);
        parms.force = Force::On;
        let server = vm(parms).user("u").password("p").build().expect("server");
        assert!(check_vm(&server).is_ok());
    }
}
