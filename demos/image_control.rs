use std::process::ExitCode;
use std::time::Duration;

use snipl::{ImageOp, Parms, Server, SessionManager};

fn parse_op(op: &str) -> Option<ImageOp> {
    let op = match op.to_ascii_lowercase().as_str() {
        "activate" | "a" => ImageOp::Activate,
        "deactivate" | "d" => ImageOp::Deactivate,
        "reset" | "r" => ImageOp::Reset,
        "stop" => ImageOp::Stop,
        "load" => ImageOp::Load,
        "dialog" => ImageOp::Dialog,
        "list" => ImageOp::List,
        "status" | "getstatus" => ImageOp::GetStatus,
        _ => return None,
    };
    Some(op)
}

fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Example:
    //   cargo run --example image_control -- VM5 zvm.example.com:44444 MAINT secret status LINUX1
    //   cargo run --example image_control -- LPAR hmc.example.com - public list
    let mut args = std::env::args().skip(1);
    let kind = args.next().ok_or("missing <LPAR|VM|VM5>")?;
    let target = args.next().ok_or("missing <address[:port]>")?;
    let user = args.next().ok_or("missing <user|->")?;
    let password = args.next().ok_or("missing <password>")?;
    let op = args.next().ok_or("missing <operation>")?;
    let op = parse_op(&op).ok_or("invalid operation")?;

    let (address, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host.to_owned(), Some(port.parse::<u16>()?)),
        None => (target, None),
    };

    let mut builder = Server::builder(address, kind.as_str())
        .password(password)
        .timeout(Duration::from_secs(30))
        .parms(Parms::for_op(op));
    if user == "-" {
        builder = builder.encryption(false);
    } else {
        builder = builder.user(user);
    }
    if let Some(port) = port {
        builder = builder.port(port);
    }
    if let Ok(fp) = std::env::var("SNIPL_FINGERPRINT") {
        builder = builder.fingerprint(fp);
    }
    for image in args {
        builder = builder.image(image);
    }
    let server = builder.build()?;

    match SessionManager::new().run(&server) {
        Ok(report) => {
            for message in report.messages() {
                println!("{message}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            for message in err.messages() {
                eprintln!("{message}");
            }
            Ok(ExitCode::from(err.code().as_i32() as u8))
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
