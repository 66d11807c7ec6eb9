use std::env;
use std::os::fd::{AsFd, OwnedFd};
use std::process::ExitCode;

use usbcat::{usbfs, Bridge, BridgeConfig, DEFAULT_QUEUE_DEPTH, DEFAULT_TRANSFER_SIZE};

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    vendor: Option<u16>,
    product: Option<u16>,
    interface: u8,
    detach: bool,
    read_endpoint: Option<u8>,
    write_endpoint: Option<u8>,
    help: bool,
}

impl Args {
    fn parse(mut argv: impl Iterator<Item = String>) -> Result<Args, String> {
        let mut args = Args::default();
        while let Some(arg) = argv.next() {
            match arg.as_str() {
                "-v" => args.vendor = Some(parse_id(&value(&mut argv, "-v")?)?),
                "-p" => args.product = Some(parse_id(&value(&mut argv, "-p")?)?),
                "-i" => args.interface = parse_byte(&value(&mut argv, "-i")?)?,
                "-r" => args.read_endpoint = Some(parse_byte(&value(&mut argv, "-r")?)?),
                "-w" => args.write_endpoint = Some(parse_byte(&value(&mut argv, "-w")?)?),
                "-d" | "--detach" => args.detach = true,
                "-h" | "--help" => args.help = true,
                _ => return Err(format!("unknown option {arg:?}")),
            }
        }
        Ok(args)
    }
}

fn value(argv: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    argv.next().ok_or_else(|| format!("missing value for {flag}"))
}

fn parse_num(s: &str) -> Result<u32, String> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|_| format!("invalid number {s:?}"))
}

fn parse_id(s: &str) -> Result<u16, String> {
    parse_num(s)?
        .try_into()
        .map_err(|_| format!("number {s:?} out of range"))
}

fn parse_byte(s: &str) -> Result<u8, String> {
    parse_num(s)?
        .try_into()
        .map_err(|_| format!("number {s:?} out of range"))
}

fn usage() {
    eprintln!(
        "Usage: usbcat [-d] -v vendor-id -p product-id [-i interface] [-r read-endpoint] [-w write-endpoint]"
    );
}

fn help() {
    println!(
        "Read or write raw data to USB bulk endpoints.

  -v vendor-id       Device vendor ID (hex with 0x prefix, or decimal)
  -p product-id      Device product ID
  -i interface       Interface number to claim, default 0
  -d, --detach       Detach the kernel driver from the interface
  -r read-endpoint   IN endpoint address (bit 7 set, e.g. 0x81); received
                     data is written to standard output
  -w write-endpoint  OUT endpoint address; standard input is sent to it
  -h, --help         Show this help

At least one endpoint must be given; with both, usbcat runs
bidirectionally. usbcat exits once standard input closes and all accepted
data has been handed to the device, or on the first transfer fault."
    );
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::parse(env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("usbcat: {message}");
            usage();
            return ExitCode::FAILURE;
        }
    };

    if args.help {
        help();
        return ExitCode::SUCCESS;
    }

    let (Some(vendor), Some(product)) = (args.vendor, args.product) else {
        eprintln!("usbcat: vendor and product IDs must be specified");
        usage();
        return ExitCode::FAILURE;
    };
    if args.read_endpoint.is_none() && args.write_endpoint.is_none() {
        eprintln!("usbcat: at least one endpoint must be specified");
        usage();
        return ExitCode::FAILURE;
    }

    match run(vendor, product, &args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("usbcat: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(vendor: u16, product: u16, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let (busnum, devnum) = usbfs::find_device(vendor, product)?;
    let mut device = usbfs::Device::open(busnum, devnum)?;
    if args.detach {
        device.detach_and_claim_interface(args.interface)?;
    } else {
        device.claim_interface(args.interface)?;
    }

    let source = match args.write_endpoint {
        Some(endpoint) => Some((stdio_fd(&std::io::stdin())?, endpoint)),
        None => None,
    };
    let sink = match args.read_endpoint {
        Some(endpoint) => Some((endpoint, stdio_fd(&std::io::stdout())?)),
        None => None,
    };

    let config = BridgeConfig {
        source,
        sink,
        transfer_size: DEFAULT_TRANSFER_SIZE,
        queue_depth: DEFAULT_QUEUE_DEPTH,
    };
    Ok(Bridge::new(usbfs::UsbfsTransport::new(device), config)?.run()?)
}

fn stdio_fd(stream: &impl AsFd) -> std::io::Result<OwnedFd> {
    stream.as_fd().try_clone_to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, String> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_a_bidirectional_invocation() {
        let args = parse(&["-d", "-v", "0x59e3", "-p", "0x0a23", "-i", "1", "-r", "0x81", "-w", "2"])
            .unwrap();
        assert_eq!(
            args,
            Args {
                vendor: Some(0x59e3),
                product: Some(0x0a23),
                interface: 1,
                detach: true,
                read_endpoint: Some(0x81),
                write_endpoint: Some(2),
                help: false,
            }
        );
    }

    #[test]
    fn accepts_decimal_ids() {
        let args = parse(&["-v", "1155", "-p", "22336"]).unwrap();
        assert_eq!(args.vendor, Some(1155));
        assert_eq!(args.product, Some(22336));
    }

    #[test]
    fn rejects_a_flag_without_its_value() {
        assert!(parse(&["-v"]).is_err());
    }

    #[test]
    fn rejects_unknown_options() {
        assert!(parse(&["--frobnicate"]).is_err());
    }

    #[test]
    fn rejects_out_of_range_endpoints() {
        assert!(parse(&["-r", "0x181"]).is_err());
    }
}
