//! Device discovery through sysfs.

use std::fs;
use std::io;
use std::num::ParseIntError;
use std::path::PathBuf;

use log::{debug, warn};

use crate::error::{Error, ErrorKind};

const SYSFS_USB_PREFIX: &str = "/sys/bus/usb/devices/";

#[derive(Debug, Clone)]
struct SysfsPath(PathBuf);

#[derive(Debug)]
struct SysfsError(PathBuf, SysfsErrorKind);

#[derive(Debug)]
enum SysfsErrorKind {
    Io(io::Error),
    Parse(String),
}

impl std::fmt::Display for SysfsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to read sysfs attribute {}: ", self.0.display())?;
        match &self.1 {
            SysfsErrorKind::Io(e) => write!(f, "{e}"),
            SysfsErrorKind::Parse(v) => write!(f, "couldn't parse value {:?}", v.trim()),
        }
    }
}

impl SysfsPath {
    fn parse_attr<T, E>(
        &self,
        attr: &str,
        parse: impl FnOnce(&str) -> Result<T, E>,
    ) -> Result<T, SysfsError> {
        let attr_path = self.0.join(attr);
        fs::read_to_string(&attr_path)
            .map_err(SysfsErrorKind::Io)
            .and_then(|v| parse(v.trim()).map_err(|_| SysfsErrorKind::Parse(v)))
            .map_err(|e| SysfsError(attr_path, e))
    }

    fn read_attr<T: std::str::FromStr>(&self, attr: &str) -> Result<T, SysfsError> {
        self.parse_attr(attr, |s| s.parse())
    }

    fn read_attr_hex(&self, attr: &str) -> Result<u16, SysfsError> {
        self.parse_attr(attr, |s| hex_attr(s.strip_prefix("0x").unwrap_or(s)))
    }
}

fn hex_attr(s: &str) -> Result<u16, ParseIntError> {
    u16::from_str_radix(s, 16)
}

/// Scan sysfs for the first device matching the vendor/product pair and
/// return its bus number and device address, which name the usbfs node to
/// open. Devices with unreadable attributes are skipped with a warning.
pub fn find_device(vendor_id: u16, product_id: u16) -> Result<(u8, u8), Error> {
    let entries =
        fs::read_dir(SYSFS_USB_PREFIX).map_err(|e| Error::io("listing USB devices", &e))?;

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Some(name) = path.file_name() else { continue };

        // Device names look like `1-6` or `1-6.4.2`. Root hubs (`usb1`)
        // and interfaces (`1-6:1.0`) are not candidates.
        if !name
            .as_encoded_bytes()
            .iter()
            .all(|c| matches!(c, b'0'..=b'9' | b'-' | b'.'))
        {
            continue;
        }

        match probe(&SysfsPath(path), vendor_id, product_id) {
            Ok(Some((busnum, devnum))) => {
                debug!(
                    "found {vendor_id:04x}:{product_id:04x} at bus {busnum} address {devnum}"
                );
                return Ok((busnum, devnum));
            }
            Ok(None) => {}
            Err(e) => warn!("{e}; ignoring device"),
        }
    }

    Err(Error::new(ErrorKind::NotFound, "no matching USB device found"))
}

fn probe(
    device: &SysfsPath,
    vendor_id: u16,
    product_id: u16,
) -> Result<Option<(u8, u8)>, SysfsError> {
    if device.read_attr_hex("idVendor")? != vendor_id
        || device.read_attr_hex("idProduct")? != product_id
    {
        return Ok(None);
    }
    Ok(Some((
        device.read_attr("busnum")?,
        device.read_attr("devnum")?,
    )))
}
