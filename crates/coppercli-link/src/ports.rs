//! Serial port enumeration, grounded in the source project's
//! `communication/serial.rs` (`SerialPortInfo`, `list_ports`).

use coppercli_core::Error;

/// A serial port discovered on the host, independent of whether anything
/// has opened it yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    pub name: String,
    pub description: Option<String>,
    pub manufacturer: Option<String>,
}

/// List serial ports currently visible to the OS.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, Error> {
    let ports = serialport::available_ports().map_err(|e| Error::other(e.to_string()))?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let (description, manufacturer) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (info.product, info.manufacturer),
                _ => (None, None),
            };
            SerialPortInfo {
                name: p.port_name,
                description,
                manufacturer,
            }
        })
        .collect())
}
