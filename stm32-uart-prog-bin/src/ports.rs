use std::io::{self, Write};

use anyhow::{bail, Context};

/// Lists available serial ports and prompts the operator to pick one by
/// index, looping on invalid input. Bails if no ports are present.
pub fn select_port() -> anyhow::Result<String> {
    let ports = serialport::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        bail!("no serial ports found");
    }

    println!("Available ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("\t[{i}] - {}: {}", port.port_name, describe(&port.port_type));
    }

    loop {
        print!("Which port to use? ");
        io::stdout().flush().ok();
        let mut line = String::new();
        io::stdin().read_line(&mut line).context("reading port selection")?;
        let trimmed = line.trim();
        match trimmed.parse::<usize>() {
            Ok(index) if index < ports.len() => return Ok(ports[index].port_name.clone()),
            Ok(_) => println!("Invalid selection: enter a number between 0 and {}", ports.len() - 1),
            Err(_) => println!("Invalid input: enter a non-negative integer"),
        }
    }
}

fn describe(port_type: &serialport::SerialPortType) -> String {
    match port_type {
        serialport::SerialPortType::UsbPort(info) => {
            let product = info.product.clone().unwrap_or_default();
            format!("USB {:04x}:{:04x} {product}", info.vid, info.pid)
        }
        serialport::SerialPortType::PciPort => "PCI port".to_string(),
        serialport::SerialPortType::BluetoothPort => "Bluetooth port".to_string(),
        serialport::SerialPortType::Unknown => "unknown".to_string(),
    }
}

/// Prompts the operator a yes/no question, looping until an unambiguous
/// answer is given. Returns `false` (treated as "no") on a read error.
pub fn confirm(question: &str) -> bool {
    loop {
        println!("\n{question} (yes/no)");
        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        match line.trim().to_lowercase().as_str() {
            "yes" => return true,
            "no" => return false,
            _ => continue,
        }
    }
}
