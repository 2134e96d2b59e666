//! Programmer info and port listing command implementations.

use {
    crate::Settings,
    anyhow::{Context, Result},
    console::style,
    smsprog::{
        CartridgeInfo, CartridgeKind, NativePortEnumerator, PortEnumerator, RomHeader,
    },
};

/// One-line description of the cartridge.
pub(crate) fn describe_cartridge(info: &CartridgeInfo) -> String {
    let kind = match info.kind {
        CartridgeKind::Rom => "ROM cartridge".to_string(),
        CartridgeKind::Flash { supported } => {
            let chip = info.chip.as_deref().unwrap_or("unknown chip");
            if supported {
                format!("Flash cartridge ({chip})")
            } else {
                format!("Flash cartridge ({chip}, not supported)")
            }
        },
        CartridgeKind::Unknown => "Unknown cartridge type".to_string(),
    };
    match info.rom_size {
        Some(size) => format!("{kind}, {} KiB", size / 1024),
        None => kind,
    }
}

/// Short description of the headers in a ROM image.
pub(crate) fn describe_image(image: &[u8]) -> &'static str {
    let header = RomHeader::inspect(image);
    match (header.tmr_sega, header.sdsc) {
        (true, true) => "TMR SEGA and SDSC headers",
        (true, false) => "TMR SEGA header",
        (false, true) => "SDSC header",
        (false, false) => "no header",
    }
}

/// Info command implementation.
pub(crate) fn cmd_info(settings: &Settings, json: bool) -> Result<()> {
    let mut session = settings.open_session()?;
    let caps = session
        .capabilities()
        .context("Could not query the firmware version")?
        .clone();
    let info = session
        .cartridge_info()
        .context("Could not identify the cartridge")?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "port": settings.port,
                "firmware": caps,
                "cartridge": info,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Programmer").bold().underlined());
    eprintln!("  Port: {}", style(&settings.port).cyan());
    eprintln!("  Firmware: {}", caps.version);
    let commands: Vec<&str> = caps
        .commands
        .iter()
        .map(|c| c.name())
        .collect();
    if commands.is_empty() {
        eprintln!("  Extended commands: {}", style("none").dim());
    } else {
        eprintln!("  Extended commands: {}", commands.join(", "));
    }

    eprintln!("\n{}", style("Cartridge").bold().underlined());
    eprintln!("  {}", describe_cartridge(&info));
    if info.kind.is_writable() {
        eprintln!("  {} Erasable and programmable", style("✓").green());
    }

    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports()?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            vid_pid,
            product
        );
    }

    Ok(())
}
