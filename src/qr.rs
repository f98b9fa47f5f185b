//! Pairing banner for terminal display.
//!
//! The mobile client stores a plain `http://<lan-ip>:<port>` host URL and
//! derives both WebSocket endpoints from it.

use crate::gateway::{AGENT_PATH, TERMINAL_PATH};
use colored::Colorize;
use qrcode::{Color, QrCode};
use std::net::IpAddr;

/// Where mobile clients should connect
#[derive(Debug, Clone)]
pub struct PairingInfo {
    pub host: String,
    pub port: u16,
}

impl PairingInfo {
    /// Prefer the LAN address; fall back to the bind address, then localhost.
    pub fn detect(bind: &str, port: u16) -> Self {
        let host = match local_ip_address::local_ip() {
            Ok(ip) => ip.to_string(),
            Err(e) => {
                tracing::debug!("Could not determine LAN address: {}", e);
                match bind.parse::<IpAddr>() {
                    Ok(ip) if !ip.is_unspecified() => ip.to_string(),
                    _ => "127.0.0.1".to_string(),
                }
            }
        };
        Self { host, port }
    }

    pub fn host_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}:{}{}", self.host, self.port, path)
    }
}

/// Render `data` as rows of Unicode half blocks, two QR rows per line.
pub fn render_half_blocks(data: &str) -> Option<Vec<String>> {
    let code = QrCode::new(data.as_bytes()).ok()?;
    let width = code.width();
    let dark = |x: usize, y: usize| y < width && code[(x, y)] == Color::Dark;

    let rows = (0..width)
        .step_by(2)
        .map(|y| {
            (0..width)
                .map(|x| match (dark(x, y), dark(x, y + 1)) {
                    (true, true) => '█',
                    (true, false) => '▀',
                    (false, true) => '▄',
                    (false, false) => ' ',
                })
                .collect()
        })
        .collect();
    Some(rows)
}

pub fn display_banner(info: &PairingInfo, show_qr: bool) {
    println!();
    println!("  {}", "mobiledev is running".green().bold());

    if show_qr {
        println!();
        println!("  {}", "Scan to connect from mobile:".cyan().bold());
        match render_half_blocks(&info.host_url()) {
            Some(rows) => {
                for row in rows {
                    println!("  {}", row);
                }
            }
            None => println!("  (QR generation failed - use URL below)"),
        }
    }

    println!();
    println!("  {} {}", "Host:    ".dimmed(), info.host_url().green());
    println!("  {} {}", "Terminal:".dimmed(), info.ws_url(TERMINAL_PATH));
    println!("  {} {}", "Agent:   ".dimmed(), info.ws_url(AGENT_PATH));
    println!();
}
